//! Streaming frame codec for `tokio_util::codec::Framed`
//!
//! A `Framed` stream ends after its decoder returns `Err`, so only framing
//! fatal errors are returned that way. Errors confined to one frame (bad
//! checksum, bad command, malformed payload) are yielded as `Ok(Some(Err(_)))`
//! after the whole frame has been consumed; the connection decides whether to
//! keep reading.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::network::error::DecodeError;
use crate::network::protocol::{
    MessageHeader, NetworkMagic, ProtocolMessage, ProtocolParser, MAX_PROTOCOL_MESSAGE_LENGTH,
    MESSAGE_HEADER_LEN,
};

/// Decoded frame or the error confined to it
pub type FrameResult = Result<ProtocolMessage, DecodeError>;

struct PendingFrame {
    header: MessageHeader,
    /// Set when the header was readable but invalid
    poisoned: Option<DecodeError>,
}

/// Frame codec bound to one network magic
pub struct MessageCodec {
    magic: NetworkMagic,
    pending: Option<PendingFrame>,
}

impl MessageCodec {
    pub fn new(magic: NetworkMagic) -> Self {
        Self {
            magic,
            pending: None,
        }
    }

    pub fn magic(&self) -> NetworkMagic {
        self.magic
    }

    fn read_header(&self, src: &BytesMut) -> Result<PendingFrame, DecodeError> {
        let mut raw = [0u8; MESSAGE_HEADER_LEN];
        raw.copy_from_slice(&src[..MESSAGE_HEADER_LEN]);

        match ProtocolParser::parse_header(self.magic, &raw) {
            Ok(header) => Ok(PendingFrame {
                header,
                poisoned: None,
            }),
            Err(DecodeError::InvalidCommand(command)) => {
                // Length is still trustworthy enough to skip the frame.
                let length = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]);
                if length as usize > MAX_PROTOCOL_MESSAGE_LENGTH {
                    return Err(DecodeError::PayloadTooLarge {
                        command,
                        len: length as usize,
                        max: MAX_PROTOCOL_MESSAGE_LENGTH,
                    });
                }
                Ok(PendingFrame {
                    header: MessageHeader {
                        magic: self.magic.0,
                        command: command.clone(),
                        length,
                        checksum: [0u8; 4],
                    },
                    poisoned: Some(DecodeError::InvalidCommand(command)),
                })
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for MessageCodec {
    type Item = FrameResult;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() {
            if src.len() < MESSAGE_HEADER_LEN {
                return Ok(None);
            }
            let frame = self.read_header(src)?;
            src.advance(MESSAGE_HEADER_LEN);
            self.pending = Some(frame);
        }

        let needed = match &self.pending {
            Some(frame) => frame.header.length as usize,
            None => return Ok(None),
        };
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        let payload = src.split_to(needed);
        let Some(frame) = self.pending.take() else {
            return Ok(None);
        };
        if let Some(err) = frame.poisoned {
            return Ok(Some(Err(err)));
        }
        Ok(Some(ProtocolParser::parse_payload(&frame.header, &payload)))
    }
}

impl Encoder<ProtocolMessage> for MessageCodec {
    type Error = DecodeError;

    fn encode(&mut self, item: ProtocolMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ProtocolParser::encode_frame(self.magic, &item, dst)
    }
}
