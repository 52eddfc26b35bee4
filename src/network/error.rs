//! Wire decode errors

use thiserror::Error;

/// Errors raised while decoding frames or payloads
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Not enough bytes for the field being read
    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// Header checksum does not match the payload
    #[error(
        "checksum mismatch for '{command}': header has {}, payload hashes to {}",
        hex::encode(.expected),
        hex::encode(.actual)
    )]
    ChecksumMismatch {
        command: String,
        expected: [u8; 4],
        actual: [u8; 4],
    },

    /// Command field is not NUL-padded printable ASCII
    #[error("invalid command field {0}")]
    InvalidCommand(String),

    /// Frame starts with the wrong network magic
    #[error("bad network magic {}, expected {}", hex::encode(.found), hex::encode(.expected))]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    /// Length field exceeds the limit for this command
    #[error("payload of {len} bytes exceeds the {max} byte limit for '{command}'")]
    PayloadTooLarge {
        command: String,
        len: usize,
        max: usize,
    },

    /// CompactSize not in its shortest form
    #[error("non-canonical CompactSize encoding")]
    NonCanonicalCompactSize,

    /// Sequence count larger than allowed or than the bytes left
    #[error("{what} count {count} exceeds limit {max}")]
    OversizedSequence {
        what: &'static str,
        count: u64,
        max: u64,
    },

    /// String field is not UTF-8
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Bytes left over after a fixed-layout payload
    #[error("{count} trailing bytes after '{command}' payload")]
    TrailingBytes { command: String, count: usize },

    /// Underlying stream failed
    #[error("I/O error while reading frame: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Whether frame boundaries are lost after this error
    ///
    /// A bad magic or an oversize length leaves no way to find the next
    /// frame, so the connection must be dropped. Other errors only poison the
    /// frame they occurred in.
    pub fn is_framing_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::BadMagic { .. } | DecodeError::PayloadTooLarge { .. } | DecodeError::Io(_)
        )
    }
}
