//! Bitcoin protocol message handling
//!
//! Frame layout and typed payloads for the P2P messages the harness speaks.
//! A frame is `magic(4) | command(12, NUL padded) | length(4) | checksum(4) |
//! payload`, where the checksum is the first four bytes of the payload's
//! double SHA256.

use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::chain::{Block, BlockHeader, Hash256, Transaction};
use crate::network::encoding::{
    read_array, read_compact_size, read_count, read_i32, read_i64, read_u16_be, read_u32,
    read_u64, read_u8, read_var_str, read_vec, write_compact_size, write_var_str, write_vec,
    Decodable, Encodable,
};
use crate::network::error::DecodeError;

/// Network magics (Bitcoin Cash family)
pub const MAGIC_MAINNET: [u8; 4] = [0xe3, 0xe1, 0xf3, 0xe8];
pub const MAGIC_TESTNET: [u8; 4] = [0xf4, 0xe5, 0xf3, 0xf4];
pub const MAGIC_REGTEST: [u8; 4] = [0xda, 0xb5, 0xbf, 0xfa];

/// Protocol version advertised by default
pub const PROTOCOL_VERSION: i32 = 70015;

/// Maximum protocol message size (32MB)
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

/// Frame header size
pub const MESSAGE_HEADER_LEN: usize = 24;

/// Command field width
pub const COMMAND_LEN: usize = 12;

/// Entries allowed in inv/getdata/notfound
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Headers allowed in one headers message
pub const MAX_HEADERS_RESULTS: u64 = 2_000;

/// Hashes allowed in a block locator
pub const MAX_LOCATOR_SIZE: u64 = 101;

/// Entries allowed in one addr message
pub const MAX_ADDR_ENTRIES: u64 = 1_000;

/// Longest user agent accepted in a version message
pub const MAX_USER_AGENT_LEN: usize = 256;

/// Service bit for full nodes
pub const NODE_NETWORK: u64 = 1;

/// Inventory types
pub const MSG_ERROR: u32 = 0;
pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_FILTERED_BLOCK: u32 = 3;
pub const MSG_CMPCT_BLOCK: u32 = 4;

/// Four-byte network identifier at the start of every frame
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkMagic(pub [u8; 4]);

impl NetworkMagic {
    pub const MAINNET: NetworkMagic = NetworkMagic(MAGIC_MAINNET);
    pub const TESTNET: NetworkMagic = NetworkMagic(MAGIC_TESTNET);
    pub const REGTEST: NetworkMagic = NetworkMagic(MAGIC_REGTEST);

    pub fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl Default for NetworkMagic {
    fn default() -> Self {
        Self::REGTEST
    }
}

impl FromStr for NetworkMagic {
    type Err = String;

    /// Accepts `mainnet`, `testnet`, `regtest` or 8 hex digits
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::MAINNET),
            "testnet" | "test" => Ok(Self::TESTNET),
            "regtest" => Ok(Self::REGTEST),
            other => {
                let mut bytes = [0u8; 4];
                hex::decode_to_slice(other.trim_start_matches("0x"), &mut bytes)
                    .map_err(|e| format!("invalid network magic '{}': {}", s, e))?;
                Ok(NetworkMagic(bytes))
            }
        }
    }
}

impl fmt::Display for NetworkMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NetworkMagic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkMagic({})", self)
    }
}

/// Network address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    /// Big-endian on the wire, unlike every other integer
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// All-zero address used when the real one is unknown
    pub fn unspecified() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.ip);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl Encodable for NetworkAddress {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.services);
        buf.put_slice(&self.ip);
        buf.put_u16(self.port);
    }
}

impl Decodable for NetworkAddress {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(NetworkAddress {
            services: read_u64(buf, "address services")?,
            ip: read_array(buf, "address ip")?,
            port: read_u16_be(buf, "address port")?,
        })
    }
}

/// Version message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_u64_le(self.services);
        buf.put_i64_le(self.timestamp);
        self.addr_recv.consensus_encode(buf);
        self.addr_from.consensus_encode(buf);
        buf.put_u64_le(self.nonce);
        write_var_str(buf, &self.user_agent);
        buf.put_i32_le(self.start_height);
        buf.put_u8(u8::from(self.relay));
    }
}

impl Decodable for VersionMessage {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let version = read_i32(buf, "protocol version")?;
        let services = read_u64(buf, "services")?;
        let timestamp = read_i64(buf, "timestamp")?;
        let addr_recv = NetworkAddress::consensus_decode(buf)?;
        let addr_from = NetworkAddress::consensus_decode(buf)?;
        let nonce = read_u64(buf, "version nonce")?;
        let user_agent = read_var_str(buf, "user agent")?;
        if user_agent.len() > MAX_USER_AGENT_LEN {
            return Err(DecodeError::OversizedSequence {
                what: "user agent",
                count: user_agent.len() as u64,
                max: MAX_USER_AGENT_LEN as u64,
            });
        }
        let start_height = read_i32(buf, "start height")?;
        // Relay flag is optional (absent before BIP37 peers)
        let relay = if buf.is_empty() {
            true
        } else {
            read_u8(buf, "relay")? != 0
        };
        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// Inventory item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl InventoryItem {
    pub fn tx(txid: Hash256) -> Self {
        Self {
            inv_type: MSG_TX,
            hash: txid,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_BLOCK,
            hash,
        }
    }
}

impl Encodable for InventoryItem {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.inv_type);
        self.hash.consensus_encode(buf);
    }
}

impl Decodable for InventoryItem {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(InventoryItem {
            inv_type: read_u32(buf, "inventory type")?,
            hash: Hash256::consensus_decode(buf)?,
        })
    }
}

/// Block locator request shared by getheaders and getblocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub block_locator_hashes: Vec<Hash256>,
    pub hash_stop: Hash256,
}

/// Get blocks message
pub type GetBlocksMessage = GetHeadersMessage;

impl Encodable for GetHeadersMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.version);
        write_vec(buf, &self.block_locator_hashes);
        self.hash_stop.consensus_encode(buf);
    }
}

impl Decodable for GetHeadersMessage {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(GetHeadersMessage {
            version: read_u32(buf, "locator version")?,
            block_locator_hashes: read_vec(buf, "block locator", MAX_LOCATOR_SIZE, 32)?,
            hash_stop: Hash256::consensus_decode(buf)?,
        })
    }
}

/// Reject codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
    Other(u8),
}

impl RejectCode {
    pub fn to_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
            RejectCode::Other(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => RejectCode::Malformed,
            0x10 => RejectCode::Invalid,
            0x11 => RejectCode::Obsolete,
            0x12 => RejectCode::Duplicate,
            0x40 => RejectCode::Nonstandard,
            0x41 => RejectCode::Dust,
            0x42 => RejectCode::InsufficientFee,
            0x43 => RejectCode::Checkpoint,
            other => RejectCode::Other(other),
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectCode::Malformed => "malformed",
            RejectCode::Invalid => "invalid",
            RejectCode::Obsolete => "obsolete",
            RejectCode::Duplicate => "duplicate",
            RejectCode::Nonstandard => "nonstandard",
            RejectCode::Dust => "dust",
            RejectCode::InsufficientFee => "insufficientfee",
            RejectCode::Checkpoint => "checkpoint",
            RejectCode::Other(code) => return write!(f, "{:#04x}", code),
        };
        f.write_str(name)
    }
}

/// Reject message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command of the rejected message
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    /// Hash of the rejected block or transaction
    pub data: Option<Hash256>,
}

impl Encodable for RejectMessage {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        write_var_str(buf, &self.message);
        buf.put_u8(self.code.to_u8());
        write_var_str(buf, &self.reason);
        if let Some(hash) = &self.data {
            hash.consensus_encode(buf);
        }
    }
}

impl Decodable for RejectMessage {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let message = read_var_str(buf, "reject command")?;
        let code = RejectCode::from_u8(read_u8(buf, "reject code")?);
        let reason = read_var_str(buf, "reject reason")?;
        let data = if buf.is_empty() {
            None
        } else {
            Some(Hash256::consensus_decode(buf)?)
        };
        Ok(RejectMessage {
            message,
            code,
            reason,
            data,
        })
    }
}

/// Address with last-seen time, as carried in addr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
    pub time: u32,
    pub address: NetworkAddress,
}

impl Encodable for AddrEntry {
    fn consensus_encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.time);
        self.address.consensus_encode(buf);
    }
}

impl Decodable for AddrEntry {
    fn consensus_decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(AddrEntry {
            time: read_u32(buf, "address time")?,
            address: NetworkAddress::consensus_decode(buf)?,
        })
    }
}

/// Bitcoin protocol message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    GetHeaders(GetHeadersMessage),
    GetBlocks(GetBlocksMessage),
    Headers(Vec<BlockHeader>),
    Tx(Transaction),
    Block(Block),
    Reject(RejectMessage),
    SendHeaders,
    Mempool,
    FeeFilter(i64),
    GetAddr,
    Addr(Vec<AddrEntry>),
    /// Well-formed frame with a command this crate does not model
    Unknown { command: String, payload: Vec<u8> },
}

impl ProtocolMessage {
    /// Wire command name
    pub fn command(&self) -> &str {
        match self {
            ProtocolMessage::Version(_) => "version",
            ProtocolMessage::Verack => "verack",
            ProtocolMessage::Ping(_) => "ping",
            ProtocolMessage::Pong(_) => "pong",
            ProtocolMessage::Inv(_) => "inv",
            ProtocolMessage::GetData(_) => "getdata",
            ProtocolMessage::NotFound(_) => "notfound",
            ProtocolMessage::GetHeaders(_) => "getheaders",
            ProtocolMessage::GetBlocks(_) => "getblocks",
            ProtocolMessage::Headers(_) => "headers",
            ProtocolMessage::Tx(_) => "tx",
            ProtocolMessage::Block(_) => "block",
            ProtocolMessage::Reject(_) => "reject",
            ProtocolMessage::SendHeaders => "sendheaders",
            ProtocolMessage::Mempool => "mempool",
            ProtocolMessage::FeeFilter(_) => "feefilter",
            ProtocolMessage::GetAddr => "getaddr",
            ProtocolMessage::Addr(_) => "addr",
            ProtocolMessage::Unknown { command, .. } => command,
        }
    }

    /// Handshake and keepalive messages, allowed before the handshake completes
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::Version(_)
                | ProtocolMessage::Verack
                | ProtocolMessage::Ping(_)
                | ProtocolMessage::Pong(_)
        )
    }

    /// Serialized payload bytes
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_payload(&mut out);
        out
    }

    fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            ProtocolMessage::Version(msg) => msg.consensus_encode(buf),
            ProtocolMessage::Verack
            | ProtocolMessage::SendHeaders
            | ProtocolMessage::Mempool
            | ProtocolMessage::GetAddr => {}
            ProtocolMessage::Ping(nonce) | ProtocolMessage::Pong(nonce) => buf.put_u64_le(*nonce),
            ProtocolMessage::Inv(items)
            | ProtocolMessage::GetData(items)
            | ProtocolMessage::NotFound(items) => write_vec(buf, items),
            ProtocolMessage::GetHeaders(msg) | ProtocolMessage::GetBlocks(msg) => {
                msg.consensus_encode(buf)
            }
            ProtocolMessage::Headers(headers) => {
                write_compact_size(buf, headers.len() as u64);
                for header in headers {
                    header.consensus_encode(buf);
                    buf.put_u8(0);
                }
            }
            ProtocolMessage::Tx(tx) => tx.consensus_encode(buf),
            ProtocolMessage::Block(block) => block.consensus_encode(buf),
            ProtocolMessage::Reject(msg) => msg.consensus_encode(buf),
            ProtocolMessage::FeeFilter(rate) => buf.put_i64_le(*rate),
            ProtocolMessage::Addr(entries) => write_vec(buf, entries),
            ProtocolMessage::Unknown { payload, .. } => buf.put_slice(payload),
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub command: String,
    pub length: u32,
    pub checksum: [u8; 4],
}

/// Protocol message parser
pub struct ProtocolParser;

impl ProtocolParser {
    /// Serialize a protocol message to a complete frame
    pub fn serialize_message(
        magic: NetworkMagic,
        message: &ProtocolMessage,
    ) -> Result<Vec<u8>, DecodeError> {
        let mut out = BytesMut::new();
        Self::encode_frame(magic, message, &mut out)?;
        Ok(out.to_vec())
    }

    /// Append a complete frame to `dst`
    pub fn encode_frame(
        magic: NetworkMagic,
        message: &ProtocolMessage,
        dst: &mut BytesMut,
    ) -> Result<(), DecodeError> {
        let command = message.command();
        let command_bytes = Self::command_bytes(command)?;
        let payload = message.payload();

        let max = Self::max_payload_len(command);
        if payload.len() > max {
            return Err(DecodeError::PayloadTooLarge {
                command: command.to_string(),
                len: payload.len(),
                max,
            });
        }

        dst.reserve(MESSAGE_HEADER_LEN + payload.len());
        dst.put_slice(&magic.0);
        dst.put_slice(&command_bytes);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&Self::calculate_checksum(&payload));
        dst.put_slice(&payload);
        Ok(())
    }

    /// Parse one complete frame
    ///
    /// `data` must hold exactly one frame; anything after it is an error.
    pub fn parse_message(magic: NetworkMagic, data: &[u8]) -> Result<ProtocolMessage, DecodeError> {
        let header_bytes: [u8; MESSAGE_HEADER_LEN] = data
            .get(..MESSAGE_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(DecodeError::Truncated {
                what: "message header",
                needed: MESSAGE_HEADER_LEN,
                available: data.len(),
            })?;
        let header = Self::parse_header(magic, &header_bytes)?;

        let body = &data[MESSAGE_HEADER_LEN..];
        let len = header.length as usize;
        if body.len() < len {
            return Err(DecodeError::Truncated {
                what: "message payload",
                needed: len,
                available: body.len(),
            });
        }
        if body.len() > len {
            return Err(DecodeError::TrailingBytes {
                command: header.command,
                count: body.len() - len,
            });
        }
        Self::parse_payload(&header, body)
    }

    /// Validate a frame header
    ///
    /// Checks magic, command charset and the per-command length cap.
    pub fn parse_header(
        magic: NetworkMagic,
        bytes: &[u8; MESSAGE_HEADER_LEN],
    ) -> Result<MessageHeader, DecodeError> {
        let mut found = [0u8; 4];
        found.copy_from_slice(&bytes[0..4]);
        if found != magic.0 {
            return Err(DecodeError::BadMagic {
                expected: magic.0,
                found,
            });
        }

        let command = Self::parse_command(&bytes[4..16])?;
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
        let max = Self::max_payload_len(&command);
        if length as usize > max {
            return Err(DecodeError::PayloadTooLarge {
                command,
                len: length as usize,
                max,
            });
        }

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(MessageHeader {
            magic: found,
            command,
            length,
            checksum,
        })
    }

    /// Verify the checksum and decode the payload of a validated header
    pub fn parse_payload(
        header: &MessageHeader,
        payload: &[u8],
    ) -> Result<ProtocolMessage, DecodeError> {
        let actual = Self::calculate_checksum(payload);
        if actual != header.checksum {
            return Err(DecodeError::ChecksumMismatch {
                command: header.command.clone(),
                expected: header.checksum,
                actual,
            });
        }
        Self::decode_payload(&header.command, payload)
    }

    /// Decode a payload for `command`; fixed layouts must consume every byte
    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<ProtocolMessage, DecodeError> {
        let mut buf = payload;
        let message = match command {
            "version" => ProtocolMessage::Version(VersionMessage::consensus_decode(&mut buf)?),
            "verack" => ProtocolMessage::Verack,
            "ping" => ProtocolMessage::Ping(read_u64(&mut buf, "ping nonce")?),
            "pong" => ProtocolMessage::Pong(read_u64(&mut buf, "pong nonce")?),
            "inv" => ProtocolMessage::Inv(read_vec(&mut buf, "inv", MAX_INV_ENTRIES, 36)?),
            "getdata" => {
                ProtocolMessage::GetData(read_vec(&mut buf, "getdata", MAX_INV_ENTRIES, 36)?)
            }
            "notfound" => {
                ProtocolMessage::NotFound(read_vec(&mut buf, "notfound", MAX_INV_ENTRIES, 36)?)
            }
            "getheaders" => {
                ProtocolMessage::GetHeaders(GetHeadersMessage::consensus_decode(&mut buf)?)
            }
            "getblocks" => {
                ProtocolMessage::GetBlocks(GetBlocksMessage::consensus_decode(&mut buf)?)
            }
            "headers" => {
                let count = read_count(&mut buf, "headers", MAX_HEADERS_RESULTS, 81)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    headers.push(BlockHeader::consensus_decode(&mut buf)?);
                    // Transaction count, always zero in headers
                    read_compact_size(&mut buf)?;
                }
                ProtocolMessage::Headers(headers)
            }
            "tx" => ProtocolMessage::Tx(Transaction::consensus_decode(&mut buf)?),
            "block" => ProtocolMessage::Block(Block::consensus_decode(&mut buf)?),
            "reject" => ProtocolMessage::Reject(RejectMessage::consensus_decode(&mut buf)?),
            "sendheaders" => ProtocolMessage::SendHeaders,
            "mempool" => ProtocolMessage::Mempool,
            "feefilter" => ProtocolMessage::FeeFilter(read_i64(&mut buf, "fee rate")?),
            "getaddr" => ProtocolMessage::GetAddr,
            "addr" => ProtocolMessage::Addr(read_vec(&mut buf, "addr", MAX_ADDR_ENTRIES, 30)?),
            other => {
                return Ok(ProtocolMessage::Unknown {
                    command: other.to_string(),
                    payload: payload.to_vec(),
                })
            }
        };
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes {
                command: command.to_string(),
                count: buf.len(),
            });
        }
        Ok(message)
    }

    /// Largest payload accepted for `command`
    pub fn max_payload_len(command: &str) -> usize {
        let cs = 9;
        match command {
            "verack" | "sendheaders" | "mempool" | "getaddr" => 0,
            "ping" | "pong" | "feefilter" => 8,
            "version" => 4 + 8 + 8 + 26 + 26 + 8 + cs + MAX_USER_AGENT_LEN + 4 + 1,
            "inv" | "getdata" | "notfound" => cs + MAX_INV_ENTRIES as usize * 36,
            "headers" => cs + MAX_HEADERS_RESULTS as usize * 81,
            "getheaders" | "getblocks" => 4 + cs + MAX_LOCATOR_SIZE as usize * 32 + 32,
            "addr" => cs + MAX_ADDR_ENTRIES as usize * 30,
            "reject" => 2 * (cs + COMMAND_LEN.max(MAX_USER_AGENT_LEN)) + 1 + 32,
            _ => MAX_PROTOCOL_MESSAGE_LENGTH,
        }
    }

    /// Calculate message checksum
    pub fn calculate_checksum(payload: &[u8]) -> [u8; 4] {
        use sha2::{Digest, Sha256};

        let hash1 = Sha256::digest(payload);
        let hash2 = Sha256::digest(hash1);

        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&hash2[..4]);
        checksum
    }

    fn command_bytes(command: &str) -> Result<[u8; COMMAND_LEN], DecodeError> {
        if command.len() > COMMAND_LEN || !command.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
            return Err(DecodeError::InvalidCommand(command.escape_default().to_string()));
        }
        let mut out = [0u8; COMMAND_LEN];
        out[..command.len()].copy_from_slice(command.as_bytes());
        Ok(out)
    }

    /// Printable ASCII followed only by NUL padding
    fn parse_command(field: &[u8]) -> Result<String, DecodeError> {
        let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        let (name, padding) = field.split_at(end);
        if !name.iter().all(|b| (0x20..=0x7e).contains(b)) || padding.iter().any(|b| *b != 0) {
            return Err(DecodeError::InvalidCommand(
                field.escape_ascii().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(name).into_owned())
    }
}
