//! RPC Error Types
//!
//! Bitcoin Core-compatible JSON-RPC error codes, plus the mapping from
//! submission errors to reject categories.

use std::fmt;
use thiserror::Error;

use crate::network::protocol::RejectCode;

/// JSON-RPC error codes (Bitcoin Core compatible)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    /// Parse error (-32700)
    ParseError,
    /// Invalid request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    InternalError,
    /// Unspecified problem (-1)
    MiscError,
    /// Block or transaction not found (-5)
    InvalidAddressOrKey,
    /// Invalid, missing or duplicate parameter (-8)
    InvalidParameter,
    /// Error parsing or validating structure in raw format (-22)
    DeserializationError,
    /// General error during transaction or block submission (-25)
    VerifyError,
    /// Transaction or block was rejected by network rules (-26)
    VerifyRejected,
    /// Transaction already in chain (-27)
    VerifyAlreadyInChain,
    /// Client still warming up (-28)
    InWarmup,
    /// Any other code
    Other(i32),
}

impl RpcErrorCode {
    /// Get numeric error code
    pub fn code(&self) -> i32 {
        match self {
            RpcErrorCode::ParseError => -32700,
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::MiscError => -1,
            RpcErrorCode::InvalidAddressOrKey => -5,
            RpcErrorCode::InvalidParameter => -8,
            RpcErrorCode::DeserializationError => -22,
            RpcErrorCode::VerifyError => -25,
            RpcErrorCode::VerifyRejected => -26,
            RpcErrorCode::VerifyAlreadyInChain => -27,
            RpcErrorCode::InWarmup => -28,
            RpcErrorCode::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => RpcErrorCode::ParseError,
            -32600 => RpcErrorCode::InvalidRequest,
            -32601 => RpcErrorCode::MethodNotFound,
            -32602 => RpcErrorCode::InvalidParams,
            -32603 => RpcErrorCode::InternalError,
            -1 => RpcErrorCode::MiscError,
            -5 => RpcErrorCode::InvalidAddressOrKey,
            -8 => RpcErrorCode::InvalidParameter,
            -22 => RpcErrorCode::DeserializationError,
            -25 => RpcErrorCode::VerifyError,
            -26 => RpcErrorCode::VerifyRejected,
            -27 => RpcErrorCode::VerifyAlreadyInChain,
            -28 => RpcErrorCode::InWarmup,
            other => RpcErrorCode::Other(other),
        }
    }

    /// Get error message
    pub fn message(&self) -> &'static str {
        match self {
            RpcErrorCode::ParseError => "Parse error",
            RpcErrorCode::InvalidRequest => "Invalid Request",
            RpcErrorCode::MethodNotFound => "Method not found",
            RpcErrorCode::InvalidParams => "Invalid params",
            RpcErrorCode::InternalError => "Internal error",
            RpcErrorCode::MiscError => "Miscellaneous error",
            RpcErrorCode::InvalidAddressOrKey => "Not found",
            RpcErrorCode::InvalidParameter => "Invalid parameter",
            RpcErrorCode::DeserializationError => "Deserialization error",
            RpcErrorCode::VerifyError => "Verify error",
            RpcErrorCode::VerifyRejected => "Rejected",
            RpcErrorCode::VerifyAlreadyInChain => "Already in chain",
            RpcErrorCode::InWarmup => "Warming up",
            RpcErrorCode::Other(_) => "Server error",
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures talking to the node's JSON-RPC interface
#[derive(Error, Debug)]
pub enum RpcError {
    /// The node answered with a JSON-RPC error object
    #[error("RPC error {code} ({}): {message}", .code.message())]
    Server { code: RpcErrorCode, message: String },

    /// HTTP or connection failure
    #[error("RPC transport error: {0}")]
    Transport(String),

    /// Response could not be understood
    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        RpcError::Server {
            code: RpcErrorCode::from_code(code),
            message: message.into(),
        }
    }

    /// The rejection this error reports, if it is a consensus rejection
    ///
    /// Submission errors carry `"<code>: <reason>"` when the node knows the
    /// reject code; otherwise the category follows the RPC code.
    pub fn as_rejection(&self) -> Option<RpcRejection> {
        let RpcError::Server { code, message } = self else {
            return None;
        };
        if let Some(parsed) = RpcRejection::parse_prefixed(message) {
            return Some(parsed);
        }
        let category = match code {
            RpcErrorCode::VerifyAlreadyInChain => RejectCode::Duplicate,
            RpcErrorCode::VerifyError | RpcErrorCode::VerifyRejected => RejectCode::Invalid,
            RpcErrorCode::DeserializationError => RejectCode::Malformed,
            _ => return None,
        };
        Some(RpcRejection {
            code: category,
            reason: message.clone(),
        })
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// A consensus rejection reported over RPC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRejection {
    pub code: RejectCode,
    pub reason: String,
}

impl RpcRejection {
    /// Parse `"16: bad-txns-nonfinal"` style messages
    fn parse_prefixed(message: &str) -> Option<Self> {
        let (code, reason) = message.split_once(": ")?;
        let code: u8 = code.trim().parse().ok()?;
        Some(RpcRejection {
            code: RejectCode::from_u8(code),
            reason: reason.to_string(),
        })
    }

    /// Interpret a `submitblock` result string
    ///
    /// `None` means the block was not rejected: either accepted (null result)
    /// or stored without a verdict (`inconclusive`).
    pub fn from_submit_block(result: Option<&str>) -> Option<Self> {
        let result = result?;
        if result == "inconclusive" {
            return None;
        }
        let code = if result.starts_with("duplicate") {
            RejectCode::Duplicate
        } else {
            RejectCode::Invalid
        };
        Some(RpcRejection {
            code,
            reason: result.to_string(),
        })
    }
}
