//! Error types for the WalletConnect engine

use thiserror::Error;

/// User rejected the request (EIP-1193).
pub const CODE_USER_REJECTED: i64 = 4001;
/// The requested chain is not known to the wallet (EIP-3326).
pub const CODE_UNRECOGNIZED_CHAIN: i64 = 4902;
/// JSON-RPC method not found.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Default processing error.
pub const CODE_INTERNAL: i64 = -32000;
/// WalletConnect SDK reason for an explicit disconnect.
pub const CODE_USER_DISCONNECTED: i64 = 6000;

/// Message fragments from the card signer that mean the user must perform a
/// physical action (tap the card, re-enter the passcode) before the same
/// operation can succeed.
const RECOVERABLE_PATTERNS: &[&str] = &["tap your card", "missing card data", "wrong passcode"];

/// Custom error type for engine operations
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("User rejected the request")]
    UserRejected,

    #[error("Chain {0} not found. Please add the chain first.")]
    ChainNotFound(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("No wallet address available for request processing")]
    NoAddress,

    #[error("Signer not connected")]
    SignerNotConnected,

    #[error("No active WalletConnect session available")]
    NoSession,

    #[error("Invalid request params: {0}")]
    InvalidParams(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ConnectError {
    /// JSON-RPC error code surfaced to the dApp for this failure.
    pub fn code(&self) -> i64 {
        match self {
            Self::UserRejected => CODE_USER_REJECTED,
            Self::ChainNotFound(_) => CODE_UNRECOGNIZED_CHAIN,
            Self::UnsupportedMethod(_) => CODE_METHOD_NOT_FOUND,
            _ => CODE_INTERNAL,
        }
    }

    /// Whether the failure is resolved by a physical user action. Recoverable
    /// failures on interactive methods keep the request pending instead of
    /// answering the dApp with an error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Signing(message) => {
                let message = message.to_lowercase();
                RECOVERABLE_PATTERNS.iter().any(|p| message.contains(p))
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, ConnectError>;
