//! Tapwallet Connect - WalletConnect session and request-dispatch engine
//!
//! This library implements the protocol core of a tap-card wallet: pairing
//! with dApps, managing concurrent WalletConnect sessions, classifying and
//! routing inbound JSON-RPC requests, enforcing interactive approval for
//! sensitive operations, reconciling chain-identity mismatches, and producing
//! JSON-RPC 2.0 responses back to the dApp.
//!
//! Rendering, balance aggregation, and transaction construction live in the
//! embedding application; this crate consumes them through the
//! [`signer::WalletSigner`], [`chain::ChainRegistry`], and
//! [`transport::SessionTransport`] traits.

pub mod chain;
pub mod classify;
pub mod engine;
pub mod error;
pub mod events;
pub mod mismatch;
pub mod processor;
pub mod session;
pub mod signer;
pub mod transport;

// Re-export commonly used types for convenience
pub use engine::{ActionPrompt, ConnectionEngine};
pub use error::{ConnectError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
