//! Method classification
//!
//! The method table is exact, not heuristic: a method is interactive,
//! sessionless, read-only, or unsupported. Unknown methods fail
//! synchronously and are never queued.

/// Methods requiring explicit per-call user consent. Always queued for
/// approval, with one exception: a `wallet_switchEthereumChain` to the chain
/// already active is executed immediately.
pub const INTERACTIVE_METHODS: &[&str] = &[
    "eth_sign",
    "personal_sign",
    "eth_signTypedData",
    "eth_signTypedData_v4",
    "eth_sendTransaction",
    "wallet_switchEthereumChain",
];

/// Methods permitted to execute without a bound session.
pub const SESSIONLESS_METHODS: &[&str] = &["wallet_getCapabilities", "wallet_addEthereumChain"];

/// Methods executed immediately against a matching session.
pub const READ_ONLY_METHODS: &[&str] = &[
    "eth_accounts",
    "eth_chainId",
    "eth_requestAccounts",
    "eth_getBalance",
    "eth_getTransactionCount",
    "eth_blockNumber",
    "eth_gasPrice",
    "eth_estimateGas",
    "eth_getCode",
    "eth_call",
];

/// Everything the wallet can serve, advertised in capabilities and merged
/// into approved session namespaces.
pub const WALLET_METHODS: &[&str] = &[
    "eth_accounts",
    "eth_chainId",
    "eth_requestAccounts",
    "eth_getBalance",
    "eth_blockNumber",
    "eth_gasPrice",
    "eth_estimateGas",
    "eth_getCode",
    "eth_call",
    "eth_getTransactionCount",
    "eth_sendTransaction",
    "eth_sign",
    "personal_sign",
    "eth_signTypedData",
    "eth_signTypedData_v4",
    "wallet_switchEthereumChain",
    "wallet_addEthereumChain",
];

pub const WALLET_EVENTS: &[&str] = &["accountsChanged", "chainChanged"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Treatment {
    /// Requires explicit user approval before execution.
    Interactive,
    /// May execute without a bound session (signer must still be connected).
    Sessionless,
    /// Executed immediately against the active session.
    ReadOnly,
    /// Fails synchronously with a method-not-found error.
    Unsupported,
}

pub fn classify(method: &str) -> Treatment {
    if INTERACTIVE_METHODS.contains(&method) {
        Treatment::Interactive
    } else if SESSIONLESS_METHODS.contains(&method) {
        Treatment::Sessionless
    } else if READ_ONLY_METHODS.contains(&method) {
        Treatment::ReadOnly
    } else {
        Treatment::Unsupported
    }
}

/// Whether approving this method needs key material pulled off the card
/// first. Chain bookkeeping methods do not touch the key.
pub fn requires_key_material(method: &str) -> bool {
    !matches!(method, "wallet_switchEthereumChain" | "wallet_addEthereumChain")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn treatment_table_is_exact() {
        assert_eq!(classify("personal_sign"), Treatment::Interactive);
        assert_eq!(classify("eth_sendTransaction"), Treatment::Interactive);
        assert_eq!(classify("wallet_switchEthereumChain"), Treatment::Interactive);
        assert_eq!(classify("wallet_getCapabilities"), Treatment::Sessionless);
        assert_eq!(classify("wallet_addEthereumChain"), Treatment::Sessionless);
        assert_eq!(classify("eth_chainId"), Treatment::ReadOnly);
        assert_eq!(classify("eth_call"), Treatment::ReadOnly);
        assert_eq!(classify("eth_signTransaction"), Treatment::Unsupported);
        assert_eq!(classify("solana_signMessage"), Treatment::Unsupported);
    }

    #[test]
    fn chain_bookkeeping_skips_key_material() {
        assert!(!requires_key_material("wallet_switchEthereumChain"));
        assert!(!requires_key_material("wallet_addEthereumChain"));
        assert!(requires_key_material("personal_sign"));
        assert!(requires_key_material("eth_sendTransaction"));
    }
}
