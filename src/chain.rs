//! Chain descriptors, chain-id normalization, and the chain registry

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, Result};

/// Native asset of a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeToken {
    pub symbol: String,
    pub decimals: u8,
    pub name: String,
}

/// Metadata for one EVM chain. Immutable once constructed; equality is by
/// normalized chain id, not by display fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDescriptor {
    /// "0x"-prefixed hex chain id.
    pub chain_id: String,
    pub display_name: String,
    pub rpc_url: String,
    pub native_token: NativeToken,
    pub block_explorer_url: String,
    pub is_testnet: bool,
}

impl PartialEq for ChainDescriptor {
    fn eq(&self, other: &Self) -> bool {
        match (normalize_chain_id(&self.chain_id), normalize_chain_id(&other.chain_id)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ChainDescriptor {}

impl ChainDescriptor {
    /// Numeric chain id.
    pub fn decimal_id(&self) -> Result<u64> {
        decimal_chain_id(&self.chain_id)
    }

    /// CAIP-2 identifier, e.g. `eip155:137`.
    pub fn caip2(&self) -> Result<String> {
        Ok(format!("eip155:{}", self.decimal_id()?))
    }
}

/// Canonical form of a chain id: lower-case, zero-stripped, "0x"-prefixed
/// hex. Accepts either hex ("0x89", "0X89") or decimal ("137") input. Two
/// chain ids refer to the same chain iff their canonical forms are equal.
pub fn normalize_chain_id(chain_id: &str) -> Option<String> {
    let trimmed = chain_id.trim();
    let value = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        trimmed.parse::<u64>().ok()?
    };
    Some(format!("0x{value:x}"))
}

/// Numeric value of a hex or decimal chain id string.
pub fn decimal_chain_id(chain_id: &str) -> Result<u64> {
    let normalized = normalize_chain_id(chain_id)
        .ok_or_else(|| ConnectError::Chain(format!("invalid chain id: {chain_id}")))?;
    u64::from_str_radix(normalized.trim_start_matches("0x"), 16)
        .map_err(|_| ConnectError::Chain(format!("invalid chain id: {chain_id}")))
}

/// Splits a CAIP-2 reference such as `eip155:137` (optionally with a trailing
/// account segment, `eip155:137:0x...`) into namespace and numeric chain id.
pub fn split_caip2(reference: &str) -> Option<(&str, u64)> {
    let (namespace, rest) = reference.split_once(':')?;
    let decimal = rest.split(':').next()?;
    decimal.parse::<u64>().ok().map(|id| (namespace, id))
}

/// Resolves chain identifiers to chain metadata. The embedding application
/// may back this with any store; the engine only needs lookup, enumeration,
/// and dynamic registration of chains a dApp asks for.
#[async_trait]
pub trait ChainRegistry: Send + Sync {
    /// Resolves a chain by id (hex or decimal form accepted).
    async fn lookup(&self, chain_id: &str) -> Option<ChainDescriptor>;

    async fn list_all(&self) -> Vec<ChainDescriptor>;

    /// Registers a chain, replacing any existing entry with the same id.
    async fn register(&self, descriptor: ChainDescriptor);
}

/// In-memory registry pre-seeded with the wallet's built-in chain set.
#[derive(Debug)]
pub struct StaticChainRegistry {
    chains: RwLock<Vec<ChainDescriptor>>,
}

impl StaticChainRegistry {
    pub fn new(chains: Vec<ChainDescriptor>) -> Self {
        Self { chains: RwLock::new(chains) }
    }

    /// Registry seeded with the wallet's default mainnets and testnets.
    pub fn with_defaults() -> Self {
        Self::new(default_chains())
    }
}

impl Default for StaticChainRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl ChainRegistry for StaticChainRegistry {
    async fn lookup(&self, chain_id: &str) -> Option<ChainDescriptor> {
        let wanted = normalize_chain_id(chain_id)?;
        let chains = self.chains.read().unwrap();
        chains
            .iter()
            .find(|c| normalize_chain_id(&c.chain_id).as_deref() == Some(wanted.as_str()))
            .cloned()
    }

    async fn list_all(&self) -> Vec<ChainDescriptor> {
        self.chains.read().unwrap().clone()
    }

    async fn register(&self, descriptor: ChainDescriptor) {
        let mut chains = self.chains.write().unwrap();
        if let Some(existing) = chains.iter_mut().find(|c| **c == descriptor) {
            *existing = descriptor;
        } else {
            chains.push(descriptor);
        }
    }
}

fn chain(
    chain_id: &str,
    display_name: &str,
    rpc_url: &str,
    symbol: &str,
    token_name: &str,
    explorer: &str,
    is_testnet: bool,
) -> ChainDescriptor {
    ChainDescriptor {
        chain_id: chain_id.to_string(),
        display_name: display_name.to_string(),
        rpc_url: rpc_url.to_string(),
        native_token: NativeToken {
            symbol: symbol.to_string(),
            decimals: 18,
            name: token_name.to_string(),
        },
        block_explorer_url: explorer.to_string(),
        is_testnet,
    }
}

/// The wallet's built-in chain set: five mainnets plus their testnets.
pub fn default_chains() -> Vec<ChainDescriptor> {
    vec![
        chain("0x1", "Ethereum", "https://ethereum-rpc.publicnode.com", "ETH", "Ethereum", "https://etherscan.io", false),
        chain("0x2105", "Base", "https://base-rpc.publicnode.com", "ETH", "Ethereum", "https://basescan.org", false),
        chain("0x89", "Polygon", "https://polygon-bor-rpc.publicnode.com", "MATIC", "Polygon", "https://polygonscan.com", false),
        chain("0x38", "Binance Smart Chain", "https://bsc-rpc.publicnode.com", "BNB", "Binance Coin", "https://bscscan.com", false),
        chain("0xa", "Optimism", "https://optimism-rpc.publicnode.com", "ETH", "Ethereum", "https://optimistic.etherscan.io", false),
        chain("0xaa36a7", "Ethereum Sepolia", "https://ethereum-sepolia-rpc.publicnode.com", "ETH", "Ethereum", "https://sepolia.etherscan.io", true),
        chain("0x14a33", "Base Sepolia", "https://base-sepolia-rpc.publicnode.com", "ETH", "Ethereum", "https://sepolia.basescan.org", true),
        chain("0x13881", "Polygon Mumbai", "https://polygon-mumbai-bor-rpc.publicnode.com", "MATIC", "Polygon", "https://mumbai.polygonscan.com", true),
        chain("0x61", "BSC Testnet", "https://bsc-testnet-rpc.publicnode.com", "BNB", "Binance Coin", "https://testnet.bscscan.com", true),
        chain("0x1a4", "Optimism Goerli", "https://optimism-goerli-rpc.publicnode.com", "ETH", "Ethereum", "https://goerli-optimism.etherscan.io", true),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_case_and_radix_insensitive() {
        assert_eq!(normalize_chain_id("1"), Some("0x1".to_string()));
        assert_eq!(normalize_chain_id("0x1"), Some("0x1".to_string()));
        assert_eq!(normalize_chain_id("0X1"), Some("0x1".to_string()));
        assert_eq!(normalize_chain_id("137"), Some("0x89".to_string()));
        assert_eq!(normalize_chain_id("0x0089"), Some("0x89".to_string()));
        assert_eq!(normalize_chain_id("not-a-chain"), None);
        assert_eq!(normalize_chain_id(""), None);
    }

    #[test]
    fn caip2_references_parse_with_and_without_account() {
        assert_eq!(split_caip2("eip155:137"), Some(("eip155", 137)));
        assert_eq!(
            split_caip2("eip155:1:0x1111111111111111111111111111111111111111"),
            Some(("eip155", 1))
        );
        assert_eq!(split_caip2("eip155"), None);
        assert_eq!(split_caip2("eip155:garbage"), None);
    }

    #[tokio::test]
    async fn registry_lookup_accepts_hex_and_decimal() {
        let registry = StaticChainRegistry::with_defaults();
        let by_hex = registry.lookup("0x89").await.unwrap();
        let by_decimal = registry.lookup("137").await.unwrap();
        assert_eq!(by_hex, by_decimal);
        assert_eq!(by_hex.display_name, "Polygon");
        assert!(registry.lookup("0xdeadbeef").await.is_none());
    }

    #[tokio::test]
    async fn register_replaces_same_chain() {
        let registry = StaticChainRegistry::with_defaults();
        let count = registry.list_all().await.len();
        let mut custom = registry.lookup("0x1").await.unwrap();
        custom.display_name = "Mainnet (custom RPC)".to_string();
        registry.register(custom).await;
        assert_eq!(registry.list_all().await.len(), count);
        assert_eq!(registry.lookup("0x1").await.unwrap().display_name, "Mainnet (custom RPC)");
    }
}
