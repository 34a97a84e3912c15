//! Outbound session events
//!
//! Emission is best effort. A relay publish failure never fails the
//! operation that triggered it; the local state change already happened.

use std::sync::Arc;

use serde_json::json;

use crate::chain::ChainDescriptor;
use crate::signer::format_address;
use crate::transport::{SessionTransport, WalletEvent};
use ethers_core::types::Address;

#[derive(Clone)]
pub struct EventPublisher {
    transport: Arc<dyn SessionTransport>,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn SessionTransport>) -> Self {
        Self { transport }
    }

    /// Emits `chainChanged` with the decimal chain id as payload, scoped to
    /// the new chain.
    pub async fn chain_changed(&self, topic: &str, chain: &ChainDescriptor) {
        let Ok(decimal) = chain.decimal_id() else {
            tracing::warn!(chain_id = %chain.chain_id, "cannot emit chainChanged for malformed chain id");
            return;
        };
        let event = WalletEvent { name: "chainChanged".to_string(), data: json!(decimal) };
        let scope = format!("eip155:{decimal}");
        if let Err(e) = self.transport.emit_event(topic, event, &scope).await {
            tracing::warn!(topic, "failed to emit chainChanged: {e}");
        }
    }

    /// Emits `accountsChanged` with the wallet address, scoped to the active
    /// chain.
    pub async fn accounts_changed(&self, topic: &str, address: Address, chain: &ChainDescriptor) {
        let Ok(decimal) = chain.decimal_id() else {
            tracing::warn!(chain_id = %chain.chain_id, "cannot emit accountsChanged for malformed chain id");
            return;
        };
        let event = WalletEvent {
            name: "accountsChanged".to_string(),
            data: json!([format_address(&address)]),
        };
        let scope = format!("eip155:{decimal}");
        if let Err(e) = self.transport.emit_event(topic, event, &scope).await {
            tracing::warn!(topic, "failed to emit accountsChanged: {e}");
        }
    }
}
