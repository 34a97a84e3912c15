//! Chain mismatch interception
//!
//! A request scoped to a chain other than the active one is not executed
//! directly. A synthetic `wallet_switchEthereumChain` request is queued ahead
//! of it so the user approves the switch first, then the original request on
//! the new chain.

use chrono::Utc;
use serde_json::json;

use crate::chain::{split_caip2, ChainDescriptor};
use crate::session::PendingRequest;

/// Outcome of checking one inbound request against the active chain.
#[derive(Debug, Clone)]
pub enum MismatchOutcome {
    /// Request targets the active chain (or no chain). Dispatch normally.
    PassThrough,
    /// Request targets another chain. Queue `switch` ahead of `original`.
    Intercept { switch: PendingRequest, original: PendingRequest },
}

pub struct ChainMismatchResolver;

impl ChainMismatchResolver {
    /// Evaluates an inbound request against the active chain. Chain
    /// management methods pass through untouched since they carry their own
    /// switch semantics.
    pub fn evaluate(request: &PendingRequest, active: &ChainDescriptor) -> MismatchOutcome {
        if matches!(request.method.as_str(), "wallet_switchEthereumChain" | "wallet_addEthereumChain")
        {
            return MismatchOutcome::PassThrough;
        }

        let Some(scope) = request.chain_id.as_deref() else {
            return MismatchOutcome::PassThrough;
        };
        let Some(("eip155", requested)) = split_caip2(scope) else {
            return MismatchOutcome::PassThrough;
        };
        let Ok(active_id) = active.decimal_id() else {
            return MismatchOutcome::PassThrough;
        };
        if requested == active_id {
            return MismatchOutcome::PassThrough;
        }

        tracing::info!(
            request_id = %request.id,
            method = %request.method,
            requested,
            active = active_id,
            "intercepting request on mismatched chain"
        );

        let switch = PendingRequest {
            id: request.id.switch_id(),
            topic: request.topic.clone(),
            method: "wallet_switchEthereumChain".to_string(),
            params: vec![json!({ "chainId": format!("0x{requested:x}") })],
            chain_id: request.chain_id.clone(),
            synthetic: true,
            received_at: Utc::now(),
        };
        MismatchOutcome::Intercept { switch, original: request.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::default_chains;
    use crate::transport::RequestId;

    fn request(method: &str, chain_id: Option<&str>) -> PendingRequest {
        PendingRequest {
            id: RequestId::Number(42),
            topic: "topic-1".to_string(),
            method: method.to_string(),
            params: vec![],
            chain_id: chain_id.map(str::to_string),
            synthetic: false,
            received_at: Utc::now(),
        }
    }

    fn ethereum() -> ChainDescriptor {
        default_chains().into_iter().find(|c| c.chain_id == "0x1").unwrap()
    }

    #[test]
    fn matching_chain_passes_through() {
        let outcome = ChainMismatchResolver::evaluate(&request("personal_sign", Some("eip155:1")), &ethereum());
        assert!(matches!(outcome, MismatchOutcome::PassThrough));
    }

    #[test]
    fn unscoped_request_passes_through() {
        let outcome = ChainMismatchResolver::evaluate(&request("eth_chainId", None), &ethereum());
        assert!(matches!(outcome, MismatchOutcome::PassThrough));
    }

    #[test]
    fn mismatch_builds_synthetic_switch_ahead_of_original() {
        let original = request("eth_sendTransaction", Some("eip155:137"));
        let outcome = ChainMismatchResolver::evaluate(&original, &ethereum());
        let MismatchOutcome::Intercept { switch, original: kept } = outcome else {
            panic!("expected interception");
        };
        assert_eq!(switch.id, RequestId::Text("42-switch".to_string()));
        assert!(switch.is_synthetic());
        assert_eq!(switch.method, "wallet_switchEthereumChain");
        assert_eq!(switch.params[0]["chainId"], "0x89");
        assert_eq!(switch.topic, original.topic);
        assert_eq!(kept.id, original.id);
        assert!(!kept.is_synthetic());
    }

    #[test]
    fn switch_requests_never_self_intercept() {
        let outcome = ChainMismatchResolver::evaluate(
            &request("wallet_switchEthereumChain", Some("eip155:137")),
            &ethereum(),
        );
        assert!(matches!(outcome, MismatchOutcome::PassThrough));
    }
}
