//! WalletConnect wire types and the pairing transport
//!
//! Envelope shapes follow the WalletConnect sign protocol
//! (<https://specs.walletconnect.com/2.0/specs/clients/sign/data-structures>).
//! The engine consumes the relay through [`SessionTransport`]; inbound
//! traffic arrives as a single [`InboundEvent`] sum type so ordering is
//! preserved through one dispatch path.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConnectError, Result, CODE_USER_DISCONNECTED, CODE_USER_REJECTED};
use crate::session::Session;

/// JSON-RPC request id. dApp-originated ids are numeric; internally generated
/// chain-switch prompts carry a synthetic string id suffixed `-switch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl RequestId {
    /// Id of the synthetic switch request derived from this request.
    pub fn switch_id(&self) -> RequestId {
        RequestId::Text(format!("{self}-switch"))
    }

    pub fn is_switch(&self) -> bool {
        matches!(self, RequestId::Text(s) if s.ends_with("-switch"))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => write!(f, "{s}"),
        }
    }
}

/// dApp (peer) metadata attached to proposals and sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub icons: Vec<String>,
}

/// Namespace requested by a dApp in a session proposal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalNamespace {
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Namespace settled on an approved session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNamespace {
    /// `namespace:chainDecimal:address` entries.
    pub accounts: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chains: Option<Vec<String>>,
}

/// Inner `{method, params}` of a session request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcCall {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// One inbound `session_request` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRpcRequest {
    pub id: RequestId,
    pub topic: String,
    /// CAIP-2 chain the dApp targets, e.g. `eip155:1`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    pub request: RpcCall,
}

/// One inbound `session_proposal` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    pub id: u64,
    pub proposer: PeerMetadata,
    pub required_namespaces: BTreeMap<String, ProposalNamespace>,
    #[serde(default)]
    pub optional_namespaces: BTreeMap<String, ProposalNamespace>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    pub fn user_rejected() -> Self {
        Self { code: CODE_USER_REJECTED, message: "User rejected the request".to_string() }
    }

    pub fn user_disconnected() -> Self {
        Self { code: CODE_USER_DISCONNECTED, message: "User disconnected".to_string() }
    }
}

/// JSON-RPC 2.0 response envelope sent back over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl RpcResponse {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    pub fn err(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(ErrorObject { code, message: message.into() }),
        }
    }
}

/// Outbound session event payload (`chainChanged`, `accountsChanged`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEvent {
    pub name: String,
    pub data: Value,
}

/// Everything the relay can push at the wallet, as one ordered stream.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Proposal(SessionProposal),
    Request(SessionRpcRequest),
    Delete { topic: String },
    Update { topic: String, namespaces: BTreeMap<String, SessionNamespace> },
}

/// The pairing transport (WalletConnect sign client).
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Initiates pairing from a `wc:` URI.
    async fn pair(&self, uri: &str) -> Result<()>;

    async fn all_sessions(&self) -> Result<Vec<Session>>;

    async fn session(&self, topic: &str) -> Result<Option<Session>>;

    /// Approves a proposal with the settled namespaces and returns the new
    /// session topic once the dApp acknowledges.
    async fn approve_session(
        &self,
        proposal_id: u64,
        namespaces: BTreeMap<String, SessionNamespace>,
    ) -> Result<String>;

    async fn reject_session(&self, proposal_id: u64, reason: ErrorObject) -> Result<()>;

    async fn respond(&self, topic: &str, response: RpcResponse) -> Result<()>;

    async fn emit_event(&self, topic: &str, event: WalletEvent, chain_id: &str) -> Result<()>;

    async fn disconnect(&self, topic: &str, reason: ErrorObject) -> Result<()>;
}

/// Event captured by [`InMemoryTransport`].
#[derive(Debug, Clone)]
pub struct EmittedEvent {
    pub topic: String,
    pub event: WalletEvent,
    pub chain_id: String,
}

/// In-memory transport for development and testing. Records every response
/// and event so tests can assert on the exact wire traffic.
#[derive(Default)]
pub struct InMemoryTransport {
    sessions: RwLock<Vec<Session>>,
    responses: RwLock<Vec<(String, RpcResponse)>>,
    events: RwLock<Vec<EmittedEvent>>,
    rejected_proposals: RwLock<Vec<(u64, ErrorObject)>>,
    paired: RwLock<Vec<String>>,
    fail_emits: AtomicBool,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a session as if it had been settled earlier (restore tests).
    pub fn add_session(&self, session: Session) {
        self.sessions.write().unwrap().push(session);
    }

    /// Makes `emit_event` fail, to exercise best-effort emission paths.
    pub fn set_fail_emits(&self, fail: bool) {
        self.fail_emits.store(fail, Ordering::SeqCst);
    }

    pub fn responses(&self) -> Vec<(String, RpcResponse)> {
        self.responses.read().unwrap().clone()
    }

    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.read().unwrap().clone()
    }

    pub fn rejected_proposals(&self) -> Vec<(u64, ErrorObject)> {
        self.rejected_proposals.read().unwrap().clone()
    }

    pub fn paired_uris(&self) -> Vec<String> {
        self.paired.read().unwrap().clone()
    }
}

#[async_trait]
impl SessionTransport for InMemoryTransport {
    async fn pair(&self, uri: &str) -> Result<()> {
        if !uri.starts_with("wc:") {
            return Err(ConnectError::Transport(format!("invalid pairing URI: {uri}")));
        }
        self.paired.write().unwrap().push(uri.to_string());
        Ok(())
    }

    async fn all_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.read().unwrap().clone())
    }

    async fn session(&self, topic: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().unwrap().iter().find(|s| s.topic == topic).cloned())
    }

    async fn approve_session(
        &self,
        _proposal_id: u64,
        namespaces: BTreeMap<String, SessionNamespace>,
    ) -> Result<String> {
        let topic = uuid::Uuid::new_v4().to_string();
        let session = Session { topic: topic.clone(), peer: PeerMetadata::default(), namespaces };
        self.sessions.write().unwrap().push(session);
        Ok(topic)
    }

    async fn reject_session(&self, proposal_id: u64, reason: ErrorObject) -> Result<()> {
        self.rejected_proposals.write().unwrap().push((proposal_id, reason));
        Ok(())
    }

    async fn respond(&self, topic: &str, response: RpcResponse) -> Result<()> {
        self.responses.write().unwrap().push((topic.to_string(), response));
        Ok(())
    }

    async fn emit_event(&self, topic: &str, event: WalletEvent, chain_id: &str) -> Result<()> {
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(ConnectError::Transport("relay publish failed".to_string()));
        }
        self.events.write().unwrap().push(EmittedEvent {
            topic: topic.to_string(),
            event,
            chain_id: chain_id.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self, topic: &str, _reason: ErrorObject) -> Result<()> {
        self.sessions.write().unwrap().retain(|s| s.topic != topic);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_ids_roundtrip_numeric_and_synthetic() {
        let numeric: RequestId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(numeric, RequestId::Number(7));
        assert!(!numeric.is_switch());

        let switch = numeric.switch_id();
        assert_eq!(switch, RequestId::Text("7-switch".to_string()));
        assert!(switch.is_switch());
        assert_eq!(serde_json::to_value(&switch).unwrap(), json!("7-switch"));
    }

    #[test]
    fn responses_serialize_per_jsonrpc_2() {
        let ok = RpcResponse::ok(RequestId::Number(1), json!(["0xabc"]));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "result": ["0xabc"]}));

        let err = RpcResponse::err(RequestId::Number(2), 4001, "User rejected the request");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": 4001, "message": "User rejected the request"}})
        );
    }

    #[test]
    fn proposal_deserializes_from_wire_shape() {
        let proposal: SessionProposal = serde_json::from_value(json!({
            "id": 1700000000000001u64,
            "proposer": {
                "name": "React App",
                "url": "http://localhost:3000",
                "icons": ["https://avatars.githubusercontent.com/u/37784886"]
            },
            "requiredNamespaces": {
                "eip155": {
                    "chains": ["eip155:1"],
                    "methods": ["personal_sign", "eth_sendTransaction"],
                    "events": ["chainChanged"]
                }
            }
        }))
        .unwrap();
        assert_eq!(proposal.proposer.name, "React App");
        assert_eq!(proposal.required_namespaces["eip155"].chains, vec!["eip155:1"]);
        assert!(proposal.optional_namespaces.is_empty());
    }
}
