//! Session entities and lifecycle management

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ethers_core::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{
    PeerMetadata, RequestId, SessionNamespace, SessionRpcRequest, SessionTransport,
};

/// One approved pairing with a dApp, identified by topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub topic: String,
    pub peer: PeerMetadata,
    pub namespaces: BTreeMap<String, SessionNamespace>,
}

impl Session {
    /// First eip155 account entry (`eip155:1:0x...`), if any.
    pub fn primary_account(&self) -> Option<&str> {
        self.namespaces
            .get("eip155")
            .and_then(|ns| ns.accounts.first())
            .map(String::as_str)
    }

    /// Address extracted from the first eip155 account entry. Returns `None`
    /// for a missing or malformed entry.
    pub fn account_address(&self) -> Option<Address> {
        let account = self.primary_account()?;
        let raw = account.rsplit(':').next()?;
        raw.parse::<Address>().ok()
    }
}

/// A queued inbound JSON-RPC call awaiting interactive approval or deferred
/// re-processing. Present in the pending queue at most once per id.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: RequestId,
    pub topic: String,
    pub method: String,
    pub params: Vec<Value>,
    /// CAIP-2 chain the dApp targets, when the request was chain-scoped.
    pub chain_id: Option<String>,
    /// Internally generated chain-switch prompts never produce a transport
    /// response.
    pub synthetic: bool,
    pub received_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn from_event(event: &SessionRpcRequest) -> Self {
        Self {
            id: event.id.clone(),
            topic: event.topic.clone(),
            method: event.request.method.clone(),
            params: event.request.params.clone(),
            chain_id: event.chain_id.clone(),
            synthetic: false,
            received_at: Utc::now(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic || self.id.is_switch()
    }
}

/// Owns the set of settled sessions and the single "active" session used for
/// address resolution. Responses are always routed by the originating
/// request's topic; the active flag only picks the session consulted for
/// non-topic-scoped state.
#[derive(Default)]
pub struct SessionManager {
    active: RwLock<Option<Session>>,
    all: RwLock<Vec<Session>>,
    connected: AtomicBool,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries the transport for existing sessions and, when at least one
    /// exists, restores the first as the active session. Safe to call
    /// repeatedly.
    pub async fn restore(&self, transport: &dyn SessionTransport) -> bool {
        match transport.all_sessions().await {
            Ok(sessions) if !sessions.is_empty() => {
                tracing::info!(count = sessions.len(), "restoring existing sessions");
                *self.active.write().unwrap() = Some(sessions[0].clone());
                *self.all.write().unwrap() = sessions;
                self.connected.store(true, Ordering::SeqCst);
                true
            }
            Ok(_) => {
                tracing::debug!("no existing sessions found");
                false
            }
            Err(e) => {
                tracing::warn!("failed to query sessions: {e}");
                false
            }
        }
    }

    /// Re-reads the full session list from the transport. The active session
    /// is left untouched.
    pub async fn refresh(&self, transport: &dyn SessionTransport) {
        match transport.all_sessions().await {
            Ok(sessions) => *self.all.write().unwrap() = sessions,
            Err(e) => tracing::warn!("failed to refresh session list: {e}"),
        }
    }

    /// Clears the active session and connected flag. Callers refresh the
    /// session list from the transport separately.
    pub fn on_deleted(&self) {
        *self.active.write().unwrap() = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Applies a namespace update to the matching session; no-op for other
    /// topics.
    pub fn on_updated(&self, topic: &str, namespaces: BTreeMap<String, SessionNamespace>) {
        {
            let mut active = self.active.write().unwrap();
            if let Some(session) = active.as_mut() {
                if session.topic == topic {
                    session.namespaces = namespaces.clone();
                }
            }
        }
        let mut all = self.all.write().unwrap();
        if let Some(session) = all.iter_mut().find(|s| s.topic == topic) {
            session.namespaces = namespaces;
        }
    }

    pub fn set_active(&self, session: Session) {
        *self.active.write().unwrap() = Some(session);
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn active(&self) -> Option<Session> {
        self.active.read().unwrap().clone()
    }

    pub fn all(&self) -> Vec<Session> {
        self.all.read().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Address of the active session's first account, if resolvable.
    pub fn resolve_address(&self) -> Option<Address> {
        self.active.read().unwrap().as_ref().and_then(Session::account_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryTransport;

    fn session_with_account(topic: &str, account: &str) -> Session {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(
            "eip155".to_string(),
            SessionNamespace {
                accounts: vec![account.to_string()],
                methods: vec!["personal_sign".to_string()],
                events: vec!["chainChanged".to_string()],
                chains: None,
            },
        );
        Session { topic: topic.to_string(), peer: PeerMetadata::default(), namespaces }
    }

    #[test]
    fn account_address_parses_caip10_entries() {
        let session = session_with_account(
            "topic-1",
            "eip155:1:0x1111111111111111111111111111111111111111",
        );
        let address = session.account_address().unwrap();
        assert_eq!(
            address,
            "0x1111111111111111111111111111111111111111".parse().unwrap()
        );

        let malformed = session_with_account("topic-2", "eip155:1:not-an-address");
        assert!(malformed.account_address().is_none());
    }

    #[tokio::test]
    async fn restore_is_idempotent_and_picks_first_session() {
        let transport = InMemoryTransport::new();
        let manager = SessionManager::new();
        assert!(!manager.restore(&transport).await);
        assert!(!manager.is_connected());

        transport.add_session(session_with_account(
            "topic-a",
            "eip155:1:0x2222222222222222222222222222222222222222",
        ));
        transport.add_session(session_with_account(
            "topic-b",
            "eip155:1:0x3333333333333333333333333333333333333333",
        ));

        assert!(manager.restore(&transport).await);
        assert!(manager.restore(&transport).await);
        assert_eq!(manager.active().unwrap().topic, "topic-a");
        assert_eq!(manager.all().len(), 2);
        assert!(manager.is_connected());
    }

    #[test]
    fn updates_only_apply_to_matching_topic() {
        let manager = SessionManager::new();
        manager.set_active(session_with_account(
            "topic-a",
            "eip155:1:0x2222222222222222222222222222222222222222",
        ));

        let mut updated = BTreeMap::new();
        updated.insert(
            "eip155".to_string(),
            SessionNamespace {
                accounts: vec!["eip155:137:0x2222222222222222222222222222222222222222".to_string()],
                methods: vec![],
                events: vec![],
                chains: None,
            },
        );

        manager.on_updated("other-topic", updated.clone());
        assert_eq!(
            manager.active().unwrap().primary_account().unwrap(),
            "eip155:1:0x2222222222222222222222222222222222222222"
        );

        manager.on_updated("topic-a", updated);
        assert_eq!(
            manager.active().unwrap().primary_account().unwrap(),
            "eip155:137:0x2222222222222222222222222222222222222222"
        );
    }

    #[test]
    fn delete_clears_active_and_connected() {
        let manager = SessionManager::new();
        manager.set_active(session_with_account(
            "topic-a",
            "eip155:1:0x2222222222222222222222222222222222222222",
        ));
        manager.on_deleted();
        assert!(manager.active().is_none());
        assert!(!manager.is_connected());
    }
}
