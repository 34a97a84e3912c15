//! Connection engine
//!
//! Owns the session manager, the pending-request queue, and the active
//! chain, and drives everything the relay pushes at the wallet through one
//! dispatch path. Interactive requests wait in the queue for user approval;
//! everything else is executed as it arrives.
//!
//! Lock discipline: state guards are released before any await point. The
//! active chain lives in a `watch` channel so chain-scoped readers always
//! see the current descriptor and can subscribe to switches.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::watch;

use crate::chain::{normalize_chain_id, split_caip2, ChainDescriptor, ChainRegistry};
use crate::classify::{classify, requires_key_material, Treatment, WALLET_EVENTS, WALLET_METHODS};
use crate::error::{ConnectError, Result};
use crate::events::EventPublisher;
use crate::mismatch::{ChainMismatchResolver, MismatchOutcome};
use crate::processor::RequestProcessor;
use crate::session::{PendingRequest, Session, SessionManager};
use crate::signer::{format_address, WalletSigner};
use crate::transport::{
    ErrorObject, InboundEvent, RequestId, RpcResponse, SessionNamespace, SessionProposal,
    SessionRpcRequest, SessionTransport,
};

/// Card prompt surfaced to the user when a request needs another tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionPrompt {
    pub title: String,
    pub message: String,
    pub request_id: RequestId,
}

impl ActionPrompt {
    fn for_error(error: &ConnectError, request_id: &RequestId) -> Self {
        let text = error.to_string();
        let message = if text.contains("missing card data") {
            "Please tap your card to provide the missing data."
        } else if text.contains("unlock") {
            "Please tap your card to unlock your wallet."
        } else {
            "Please tap your card to authorize the action."
        };
        Self {
            title: "Tap your card".to_string(),
            message: message.to_string(),
            request_id: request_id.clone(),
        }
    }
}

#[derive(Default)]
struct WalletState {
    pending_proposal: Option<SessionProposal>,
    pending_requests: Vec<PendingRequest>,
    deferred: Vec<SessionRpcRequest>,
    ready: bool,
    prompt: Option<ActionPrompt>,
}

pub struct ConnectionEngine {
    transport: Arc<dyn SessionTransport>,
    signer: Arc<dyn WalletSigner>,
    registry: Arc<dyn ChainRegistry>,
    sessions: SessionManager,
    chain: Arc<watch::Sender<ChainDescriptor>>,
    processor: RequestProcessor,
    publisher: EventPublisher,
    state: RwLock<WalletState>,
}

impl ConnectionEngine {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        signer: Arc<dyn WalletSigner>,
        registry: Arc<dyn ChainRegistry>,
        initial_chain: ChainDescriptor,
    ) -> Self {
        let (chain_tx, _) = watch::channel(initial_chain);
        let chain = Arc::new(chain_tx);
        let publisher = EventPublisher::new(transport.clone());
        let processor = RequestProcessor::new(
            signer.clone(),
            registry.clone(),
            chain.clone(),
            publisher.clone(),
        );
        Self {
            transport,
            signer,
            registry,
            sessions: SessionManager::new(),
            chain,
            processor,
            publisher,
            state: RwLock::new(WalletState::default()),
        }
    }

    // ---- lifecycle ----

    /// Restores previously settled sessions from the transport. Returns
    /// whether an active session was bound.
    pub async fn restore_sessions(&self) -> bool {
        self.sessions.restore(self.transport.as_ref()).await
    }

    /// Marks the wallet initialized and replays requests that arrived while
    /// it was not, in arrival order.
    pub async fn mark_ready(&self) {
        let deferred = {
            let mut state = self.state.write().unwrap();
            state.ready = true;
            std::mem::take(&mut state.deferred)
        };
        if !deferred.is_empty() {
            tracing::info!(count = deferred.len(), "replaying deferred requests");
        }
        for event in deferred {
            self.handle_request(event).await;
        }
    }

    /// Initiates pairing from a `wc:` URI.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        tracing::info!("pairing with dApp");
        self.transport.pair(uri).await
    }

    /// Disconnects the active session, if any.
    pub async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.sessions.active() else {
            tracing::debug!("no active session to disconnect");
            return Ok(());
        };
        self.disconnect_session(&session.topic).await
    }

    /// Disconnects every settled session.
    pub async fn disconnect_all(&self) -> Result<()> {
        for session in self.sessions.all() {
            if let Err(e) =
                self.transport.disconnect(&session.topic, ErrorObject::user_disconnected()).await
            {
                tracing::warn!(topic = %session.topic, "failed to disconnect session: {e}");
            }
        }
        self.sessions.on_deleted();
        {
            let mut state = self.state.write().unwrap();
            state.pending_requests.clear();
            state.prompt = None;
        }
        self.sessions.refresh(self.transport.as_ref()).await;
        Ok(())
    }

    /// Disconnects the session with the given topic.
    pub async fn disconnect_session(&self, topic: &str) -> Result<()> {
        tracing::info!(topic, "disconnecting session");
        self.transport.disconnect(topic, ErrorObject::user_disconnected()).await?;
        if self.sessions.active().map(|s| s.topic == topic).unwrap_or(false) {
            self.sessions.on_deleted();
            let mut state = self.state.write().unwrap();
            state.pending_requests.clear();
            state.prompt = None;
        }
        self.sessions.refresh(self.transport.as_ref()).await;
        Ok(())
    }

    // ---- inbound dispatch ----

    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Proposal(proposal) => {
                tracing::info!(
                    id = proposal.id,
                    dapp = %proposal.proposer.name,
                    "session proposal received"
                );
                self.state.write().unwrap().pending_proposal = Some(proposal);
            }
            InboundEvent::Request(request) => self.handle_request(request).await,
            InboundEvent::Delete { topic } => self.handle_delete(&topic).await,
            InboundEvent::Update { topic, namespaces } => {
                tracing::info!(%topic, "session updated");
                self.sessions.on_updated(&topic, namespaces);
            }
        }
    }

    async fn handle_delete(&self, topic: &str) {
        tracing::info!(topic, "session deleted by peer");
        self.sessions.on_deleted();
        {
            let mut state = self.state.write().unwrap();
            state.pending_requests.clear();
            state.prompt = None;
        }
        self.sessions.refresh(self.transport.as_ref()).await;
    }

    async fn handle_request(&self, event: SessionRpcRequest) {
        if !self.state.read().unwrap().ready {
            tracing::debug!(request_id = %event.id, "wallet not ready, deferring request");
            self.state.write().unwrap().deferred.push(event);
            return;
        }

        let request = PendingRequest::from_event(&event);
        let active = self.active_chain();

        // Chain scope is checked before anything else so a mismatched
        // request always yields the switch prompt first.
        if let MismatchOutcome::Intercept { switch, original } =
            ChainMismatchResolver::evaluate(&request, &active)
        {
            self.enqueue(switch);
            self.enqueue(original);
            return;
        }

        match classify(&request.method) {
            Treatment::Unsupported => {
                let error = ConnectError::UnsupportedMethod(request.method.clone());
                tracing::warn!(method = %request.method, "unsupported method");
                self.send_error(&request, &error).await;
            }
            Treatment::Interactive => {
                if request.method == "wallet_switchEthereumChain"
                    && self.targets_active_chain(&request, &active)
                {
                    // Already on the requested chain; acknowledge without
                    // prompting the user.
                    let _ = self.process_request(&request).await;
                    return;
                }
                tracing::debug!(request_id = %request.id, method = %request.method, "queueing for approval");
                self.enqueue(request);
            }
            Treatment::Sessionless => {
                let _ = self.process_request(&request).await;
            }
            Treatment::ReadOnly => {
                let matches_active = self
                    .sessions
                    .active()
                    .map(|s| s.topic == request.topic)
                    .unwrap_or(false);
                if matches_active {
                    let _ = self.process_request(&request).await;
                } else {
                    tracing::debug!(
                        request_id = %request.id,
                        "no matching session, holding request"
                    );
                    self.enqueue(request);
                }
            }
        }
    }

    fn targets_active_chain(&self, request: &PendingRequest, active: &ChainDescriptor) -> bool {
        let target = request
            .params
            .first()
            .and_then(|p| p.get("chainId"))
            .and_then(Value::as_str);
        matches!(
            (target.and_then(normalize_chain_id), normalize_chain_id(&active.chain_id)),
            (Some(a), Some(b)) if a == b
        )
    }

    fn enqueue(&self, request: PendingRequest) {
        let mut state = self.state.write().unwrap();
        if state.pending_requests.iter().any(|r| r.id == request.id) {
            tracing::debug!(request_id = %request.id, "request already pending");
            return;
        }
        state.pending_requests.push(request);
    }

    fn dequeue(&self, id: &RequestId) {
        self.state.write().unwrap().pending_requests.retain(|r| &r.id != id);
    }

    // ---- request execution ----

    /// Runs one request end to end: execute, respond, and settle the queue.
    /// A recoverable signing failure on an interactive method keeps the
    /// request pending behind a card prompt instead of answering the dApp.
    async fn process_request(&self, request: &PendingRequest) -> Result<Value> {
        let session = self.sessions.active();
        match self.processor.process(request, session.as_ref()).await {
            Ok(result) => {
                if !request.is_synthetic() {
                    let response = RpcResponse::ok(request.id.clone(), result.clone());
                    if let Err(e) = self.transport.respond(&request.topic, response).await {
                        tracing::error!(request_id = %request.id, "failed to send response: {e}");
                    }
                }
                self.dequeue(&request.id);
                self.state.write().unwrap().prompt = None;
                Ok(result)
            }
            Err(error) => {
                let interactive = classify(&request.method) == Treatment::Interactive;
                if interactive && error.is_recoverable() {
                    tracing::info!(
                        request_id = %request.id,
                        "recoverable signing failure, prompting for card"
                    );
                    self.state.write().unwrap().prompt =
                        Some(ActionPrompt::for_error(&error, &request.id));
                    self.enqueue(request.clone());
                    return Err(error);
                }
                self.send_error(request, &error).await;
                Err(error)
            }
        }
    }

    /// Sends a JSON-RPC error for the request and drops it from the queue.
    /// Synthetic switch prompts never answer the dApp.
    async fn send_error(&self, request: &PendingRequest, error: &ConnectError) {
        if !request.is_synthetic() {
            let response = RpcResponse::err(request.id.clone(), error.code(), error.to_string());
            if let Err(e) = self.transport.respond(&request.topic, response).await {
                tracing::error!(request_id = %request.id, "failed to send error response: {e}");
            }
        }
        self.dequeue(&request.id);
    }

    /// User approved a pending request, optionally supplying the card
    /// passcode. Key material is primed first except for chain bookkeeping
    /// methods, which never touch the key.
    pub async fn approve_request(&self, id: &RequestId, passcode: Option<&str>) -> Result<Value> {
        let request = self
            .state
            .read()
            .unwrap()
            .pending_requests
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| ConnectError::InvalidParams(format!("no pending request {id}")))?;

        if self.sessions.active().is_none() || !self.sessions.is_connected() {
            tracing::info!("no active session, attempting restore before approval");
            if !self.restore_sessions().await {
                return Err(ConnectError::NoSession);
            }
        }

        if requires_key_material(&request.method) {
            if let Err(e) = self.signer.prime_material(passcode).await {
                tracing::warn!("failed to prime key material: {e}");
                self.state.write().unwrap().prompt =
                    Some(ActionPrompt::for_error(&e, &request.id));
                return Err(e);
            }
        }

        self.process_request(&request).await
    }

    /// User rejected a pending request. The dApp gets a 4001 unless the
    /// request was an internally generated switch prompt.
    pub async fn reject_request(&self, id: &RequestId) -> Result<()> {
        let request = self
            .state
            .read()
            .unwrap()
            .pending_requests
            .iter()
            .find(|r| &r.id == id)
            .cloned()
            .ok_or_else(|| ConnectError::InvalidParams(format!("no pending request {id}")))?;

        tracing::info!(request_id = %id, method = %request.method, "request rejected by user");
        self.send_error(&request, &ConnectError::UserRejected).await;
        let mut state = self.state.write().unwrap();
        if state.prompt.as_ref().map(|p| &p.request_id == id).unwrap_or(false) {
            state.prompt = None;
        }
        Ok(())
    }

    // ---- session settlement ----

    /// User approved the pending session proposal. Namespaces are settled
    /// from the proposal filtered down to the chains this wallet supports,
    /// with the wallet's own method and event lists merged in.
    pub async fn approve_session(&self) -> Result<Session> {
        let proposal = self
            .state
            .read()
            .unwrap()
            .pending_proposal
            .clone()
            .ok_or_else(|| ConnectError::InvalidParams("no pending session proposal".to_string()))?;
        let address = self.signer.address().ok_or(ConnectError::NoAddress)?;
        let address = format_address(&address);

        let namespaces = self.settle_namespaces(&proposal, &address).await?;
        let topic = self.transport.approve_session(proposal.id, namespaces).await?;
        let session = self
            .transport
            .session(&topic)
            .await?
            .ok_or_else(|| ConnectError::Transport(format!("approved session {topic} not found")))?;

        self.sessions.set_active(session.clone());
        {
            let mut state = self.state.write().unwrap();
            state.pending_proposal = None;
        }

        // Tell the dApp where we actually are so it aligns chain and
        // account state right away. Failures here do not undo the approval.
        let chain = self.active_chain();
        self.publisher.chain_changed(&topic, &chain).await;
        if let Some(account) = session.account_address() {
            self.publisher.accounts_changed(&topic, account, &chain).await;
        }

        self.sessions.refresh(self.transport.as_ref()).await;
        tracing::info!(%topic, dapp = %session.peer.name, "session approved");
        Ok(session)
    }

    async fn settle_namespaces(
        &self,
        proposal: &SessionProposal,
        address: &str,
    ) -> Result<BTreeMap<String, SessionNamespace>> {
        let supported: Vec<u64> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .filter(|c| !c.is_testnet)
            .filter_map(|c| c.decimal_id().ok())
            .collect();

        // Optional namespaces first, required override per key.
        let mut requested = proposal.optional_namespaces.clone();
        for (key, ns) in &proposal.required_namespaces {
            requested.insert(key.clone(), ns.clone());
        }

        let mut namespaces = BTreeMap::new();
        for (key, ns) in requested {
            let chains: Vec<String> = ns
                .chains
                .iter()
                .filter(|c| {
                    split_caip2(c).map(|(_, dec)| supported.contains(&dec)).unwrap_or(false)
                })
                .cloned()
                .collect();

            let accounts: Vec<String> = if !chains.is_empty() {
                chains.iter().map(|c| format!("{c}:{address}")).collect()
            } else if key == "eip155" {
                // No overlap with what the dApp asked for; offer the active
                // chain so the session can still settle.
                let active = self.active_chain();
                vec![format!("{}:{address}", active.caip2()?)]
            } else {
                Vec::new()
            };
            if accounts.is_empty() {
                tracing::warn!(namespace = %key, "no supported chains for namespace, skipping");
                continue;
            }

            let mut methods = ns.methods.clone();
            for method in WALLET_METHODS {
                if !methods.iter().any(|m| m == method) {
                    methods.push((*method).to_string());
                }
            }
            let mut events = ns.events.clone();
            for event in WALLET_EVENTS {
                if !events.iter().any(|e| e == event) {
                    events.push((*event).to_string());
                }
            }

            let settled_chains =
                accounts.iter().filter_map(|a| a.rsplit_once(':').map(|(c, _)| c.to_string())).collect();
            namespaces.insert(
                key,
                SessionNamespace { accounts, methods, events, chains: Some(settled_chains) },
            );
        }

        if namespaces.is_empty() {
            return Err(ConnectError::InvalidParams(
                "no supported namespaces in session proposal".to_string(),
            ));
        }
        Ok(namespaces)
    }

    /// User rejected the pending session proposal.
    pub async fn reject_session(&self) -> Result<()> {
        let proposal = self
            .state
            .write()
            .unwrap()
            .pending_proposal
            .take()
            .ok_or_else(|| ConnectError::InvalidParams("no pending session proposal".to_string()))?;
        tracing::info!(id = proposal.id, "session proposal rejected");
        self.transport.reject_session(proposal.id, ErrorObject::user_rejected()).await
    }

    // ---- chain control ----

    /// User switched the wallet to another chain from the chain picker.
    pub async fn select_chain(&self, chain_id: &str) -> Result<ChainDescriptor> {
        let descriptor = self
            .registry
            .lookup(chain_id)
            .await
            .ok_or_else(|| ConnectError::ChainNotFound(chain_id.to_string()))?;
        tracing::info!(chain = %descriptor.display_name, "user selected chain");
        self.chain.send_replace(descriptor.clone());
        if let Some(session) = self.sessions.active() {
            self.publisher.chain_changed(&session.topic, &descriptor).await;
        }
        Ok(descriptor)
    }

    /// User accepted installing a chain (typically one a dApp proposed via
    /// `wallet_addEthereumChain`). Registers it and switches to it. The
    /// request itself only acknowledges; nothing reaches the registry
    /// without this call.
    pub async fn add_custom_chain(&self, descriptor: ChainDescriptor) -> Result<ChainDescriptor> {
        tracing::info!(chain = %descriptor.display_name, "user installed custom chain");
        self.registry.register(descriptor.clone()).await;
        self.select_chain(&descriptor.chain_id).await
    }

    // ---- accessors ----

    pub fn active_chain(&self) -> ChainDescriptor {
        self.chain.borrow().clone()
    }

    /// Subscribes to active-chain switches.
    pub fn chain_updates(&self) -> watch::Receiver<ChainDescriptor> {
        self.chain.subscribe()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.sessions.active()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.all()
    }

    pub fn is_connected(&self) -> bool {
        self.sessions.is_connected()
    }

    pub fn pending_proposal(&self) -> Option<SessionProposal> {
        self.state.read().unwrap().pending_proposal.clone()
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.state.read().unwrap().pending_requests.clone()
    }

    pub fn action_prompt(&self) -> Option<ActionPrompt> {
        self.state.read().unwrap().prompt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_text_tracks_the_signer_failure() {
        let id = RequestId::Number(1);

        let missing = ActionPrompt::for_error(
            &ConnectError::Signing("missing card data. Tap your card to continue.".to_string()),
            &id,
        );
        assert_eq!(missing.message, "Please tap your card to provide the missing data.");

        let locked = ActionPrompt::for_error(
            &ConnectError::Signing("tap your card to unlock the wallet".to_string()),
            &id,
        );
        assert_eq!(locked.message, "Please tap your card to unlock your wallet.");

        let generic = ActionPrompt::for_error(
            &ConnectError::Signing("wrong passcode, tap your card".to_string()),
            &id,
        );
        assert_eq!(generic.message, "Please tap your card to authorize the action.");
        assert_eq!(generic.title, "Tap your card");
        assert_eq!(generic.request_id, id);
    }
}
