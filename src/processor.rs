//! Per-method request execution
//!
//! The processor runs one approved (or immediately-executable) request
//! against the signer, the chain registry, and the active chain. It returns
//! the JSON-RPC result value; the engine owns queueing, responses, and
//! error mapping.

use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::transaction::eip712::TypedData;
use ethers_core::types::Address;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::chain::{normalize_chain_id, ChainDescriptor, ChainRegistry};
use crate::classify::{WALLET_EVENTS, WALLET_METHODS};
use crate::error::{ConnectError, Result};
use crate::events::EventPublisher;
use crate::session::{PendingRequest, Session};
use crate::signer::{format_address, CallRequest, TransactionParams, WalletSigner};

/// Methods that run without a bound session. The signer must still be
/// connected for them.
const ADDRESS_EXEMPT_METHODS: &[&str] =
    &["wallet_getCapabilities", "wallet_switchEthereumChain", "wallet_addEthereumChain"];

fn hex_quantity(value: ethers_core::types::U256) -> String {
    format!("0x{value:x}")
}

fn hex_signature(signature: &ethers_core::types::Signature) -> String {
    format!("0x{}", hex::encode(signature.to_vec()))
}

/// Bytes a dApp asked us to sign. A "0x"-prefixed string is raw bytes, any
/// other string is signed as UTF-8.
fn message_bytes(message: &str) -> Result<Vec<u8>> {
    if let Some(hex_body) = message.strip_prefix("0x") {
        hex::decode(hex_body)
            .map_err(|_| ConnectError::InvalidParams(format!("invalid hex message: {message}")))
    } else {
        Ok(message.as_bytes().to_vec())
    }
}

pub struct RequestProcessor {
    signer: Arc<dyn WalletSigner>,
    registry: Arc<dyn ChainRegistry>,
    chain: Arc<watch::Sender<ChainDescriptor>>,
    publisher: EventPublisher,
}

impl RequestProcessor {
    pub fn new(
        signer: Arc<dyn WalletSigner>,
        registry: Arc<dyn ChainRegistry>,
        chain: Arc<watch::Sender<ChainDescriptor>>,
        publisher: EventPublisher,
    ) -> Self {
        Self { signer, registry, chain, publisher }
    }

    fn active_chain(&self) -> ChainDescriptor {
        self.chain.borrow().clone()
    }

    /// Executes one request and returns its JSON-RPC result value.
    pub async fn process(&self, request: &PendingRequest, session: Option<&Session>) -> Result<Value> {
        let method = request.method.as_str();
        let address_exempt = ADDRESS_EXEMPT_METHODS.contains(&method);

        if address_exempt {
            if !self.signer.connected() {
                return Err(ConnectError::SignerNotConnected);
            }
            return self.process_exempt(request, session).await;
        }
        let address = session
            .and_then(Session::account_address)
            .or_else(|| self.signer.address())
            .ok_or(ConnectError::NoAddress)?;

        tracing::debug!(request_id = %request.id, method, address = %format_address(&address), "processing request");

        match method {
            "eth_accounts" | "eth_requestAccounts" => Ok(json!([format_address(&address)])),
            "eth_chainId" => Ok(json!(self.active_chain().chain_id)),
            "eth_blockNumber" => Ok(json!(hex_quantity(self.signer.block_number().await?))),
            "eth_gasPrice" => Ok(json!(hex_quantity(self.signer.gas_price().await?))),
            "eth_getBalance" => Ok(json!(hex_quantity(self.signer.native_balance().await?))),
            "eth_getTransactionCount" => {
                // A nonce read failure must not block the dApp
                match self.signer.transaction_count(address).await {
                    Ok(nonce) => Ok(json!(hex_quantity(nonce))),
                    Err(e) => {
                        tracing::warn!("transaction count lookup failed, defaulting to 0x0: {e}");
                        Ok(json!("0x0"))
                    }
                }
            }
            "eth_estimateGas" => {
                let call = CallRequest::from_value(request.params.first().unwrap_or(&Value::Null))?;
                Ok(json!(hex_quantity(self.signer.estimate_gas(&call).await?)))
            }
            "eth_getCode" => {
                let target = request
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<Address>().ok())
                    .ok_or_else(|| {
                        ConnectError::InvalidParams("eth_getCode expects an address".to_string())
                    })?;
                let block_tag = request.params.get(1).and_then(Value::as_str);
                let code = self.signer.get_code(target, block_tag).await?;
                Ok(json!(format!("0x{}", hex::encode(&code))))
            }
            "eth_call" => {
                let call = CallRequest::from_value(request.params.first().unwrap_or(&Value::Null))?;
                let block_tag = request.params.get(1).and_then(Value::as_str);
                let output = self.signer.call(&call, block_tag).await?;
                Ok(json!(format!("0x{}", hex::encode(&output))))
            }
            "eth_sign" => {
                // params are [address, message]
                let message = request.params.get(1).and_then(Value::as_str).ok_or_else(|| {
                    ConnectError::InvalidParams("eth_sign expects [address, message]".to_string())
                })?;
                let signature = self.signer.sign_message(&message_bytes(message)?).await?;
                Ok(json!(hex_signature(&signature)))
            }
            "personal_sign" => {
                // params are [message, address]
                let message = request.params.first().and_then(Value::as_str).ok_or_else(|| {
                    ConnectError::InvalidParams(
                        "personal_sign expects [message, address]".to_string(),
                    )
                })?;
                let signature = self.signer.sign_message(&message_bytes(message)?).await?;
                Ok(json!(hex_signature(&signature)))
            }
            "eth_signTypedData" | "eth_signTypedData_v4" => {
                let payload = request.params.get(1).ok_or_else(|| {
                    ConnectError::InvalidParams(format!("{method} expects [address, typedData]"))
                })?;
                let typed: TypedData = match payload {
                    Value::String(raw) => serde_json::from_str(raw)?,
                    other => serde_json::from_value(other.clone())?,
                };
                let signature = self.signer.sign_typed_data(&typed).await?;
                Ok(json!(hex_signature(&signature)))
            }
            "eth_sendTransaction" => {
                let tx =
                    TransactionParams::from_value(request.params.first().unwrap_or(&Value::Null))?;
                let hash = self.signer.send_transaction(&tx).await?;
                Ok(json!(format!("0x{}", hex::encode(hash.as_bytes()))))
            }
            other => Err(ConnectError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Address-exempt methods, reachable even when no account can be
    /// resolved from the session or the signer.
    async fn process_exempt(&self, request: &PendingRequest, session: Option<&Session>) -> Result<Value> {
        match request.method.as_str() {
            "wallet_getCapabilities" => self.capabilities().await,
            "wallet_switchEthereumChain" => {
                self.switch_chain(request, session.map(|s| s.topic.as_str())).await
            }
            "wallet_addEthereumChain" => self.add_chain(request).await,
            other => Err(ConnectError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn capabilities(&self) -> Result<Value> {
        let chains: Vec<String> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .filter(|c| !c.is_testnet)
            .filter_map(|c| c.caip2().ok())
            .collect();
        Ok(json!({
            "eip155": {
                "methods": WALLET_METHODS,
                "events": WALLET_EVENTS,
                "chains": chains,
            }
        }))
    }

    async fn switch_chain(&self, request: &PendingRequest, topic: Option<&str>) -> Result<Value> {
        let target = request
            .params
            .first()
            .and_then(|p| p.get("chainId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConnectError::InvalidParams(
                    "wallet_switchEthereumChain expects [{chainId}]".to_string(),
                )
            })?;

        let current = self.active_chain();
        let same = matches!(
            (normalize_chain_id(target), normalize_chain_id(&current.chain_id)),
            (Some(a), Some(b)) if a == b
        );
        if same {
            tracing::debug!(chain_id = target, "requested chain is already active");
            if let Some(topic) = topic {
                self.publisher.chain_changed(topic, &current).await;
            }
            return Ok(Value::Null);
        }

        let descriptor = self
            .registry
            .lookup(target)
            .await
            .ok_or_else(|| ConnectError::ChainNotFound(target.to_string()))?;
        tracing::info!(
            from = %current.display_name,
            to = %descriptor.display_name,
            "switching active chain"
        );
        self.chain.send_replace(descriptor.clone());
        // Let downstream chain watchers observe the change before the dApp
        // fires its next request.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(topic) = topic {
            self.publisher.chain_changed(topic, &descriptor).await;
        }
        Ok(Value::Null)
    }

    /// Acknowledges the add-chain request without touching the registry.
    /// Registering a dApp-provided chain needs explicit user consent, which
    /// the embedder collects before calling
    /// [`crate::engine::ConnectionEngine::add_custom_chain`].
    async fn add_chain(&self, request: &PendingRequest) -> Result<Value> {
        let params = request.params.first().ok_or_else(|| {
            ConnectError::InvalidParams("wallet_addEthereumChain expects [chainParams]".to_string())
        })?;
        let chain_id = params
            .get("chainId")
            .and_then(Value::as_str)
            .and_then(normalize_chain_id)
            .ok_or_else(|| {
                ConnectError::InvalidParams("wallet_addEthereumChain requires chainId".to_string())
            })?;
        let name = params.get("chainName").and_then(Value::as_str).unwrap_or(&chain_id);
        tracing::info!(%chain_id, name, "acknowledged add-chain request, awaiting user action");
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{default_chains, StaticChainRegistry};
    use crate::signer::LocalKeySigner;
    use crate::transport::{InMemoryTransport, RequestId};
    use chrono::Utc;

    fn processor() -> (RequestProcessor, Arc<LocalKeySigner>, Arc<InMemoryTransport>) {
        let signer = Arc::new(LocalKeySigner::random());
        let registry = Arc::new(StaticChainRegistry::with_defaults());
        let ethereum = default_chains().into_iter().find(|c| c.chain_id == "0x1").unwrap();
        let chain = Arc::new(watch::channel(ethereum).0);
        let transport = Arc::new(InMemoryTransport::new());
        let publisher = EventPublisher::new(transport.clone());
        (RequestProcessor::new(signer.clone(), registry, chain, publisher), signer, transport)
    }

    fn request(method: &str, params: Vec<Value>) -> PendingRequest {
        PendingRequest {
            id: RequestId::Number(1),
            topic: "topic-1".to_string(),
            method: method.to_string(),
            params,
            chain_id: Some("eip155:1".to_string()),
            synthetic: false,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn accounts_return_the_signer_address() {
        let (processor, signer, _) = processor();
        let result = processor.process(&request("eth_accounts", vec![]), None).await.unwrap();
        let expected = format_address(&signer.address().unwrap());
        assert_eq!(result, json!([expected]));
    }

    #[tokio::test]
    async fn chain_id_reports_the_active_chain() {
        let (processor, _, _) = processor();
        let result = processor.process(&request("eth_chainId", vec![]), None).await.unwrap();
        assert_eq!(result, json!("0x1"));
    }

    #[tokio::test]
    async fn transaction_count_defaults_to_zero_on_read_failure() {
        let (processor, signer, _) = processor();
        signer.set_fail_reads(true);
        let result =
            processor.process(&request("eth_getTransactionCount", vec![]), None).await.unwrap();
        assert_eq!(result, json!("0x0"));
    }

    #[tokio::test]
    async fn personal_sign_signs_hex_payload_as_raw_bytes() {
        let (processor, signer, _) = processor();
        let result = processor
            .process(&request("personal_sign", vec![json!("0xdeadbeef"), json!("0xabc")]), None)
            .await
            .unwrap();
        let signature = result.as_str().unwrap();
        assert!(signature.starts_with("0x"));
        let raw = hex::decode(signature.trim_start_matches("0x")).unwrap();
        let parsed = ethers_core::types::Signature::try_from(raw.as_slice()).unwrap();
        let recovered = parsed.recover(hex::decode("deadbeef").unwrap()).unwrap();
        assert_eq!(recovered, signer.address().unwrap());
    }

    #[tokio::test]
    async fn switch_to_unknown_chain_is_chain_not_found() {
        let (processor, _, _) = processor();
        let err = processor
            .process(
                &request("wallet_switchEthereumChain", vec![json!({"chainId": "0xdeadbeef"})]),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ChainNotFound(_)));
        assert_eq!(err.code(), crate::error::CODE_UNRECOGNIZED_CHAIN);
        assert_eq!(processor.active_chain().chain_id, "0x1");
    }

    #[tokio::test]
    async fn switch_to_known_chain_updates_watchers() {
        let (processor, _, transport) = processor();
        let result = processor
            .process(
                &request("wallet_switchEthereumChain", vec![json!({"chainId": "0x89"})]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(processor.active_chain().chain_id, "0x89");
        // Nobody to notify without a session.
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn same_chain_switch_without_session_emits_nothing() {
        let (processor, _, transport) = processor();
        let result = processor
            .process(
                &request("wallet_switchEthereumChain", vec![json!({"chainId": "0x1"})]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(processor.active_chain().chain_id, "0x1");
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn same_chain_switch_emits_without_mutating() {
        let (processor, _, transport) = processor();
        let session = Session {
            topic: "topic-1".to_string(),
            peer: Default::default(),
            namespaces: Default::default(),
        };
        let result = processor
            .process(
                &request("wallet_switchEthereumChain", vec![json!({"chainId": "1"})]),
                Some(&session),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
        assert_eq!(processor.active_chain().chain_id, "0x1");
        let events = transport.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.name, "chainChanged");
        assert_eq!(events[0].event.data, json!(1));
    }

    #[tokio::test]
    async fn add_chain_acknowledges_without_registering() {
        let (processor, _, _) = processor();
        let result = processor
            .process(
                &request(
                    "wallet_addEthereumChain",
                    vec![json!({
                        "chainId": "0xa4b1",
                        "chainName": "Arbitrum One",
                        "rpcUrls": ["https://rpc.attacker.example"],
                        "nativeCurrency": {"name": "Ethereum", "symbol": "ETH", "decimals": 18}
                    })],
                ),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Null);

        // The dApp cannot switch to the chain it asked for; only the user
        // can install it.
        let err = processor
            .process(
                &request("wallet_switchEthereumChain", vec![json!({"chainId": "0xa4b1"})]),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ChainNotFound(_)));
        assert_eq!(processor.active_chain().chain_id, "0x1");
    }

    #[tokio::test]
    async fn add_chain_without_chain_id_is_invalid() {
        let (processor, _, _) = processor();
        let err = processor
            .process(
                &request("wallet_addEthereumChain", vec![json!({"chainName": "Nameless"})]),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn capabilities_list_mainnet_chains_only() {
        let (processor, _, _) = processor();
        let result = processor.process(&request("wallet_getCapabilities", vec![]), None).await.unwrap();
        let chains = result["eip155"]["chains"].as_array().unwrap();
        assert!(chains.contains(&json!("eip155:1")));
        assert!(chains.contains(&json!("eip155:8453")));
        assert!(!chains.iter().any(|c| c == &json!("eip155:11155111")));
        assert!(result["eip155"]["methods"]
            .as_array()
            .unwrap()
            .contains(&json!("wallet_switchEthereumChain")));
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let (processor, _, _) = processor();
        let err =
            processor.process(&request("eth_signTransaction", vec![]), None).await.unwrap_err();
        assert!(matches!(err, ConnectError::UnsupportedMethod(_)));
        assert_eq!(err.code(), crate::error::CODE_METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn disconnected_signer_blocks_sessionless_methods() {
        let (processor, signer, _) = processor();
        signer.set_connected(false);
        let err =
            processor.process(&request("wallet_getCapabilities", vec![]), None).await.unwrap_err();
        assert!(matches!(err, ConnectError::SignerNotConnected));
    }
}
