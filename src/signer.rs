//! Wallet signer facade
//!
//! The engine never touches key material directly. Everything it needs from
//! the card is expressed through [`WalletSigner`]: address and connection
//! state, read-only RPC delegations, the four signing operations, and the
//! `prime_material` step that pulls key data off the card before signing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use ethers_core::types::transaction::eip712::TypedData;
use ethers_core::types::{Address, Bytes, Signature, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use serde_json::Value;

use crate::error::{ConnectError, Result};

/// Lower-case, "0x"-prefixed form of an address, the shape used in session
/// account entries and JSON-RPC results.
pub fn format_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

fn parse_address(value: &Value, field: &str) -> Result<Option<Address>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s
            .parse::<Address>()
            .map(Some)
            .map_err(|_| ConnectError::InvalidParams(format!("invalid address in `{field}`: {s}"))),
        Some(other) => Err(ConnectError::InvalidParams(format!("invalid `{field}`: {other}"))),
    }
}

fn parse_quantity(value: &Value, field: &str) -> Result<Option<U256>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                U256::from_str_radix(hex, 16).ok()
            } else {
                U256::from_dec_str(s).ok()
            };
            parsed
                .map(Some)
                .ok_or_else(|| ConnectError::InvalidParams(format!("invalid quantity in `{field}`: {s}")))
        }
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| Some(U256::from(v)))
            .ok_or_else(|| ConnectError::InvalidParams(format!("invalid quantity in `{field}`"))),
        Some(other) => Err(ConnectError::InvalidParams(format!("invalid `{field}`: {other}"))),
    }
}

fn parse_data(value: &Value, field: &str) -> Result<Option<Bytes>> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let raw = hex::decode(s.trim_start_matches("0x"))
                .map_err(|_| ConnectError::InvalidParams(format!("invalid hex in `{field}`: {s}")))?;
            Ok(Some(Bytes::from(raw)))
        }
        Some(other) => Err(ConnectError::InvalidParams(format!("invalid `{field}`: {other}"))),
    }
}

/// Read-only call parameters, as found in `eth_call`/`eth_estimateGas`
/// request params.
#[derive(Debug, Clone, Default)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub data: Option<Bytes>,
    pub value: Option<U256>,
}

impl CallRequest {
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(Self {
            from: parse_address(value, "from")?,
            to: parse_address(value, "to")?,
            data: parse_data(value, "data")?,
            value: parse_quantity(value, "value")?,
        })
    }
}

/// Transaction fields relayed to the signer for `eth_sendTransaction`.
#[derive(Debug, Clone, Default)]
pub struct TransactionParams {
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub data: Option<Bytes>,
    pub gas: Option<U256>,
    pub gas_price: Option<U256>,
    pub nonce: Option<U256>,
}

impl TransactionParams {
    pub fn from_value(value: &Value) -> Result<Self> {
        // dApps use either `gas` or the legacy `gasLimit` spelling
        let gas = match parse_quantity(value, "gas")? {
            Some(gas) => Some(gas),
            None => parse_quantity(value, "gasLimit")?,
        };
        Ok(Self {
            to: parse_address(value, "to")?,
            value: parse_quantity(value, "value")?,
            data: parse_data(value, "data")?,
            gas,
            gas_price: parse_quantity(value, "gasPrice")?,
            nonce: parse_quantity(value, "nonce")?,
        })
    }
}

/// Signing and chain-read capability consumed by the request processor.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    /// Wallet address, if the signer is connected.
    fn address(&self) -> Option<Address>;

    fn connected(&self) -> bool;

    /// Ensures key material is available for signing, optionally unlocking it
    /// with a passcode. Fails with a recoverable "tap your card" error when
    /// the card has not been presented yet.
    async fn prime_material(&self, secret: Option<&str>) -> Result<()>;

    // Read client
    async fn block_number(&self) -> Result<U256>;
    async fn gas_price(&self) -> Result<U256>;
    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256>;
    async fn get_code(&self, address: Address, block_tag: Option<&str>) -> Result<Bytes>;
    async fn call(&self, call: &CallRequest, block_tag: Option<&str>) -> Result<Bytes>;
    async fn native_balance(&self) -> Result<U256>;
    /// Transaction count for the address at the `pending` block tag.
    async fn transaction_count(&self, address: Address) -> Result<U256>;

    // Write client
    async fn send_transaction(&self, tx: &TransactionParams) -> Result<H256>;
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;
    async fn sign_typed_data(&self, typed: &TypedData) -> Result<Signature>;
}

/// Offline signer backed by a local key, for development and testing. Chain
/// reads return fixed values; signing goes through a real EIP-191/EIP-712
/// implementation so signatures verify. The lock flag simulates a card that
/// has not been tapped yet.
pub struct LocalKeySigner {
    wallet: LocalWallet,
    connected: AtomicBool,
    locked: AtomicBool,
    fail_reads: AtomicBool,
    balance: RwLock<U256>,
    nonce: RwLock<U256>,
}

impl LocalKeySigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self {
            wallet,
            connected: AtomicBool::new(true),
            locked: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            balance: RwLock::new(U256::exp10(18)),
            nonce: RwLock::new(U256::zero()),
        }
    }

    pub fn random() -> Self {
        Self::new(LocalWallet::new(&mut rand::thread_rng()))
    }

    /// Simulates the card being removed: signing fails with a recoverable
    /// error until `prime_material` runs with a passcode.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes chain reads fail, to exercise read-error fallbacks.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.write().unwrap() = balance;
    }

    pub fn set_nonce(&self, nonce: U256) {
        *self.nonce.write().unwrap() = nonce;
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(ConnectError::Signing(
                "missing card data. Tap your card to continue.".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ConnectError::Signing("RPC endpoint unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletSigner for LocalKeySigner {
    fn address(&self) -> Option<Address> {
        self.connected().then(|| self.wallet.address())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn prime_material(&self, secret: Option<&str>) -> Result<()> {
        if !self.locked.load(Ordering::SeqCst) {
            return Ok(());
        }
        if secret.is_some() {
            self.locked.store(false, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ConnectError::Signing(
                "tap your card to unlock the wallet".to_string(),
            ))
        }
    }

    async fn block_number(&self) -> Result<U256> {
        self.ensure_reads()?;
        Ok(U256::from(19_000_000u64))
    }

    async fn gas_price(&self) -> Result<U256> {
        self.ensure_reads()?;
        Ok(U256::from(1_000_000_000u64))
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256> {
        self.ensure_reads()?;
        let base = if call.data.as_ref().map(|d| !d.is_empty()).unwrap_or(false) {
            50_000u64
        } else {
            21_000u64
        };
        Ok(U256::from(base))
    }

    async fn get_code(&self, _address: Address, _block_tag: Option<&str>) -> Result<Bytes> {
        self.ensure_reads()?;
        Ok(Bytes::default())
    }

    async fn call(&self, _call: &CallRequest, _block_tag: Option<&str>) -> Result<Bytes> {
        self.ensure_reads()?;
        Ok(Bytes::default())
    }

    async fn native_balance(&self) -> Result<U256> {
        self.ensure_reads()?;
        Ok(*self.balance.read().unwrap())
    }

    async fn transaction_count(&self, _address: Address) -> Result<U256> {
        self.ensure_reads()?;
        Ok(*self.nonce.read().unwrap())
    }

    async fn send_transaction(&self, tx: &TransactionParams) -> Result<H256> {
        self.ensure_unlocked()?;
        // Deterministic pseudo-hash: there is no chain to broadcast to.
        let mut preimage = Vec::new();
        if let Some(to) = tx.to {
            preimage.extend_from_slice(to.as_bytes());
        }
        if let Some(data) = &tx.data {
            preimage.extend_from_slice(data);
        }
        let mut word = [0u8; 32];
        if let Some(value) = tx.value {
            value.to_big_endian(&mut word);
            preimage.extend_from_slice(&word);
        }
        if let Some(nonce) = tx.nonce {
            nonce.to_big_endian(&mut word);
            preimage.extend_from_slice(&word);
        }
        Ok(H256::from(keccak256(preimage)))
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        self.ensure_unlocked()?;
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| ConnectError::Signing(e.to_string()))
    }

    async fn sign_typed_data(&self, typed: &TypedData) -> Result<Signature> {
        self.ensure_unlocked()?;
        self.wallet
            .sign_typed_data(typed)
            .await
            .map_err(|e| ConnectError::Signing(e.to_string()))
    }
}
