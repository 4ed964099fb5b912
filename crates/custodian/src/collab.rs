//! Contracts for everything the keyring consumes but does not own: the approval UI, event
//! observers, chain metadata, hardware signers and the RPC transport.

use crate::{
    chains::{
        cosmos::amino::StdSignDoc,
        evm::{EthereumTxDraft, TypedDataVersion},
    },
    config::ChainInfo,
    errors::KeyringError,
    keystore::{crypto::EciesEnvelope, Bip44HdPath, LedgerApp},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const EVENT_KEYSTORE_CHANGED: &str = "keystore-changed";
pub const EVENT_REQUEST_SIGN_END: &str = "request-sign-end";
pub const EVENT_REQUEST_SIGN_ETHEREUM_END: &str = "request-sign-ethereum-end";

pub const ROUTE_UNLOCK: &str = "/unlock";
pub const ROUTE_SIGN: &str = "/sign";
pub const ROUTE_SIGN_ETHEREUM: &str = "/sign-ethereum";

pub const KIND_UNLOCK: &str = "unlock";
pub const KIND_REQUEST_SIGN: &str = "request-sign";
pub const KIND_REQUEST_SIGN_ETHEREUM: &str = "request-sign-ethereum";

/// Who is asking. Internal requests come from the wallet's own UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    pub origin: String,
    pub is_internal: bool,
}

impl Env {
    pub fn internal() -> Self {
        Self {
            origin: "internal".into(),
            is_internal: true,
        }
    }

    pub fn origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            is_internal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    App,
    Webpage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedEvent {
    pub audience: Audience,
    pub event: String,
    pub data: Value,
}

/// Fire-and-forget notifications; implementations must not block.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, audience: Audience, event: &str, data: Value);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

impl EventDispatcher for TracingEvents {
    fn dispatch_event(&self, audience: Audience, event: &str, data: Value) {
        tracing::info!(?audience, event, %data, "event");
    }
}

/// Fans events out to every live subscriber. Events sent with no subscriber are dropped.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    tx: broadcast::Sender<DispatchedEvent>,
}

impl ChannelEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchedEvent> {
        self.tx.subscribe()
    }
}

impl EventDispatcher for ChannelEvents {
    fn dispatch_event(&self, audience: Audience, event: &str, data: Value) {
        let _: Result<usize, _> = self.tx.send(DispatchedEvent {
            audience,
            event: event.to_owned(),
            data,
        });
    }
}

/// Default fees shown next to an Ethereum transaction so the user has something to edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_gas_price: Option<String>,
    pub estimated_gas_limit: String,
    pub fee_currency_decimals: u8,
}

/// What the approval UI is asked to show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ApprovalRequest {
    Unlock,
    SignAmino {
        chain_id: String,
        signer: String,
        sign_doc: StdSignDoc,
        is_adr36: bool,
        is_adr36_with_string: bool,
    },
    SignDirect {
        chain_id: String,
        signer: String,
        sign_doc_bytes: Vec<u8>,
    },
    SignEthereum {
        chain_id: String,
        signer: String,
        draft: EthereumTxDraft,
        fee_hints: FeeHints,
    },
    SignEthereumTypedData {
        chain_id: String,
        signer: Option<String>,
        typed_data: Value,
        version: TypedDataVersion,
    },
    ProxyDecrypt {
        chain_id: String,
        signer: String,
        envelope: EciesEnvelope,
        fee_hints: Option<FeeHints>,
    },
    ProxyReEncrypt {
        chain_id: String,
        signer: String,
        envelope: EciesEnvelope,
        recipient_pub_key: String,
        fee_hints: Option<FeeHints>,
    },
}

/// User edits to an Ethereum transaction. Unset fields keep the draft or estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumApproval {
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub gas_limit: Option<String>,
    /// Total fee in wei the user agreed to. Caps `gas_price * gas_limit`, or sets the price
    /// when `gas_price` is left out.
    #[serde(default)]
    pub fees: Option<String>,
}

#[derive(Debug)]
pub enum ApprovalResponse {
    /// `None` when the user dismissed the prompt without unlocking.
    Unlock { password: Option<SecretString> },
    Amino(StdSignDoc),
    Direct(Vec<u8>),
    Ethereum(EthereumApproval),
    Approved,
}

/// Suspends until the user answers. A refusal is [`KeyringError::ApprovalRejected`].
#[async_trait::async_trait]
pub trait ApprovalInteraction: Send + Sync {
    async fn wait_approve(
        &self,
        env: &Env,
        route: &str,
        kind: &str,
        request: ApprovalRequest,
    ) -> eyre::Result<ApprovalResponse>;
}

pub trait ChainInfoSource: Send + Sync {
    fn chain_info(&self, chain_id: &str) -> eyre::Result<ChainInfo>;
}

#[derive(Debug, Clone)]
pub struct ConfigChainRegistry {
    chains: Vec<ChainInfo>,
}

impl ConfigChainRegistry {
    pub const fn new(chains: Vec<ChainInfo>) -> Self {
        Self { chains }
    }
}

impl ChainInfoSource for ConfigChainRegistry {
    fn chain_info(&self, chain_id: &str) -> eyre::Result<ChainInfo> {
        self.chains
            .iter()
            .find(|c| c.chain_id == chain_id)
            .cloned()
            .ok_or_else(|| KeyringError::UnknownChain(chain_id.to_owned()).into())
    }
}

/// Device I/O for ledger-backed key stores.
#[async_trait::async_trait]
pub trait LedgerSigner: Send + Sync {
    async fn open(&self, app: LedgerApp) -> eyre::Result<()>;
    async fn close(&self);
    /// Compressed secp256k1 public key at `path` in `app`.
    async fn public_key(
        &self,
        app: LedgerApp,
        coin_type: u32,
        path: Bip44HdPath,
    ) -> eyre::Result<Vec<u8>>;
    /// 64-byte `r || s` signature by the Cosmos app over `message`.
    async fn sign(
        &self,
        path: Bip44HdPath,
        pub_key: &[u8],
        message: &[u8],
    ) -> eyre::Result<[u8; 64]>;
    /// 65-byte `r || s || v` signature by the Ethereum app over a 32-byte digest.
    async fn sign_ethereum(
        &self,
        path: Bip44HdPath,
        pub_key: &[u8],
        digest: &[u8; 32],
    ) -> eyre::Result<Vec<u8>>;
}

/// Stand-in for hosts without hardware support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLedger;

#[async_trait::async_trait]
impl LedgerSigner for NoLedger {
    async fn open(&self, _app: LedgerApp) -> eyre::Result<()> {
        Err(KeyringError::HardwareUnavailable.into())
    }

    async fn close(&self) {}

    async fn public_key(
        &self,
        _app: LedgerApp,
        _coin_type: u32,
        _path: Bip44HdPath,
    ) -> eyre::Result<Vec<u8>> {
        Err(KeyringError::HardwareUnavailable.into())
    }

    async fn sign(
        &self,
        _path: Bip44HdPath,
        _pub_key: &[u8],
        _message: &[u8],
    ) -> eyre::Result<[u8; 64]> {
        Err(KeyringError::HardwareUnavailable.into())
    }

    async fn sign_ethereum(
        &self,
        _path: Bip44HdPath,
        _pub_key: &[u8],
        _digest: &[u8; 32],
    ) -> eyre::Result<Vec<u8>> {
        Err(KeyringError::HardwareUnavailable.into())
    }
}

#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, url: &str, method: &str, params: Value) -> eyre::Result<Value>;
}
