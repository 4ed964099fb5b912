//! The signing service: the only way a signature leaves the keyring.
//!
//! Each request resolves the chain's coin type and key, checks the asserted signer, waits for
//! the user, re-checks whatever the user could have changed, and only then signs. An
//! [`InFlightRequest`] guard announces the end of every request however it exits.

mod cosmos;
mod ethereum;
mod guard;
mod proxy;
mod verify;

pub use cosmos::{
    AminoSignOptions, AminoSignRequest, AminoSignResponse, DirectSignRequest, DirectSignResponse,
};
pub use ethereum::{EthereumBroadcast, EthereumSignRequest, TypedDataSignRequest};
pub use guard::InFlightRequest;
pub use proxy::{ProxyDecryptRequest, ProxyReEncryptRequest};
pub use verify::Adr36Verification;

use crate::{
    chains::{cosmos::amino::StdSignature, evm::RecoverableSignature},
    coin_type::Bip44Selectable,
    collab::{
        ApprovalInteraction, ApprovalRequest, ApprovalResponse, Audience, ChainInfoSource, Env,
        EventDispatcher, RpcTransport, EVENT_KEYSTORE_CHANGED, KIND_UNLOCK, ROUTE_UNLOCK,
    },
    config::{ChainInfo, FeeConfig},
    derive::Key,
    errors::KeyringError,
    keyring::{DeleteOutcome, ExportedKeyRing, KeyRing, KeyRingStatus, RingSnapshot},
    keystore::{crypto::EciesEnvelope, Bip44HdPath, KeyStoreInfo, KeyStoreKind},
    retry::BackoffConfig,
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use zeroize::Zeroizing;

/// External services the signing pipeline suspends on.
#[derive(Clone)]
pub struct Collaborators {
    pub chains: Arc<dyn ChainInfoSource>,
    pub approvals: Arc<dyn ApprovalInteraction>,
    pub events: Arc<dyn EventDispatcher>,
    pub rpc: Arc<dyn RpcTransport>,
}

/// One sign request, tagged by mode.
#[derive(Debug, Clone)]
pub enum SignRequest {
    Amino(AminoSignRequest),
    Direct(DirectSignRequest),
    Ethereum(EthereumSignRequest),
    EthereumTypedData(TypedDataSignRequest),
    ProxyDecrypt(ProxyDecryptRequest),
    ProxyReEncrypt(ProxyReEncryptRequest),
}

#[derive(Debug)]
pub enum SignResponse {
    Amino(AminoSignResponse),
    Direct(DirectSignResponse),
    Ethereum(EthereumBroadcast),
    EthereumTypedData(RecoverableSignature),
    ProxyDecrypt(Zeroizing<Vec<u8>>),
    ProxyReEncrypt(EciesEnvelope),
}

/// Public key material for a chain, as handed to a connected page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainKey {
    pub name: String,
    pub algo: crate::derive::KeyAlgo,
    pub pub_key: String,
    pub address: String,
    pub bech32_address: String,
    pub is_nano_ledger: bool,
}

/// Chain, coin type and derived key for the selected key store.
struct Resolved {
    chain: ChainInfo,
    coin_type: u32,
    key: Key,
}

/// The chain's native account encoding for `key`.
fn chain_address(chain: &ChainInfo, key: &Key) -> eyre::Result<String> {
    if chain.uses_hex_addresses() {
        Ok(key.hex_address())
    } else {
        key.bech32_address(&chain.bech32_prefix)
    }
}

/// `accept_hex` also admits the `0x` form of the key on bech32 chains.
fn ensure_signer(chain: &ChainInfo, key: &Key, signer: &str, accept_hex: bool) -> eyre::Result<()> {
    let native = chain_address(chain, key)?;
    let ok = if chain.uses_hex_addresses() {
        signer.eq_ignore_ascii_case(&native)
    } else {
        signer == native || (accept_hex && signer.eq_ignore_ascii_case(&key.hex_address()))
    };
    if ok {
        return Ok(());
    }
    Err(KeyringError::SignerMismatch {
        expected: native,
        actual: signer.to_owned(),
    }
    .into())
}

pub struct KeyRingService {
    keyring: Arc<KeyRing>,
    chains: Arc<dyn ChainInfoSource>,
    approvals: Arc<dyn ApprovalInteraction>,
    events: Arc<dyn EventDispatcher>,
    rpc: Arc<dyn RpcTransport>,
    fee: FeeConfig,
    backoff: BackoffConfig,
}

impl std::fmt::Debug for KeyRingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRingService")
            .field("keyring", &self.keyring)
            .field("fee", &self.fee)
            .finish_non_exhaustive()
    }
}

impl KeyRingService {
    pub fn new(
        keyring: Arc<KeyRing>,
        collab: Collaborators,
        fee: FeeConfig,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            keyring,
            chains: collab.chains,
            approvals: collab.approvals,
            events: collab.events,
            rpc: collab.rpc,
            fee,
            backoff,
        }
    }

    pub const fn keyring(&self) -> &Arc<KeyRing> {
        &self.keyring
    }

    fn keystore_changed(&self) {
        self.events
            .dispatch_event(Audience::Webpage, EVENT_KEYSTORE_CHANGED, json!({}));
    }

    async fn resolve(&self, chain_id: &str) -> eyre::Result<Resolved> {
        let chain = self.chains.chain_info(chain_id)?;
        let coin_type = self.keyring.compute_key_store_coin_type(&chain).await?;
        let key = self.keyring.get_key(coin_type).await?;
        Ok(Resolved { chain, coin_type, key })
    }

    /// Gate for privileged calls: loads the ring if needed and asks the user to unlock it.
    ///
    /// The returned status can still be `Locked` when the user dismissed the prompt.
    pub async fn enable(&self, env: &Env) -> eyre::Result<KeyRingStatus> {
        if self.keyring.status().await == KeyRingStatus::NotLoaded {
            self.keyring.restore().await?;
        }
        match self.keyring.status().await {
            KeyRingStatus::Empty => return Err(KeyringError::NoKeyRing.into()),
            KeyRingStatus::Locked => {}
            status @ (KeyRingStatus::Unlocked | KeyRingStatus::NotLoaded) => return Ok(status),
        }
        let resp = self
            .approvals
            .wait_approve(env, ROUTE_UNLOCK, KIND_UNLOCK, ApprovalRequest::Unlock)
            .await?;
        match resp {
            ApprovalResponse::Unlock { password: Some(pw) } => {
                self.keyring.unlock(&pw).await?;
            }
            ApprovalResponse::Unlock { password: None } => {}
            ApprovalResponse::Amino(_)
            | ApprovalResponse::Direct(_)
            | ApprovalResponse::Ethereum(_)
            | ApprovalResponse::Approved => {
                return Err(KeyringError::InvalidApprovalResponse.into())
            }
        }
        Ok(self.keyring.status().await)
    }

    pub async fn restore(&self) -> eyre::Result<KeyRingStatus> {
        self.keyring.restore().await
    }

    pub async fn unlock(&self, password: &SecretString) -> eyre::Result<KeyRingStatus> {
        self.keyring.unlock(password).await
    }

    pub async fn lock(&self) -> KeyRingStatus {
        self.keyring.lock().await
    }

    pub async fn get_key(&self, chain_id: &str) -> eyre::Result<ChainKey> {
        let r = self.resolve(chain_id).await?;
        let name = self
            .keyring
            .multi_key_store_info()
            .await?
            .into_iter()
            .find(|i| i.selected)
            .and_then(|i| i.meta.get("name").cloned())
            .unwrap_or_default();
        Ok(ChainKey {
            name,
            algo: r.key.algo,
            pub_key: hex::encode(&r.key.pub_key),
            address: hex::encode(r.key.address),
            bech32_address: chain_address(&r.chain, &r.key)?,
            is_nano_ledger: r.key.is_nano_ledger,
        })
    }

    pub async fn create_mnemonic_key(
        &self,
        mnemonic: &str,
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let out = self
            .keyring
            .create_mnemonic_key(mnemonic, password, name, path)
            .await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn create_private_key(
        &self,
        private_key: &[u8],
        password: &SecretString,
        name: &str,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.create_private_key(private_key, password, name).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn create_ledger_key(
        &self,
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.create_ledger_key(password, name, path).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn add_mnemonic_key(
        &self,
        mnemonic: &str,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.add_mnemonic_key(mnemonic, name, path).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn add_private_key(
        &self,
        private_key: &[u8],
        name: &str,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.add_private_key(private_key, name).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn add_ledger_key(
        &self,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.add_ledger_key(name, path).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn delete_key_ring(
        &self,
        index: usize,
        password: &SecretString,
    ) -> eyre::Result<DeleteOutcome> {
        let out = self.keyring.delete_key_ring(index, password).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn update_name_key_ring(
        &self,
        index: usize,
        name: &str,
    ) -> eyre::Result<Vec<KeyStoreInfo>> {
        let out = self.keyring.update_name_key_ring(index, name).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn show_key_ring(
        &self,
        index: usize,
        password: &SecretString,
    ) -> eyre::Result<Zeroizing<String>> {
        self.keyring.show_key_ring(index, password).await
    }

    pub async fn check_password(&self, password: &SecretString) -> eyre::Result<bool> {
        self.keyring.check_password(password).await
    }

    pub async fn change_password(
        &self,
        current: &SecretString,
        next: &SecretString,
    ) -> eyre::Result<()> {
        self.keyring.change_password(current, next).await
    }

    pub async fn export_key_ring_datas(
        &self,
        password: &SecretString,
    ) -> eyre::Result<Vec<ExportedKeyRing>> {
        self.keyring.export_key_ring_datas(password).await
    }

    pub async fn change_key_store_from_multi_key_store(
        &self,
        index: usize,
    ) -> eyre::Result<RingSnapshot> {
        let out = self.keyring.change_key_store_from_multi_key_store(index).await?;
        self.keystore_changed();
        Ok(out)
    }

    pub async fn multi_key_store_info(&self) -> eyre::Result<Vec<KeyStoreInfo>> {
        self.keyring.multi_key_store_info().await
    }

    pub async fn key_ring_type(&self) -> eyre::Result<KeyStoreKind> {
        self.keyring.key_ring_type().await
    }

    pub async fn get_key_store_bip44_selectables(
        &self,
        chain_id: &str,
    ) -> eyre::Result<Vec<Bip44Selectable>> {
        let chain = self.chains.chain_info(chain_id)?;
        self.keyring.bip44_selectables(&chain).await
    }

    pub async fn is_key_store_coin_type_set(&self, chain_id: &str) -> eyre::Result<bool> {
        let chain = self.chains.chain_info(chain_id)?;
        self.keyring.is_key_store_coin_type_set(&chain).await
    }

    /// Notifies observers only when the stored coin type actually changed.
    pub async fn set_key_store_coin_type(
        &self,
        chain_id: &str,
        coin_type: u32,
    ) -> eyre::Result<bool> {
        let chain = self.chains.chain_info(chain_id)?;
        let changed = self.keyring.set_key_store_coin_type(&chain, coin_type).await?;
        if changed {
            self.keystore_changed();
        }
        Ok(changed)
    }

    pub async fn request_sign(
        &self,
        env: &Env,
        request: SignRequest,
    ) -> eyre::Result<SignResponse> {
        match request {
            SignRequest::Amino(r) => self.request_sign_amino(env, r).await.map(SignResponse::Amino),
            SignRequest::Direct(r) => self
                .request_sign_direct(env, r)
                .await
                .map(SignResponse::Direct),
            SignRequest::Ethereum(r) => self
                .request_sign_ethereum(env, r)
                .await
                .map(SignResponse::Ethereum),
            SignRequest::EthereumTypedData(r) => self
                .request_sign_ethereum_typed_data(env, r)
                .await
                .map(SignResponse::EthereumTypedData),
            SignRequest::ProxyDecrypt(r) => self
                .request_proxy_decrypt(env, r)
                .await
                .map(SignResponse::ProxyDecrypt),
            SignRequest::ProxyReEncrypt(r) => self
                .request_proxy_reencrypt(env, r)
                .await
                .map(SignResponse::ProxyReEncrypt),
        }
    }

    pub async fn request_sign_amino(
        &self,
        env: &Env,
        req: AminoSignRequest,
    ) -> eyre::Result<AminoSignResponse> {
        cosmos::sign_amino(self, env, req).await
    }

    pub async fn request_sign_direct(
        &self,
        env: &Env,
        req: DirectSignRequest,
    ) -> eyre::Result<DirectSignResponse> {
        cosmos::sign_direct(self, env, req).await
    }

    /// Sign and broadcast a legacy Ethereum transaction; returns the transaction hash.
    pub async fn request_sign_ethereum(
        &self,
        env: &Env,
        req: EthereumSignRequest,
    ) -> eyre::Result<EthereumBroadcast> {
        ethereum::sign_legacy(self, env, req).await
    }

    pub async fn request_sign_ethereum_typed_data(
        &self,
        env: &Env,
        req: TypedDataSignRequest,
    ) -> eyre::Result<RecoverableSignature> {
        ethereum::sign_typed_data(self, env, req).await
    }

    pub async fn request_proxy_decrypt(
        &self,
        env: &Env,
        req: ProxyDecryptRequest,
    ) -> eyre::Result<Zeroizing<Vec<u8>>> {
        proxy::decrypt(self, env, req).await
    }

    pub async fn request_proxy_reencrypt(
        &self,
        env: &Env,
        req: ProxyReEncryptRequest,
    ) -> eyre::Result<EciesEnvelope> {
        proxy::reencrypt(self, env, req).await
    }

    pub async fn verify_adr36_amino_sign_doc(
        &self,
        chain_id: &str,
        signer: &str,
        data: &[u8],
        signature: &StdSignature,
    ) -> eyre::Result<bool> {
        Ok(self
            .verify_adr36_amino_sign_doc_detailed(chain_id, signer, data, signature)
            .await?
            == Adr36Verification::Valid)
    }

    pub async fn verify_adr36_amino_sign_doc_detailed(
        &self,
        chain_id: &str,
        signer: &str,
        data: &[u8],
        signature: &StdSignature,
    ) -> eyre::Result<Adr36Verification> {
        verify::verify_adr36(self, chain_id, signer, data, signature).await
    }
}
