//! The keyring: persisted key stores, the lock state machine and the in-memory session.
//!
//! Decrypted material lives only inside [`Session`] while the ring is unlocked. Every
//! mutation persists the new index first and only then swaps in-memory state, so a failed
//! write leaves the ring exactly as it was.

use crate::{
    chains::evm::signature_from_rsv,
    coin_type::{self, Bip44Selectable},
    collab::LedgerSigner,
    config::ChainInfo,
    derive::{self, Key, KeyAlgo, SessionSecret},
    errors::KeyringError,
    keystore::{
        crypto::{self, EciesEnvelope, KdfAlgorithm},
        utc_now_iso, Bip44HdPath, KeyStoreEntry, KeyStoreIndex, KeyStoreInfo, KeyStoreKind,
        LedgerApp,
    },
    kv::KvStore,
};
use alloy::{
    primitives::{Signature, B256},
    signers::{local::PrivateKeySigner, SignerSync as _},
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRingStatus {
    NotLoaded,
    Empty,
    Locked,
    Unlocked,
}

/// Status plus the public view of every key store, returned by mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSnapshot {
    pub status: KeyRingStatus,
    pub key_stores: Vec<KeyStoreInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub status: KeyRingStatus,
    pub key_stores: Vec<KeyStoreInfo>,
    /// The selected key store is a different one than before the delete.
    pub key_store_changed: bool,
}

/// One decrypted entry from [`KeyRing::export_key_ring_datas`].
#[derive(Debug)]
pub struct ExportedKeyRing {
    pub index: usize,
    pub kind: KeyStoreKind,
    pub meta: BTreeMap<String, String>,
    pub bip44_hd_path: Bip44HdPath,
    pub coin_type_for_chain: BTreeMap<String, u32>,
    /// Mnemonic phrase, or hex private key.
    pub secret: Zeroizing<String>,
}

struct Session {
    password: SecretString,
    /// `None` when the selected entry is hardware backed.
    secret: Option<SessionSecret>,
    keys: HashMap<u32, Key>,
}

#[derive(Default)]
struct RingState {
    loaded: bool,
    index: KeyStoreIndex,
    session: Option<Session>,
}

impl RingState {
    fn status(&self) -> KeyRingStatus {
        if !self.loaded {
            KeyRingStatus::NotLoaded
        } else if self.index.entries.is_empty() {
            KeyRingStatus::Empty
        } else if self.session.is_none() {
            KeyRingStatus::Locked
        } else {
            KeyRingStatus::Unlocked
        }
    }

    fn ensure_loaded(&self) -> eyre::Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(KeyringError::NotLoaded.into())
        }
    }

    fn ensure_unlocked(&self) -> eyre::Result<()> {
        match self.status() {
            KeyRingStatus::NotLoaded => Err(KeyringError::NotLoaded.into()),
            KeyRingStatus::Empty => Err(KeyringError::NoKeyRing.into()),
            KeyRingStatus::Locked => Err(KeyringError::Locked.into()),
            KeyRingStatus::Unlocked => Ok(()),
        }
    }

    fn selected(&self) -> eyre::Result<&KeyStoreEntry> {
        self.ensure_loaded()?;
        self.index
            .selected()
            .ok_or_else(|| KeyringError::NoKeyRing.into())
    }

    fn session(&self) -> eyre::Result<&Session> {
        self.ensure_unlocked()?;
        self.session.as_ref().ok_or_else(|| KeyringError::Locked.into())
    }

    fn snapshot(&self) -> RingSnapshot {
        RingSnapshot {
            status: self.status(),
            key_stores: self.index.infos(),
        }
    }

    /// Derived key for the selected entry, cached for the life of the session.
    fn key(&mut self, coin_type: u32) -> eyre::Result<Key> {
        self.ensure_unlocked()?;
        let entry = self.index.selected().ok_or(KeyringError::NoKeyRing)?;
        let session = self.session.as_mut().ok_or(KeyringError::Locked)?;
        if let Some(k) = session.keys.get(&coin_type) {
            return Ok(k.clone());
        }
        let key = derive_key(entry, session.secret.as_ref(), coin_type)?;
        session.keys.insert(coin_type, key.clone());
        Ok(key)
    }
}

fn derive_key(
    entry: &KeyStoreEntry,
    secret: Option<&SessionSecret>,
    coin_type: u32,
) -> eyre::Result<Key> {
    let algo = KeyAlgo::for_coin_type(coin_type);
    if entry.kind == KeyStoreKind::Ledger {
        let app = coin_type::ledger_app_for(coin_type);
        let pk_hex = entry.ledger_public_keys.get(&app).ok_or_else(|| {
            KeyringError::DerivationFailure(format!(
                "no {app:?} public key recorded for this ledger"
            ))
        })?;
        let pk = hex::decode(pk_hex)
            .map_err(|e| {
                KeyringError::DerivationFailure(format!("stored ledger public key: {e}"))
            })?;
        return Key::from_public_key(&pk, algo, true);
    }
    let secret = secret.ok_or(KeyringError::Locked)?;
    let sk = secret.private_key(coin_type, entry.bip44_hd_path)?;
    Key::from_private_key(&sk, algo)
}

fn dup_password(password: &SecretString) -> SecretString {
    SecretString::from(password.expose_secret().to_owned())
}

fn verify_entry_password(entry: &KeyStoreEntry, password: &SecretString) -> eyre::Result<()> {
    match entry.kind {
        KeyStoreKind::Ledger => {
            crypto::verify_password_check(&entry.id, entry.password_verifier()?, password)
        }
        KeyStoreKind::Mnemonic | KeyStoreKind::PrivateKey => {
            crypto::open_secret(&entry.id, entry.password_verifier()?, password).map(|_material| ())
        }
    }
}

fn open_session(entry: &KeyStoreEntry, password: &SecretString) -> eyre::Result<Session> {
    let secret = match entry.kind {
        KeyStoreKind::Ledger => {
            verify_entry_password(entry, password)?;
            None
        }
        KeyStoreKind::Mnemonic | KeyStoreKind::PrivateKey => {
            let material = crypto::open_secret(&entry.id, entry.password_verifier()?, password)?;
            Some(SessionSecret::from_material(entry.kind, &material)?)
        }
    };
    Ok(Session {
        password: dup_password(password),
        secret,
        keys: HashMap::new(),
    })
}

/// Human-readable form of decrypted entry material.
fn display_secret(kind: KeyStoreKind, material: &[u8]) -> eyre::Result<Zeroizing<String>> {
    match kind {
        KeyStoreKind::Mnemonic => {
            let s = std::str::from_utf8(material)
                .map_err(|_utf8| {
                    KeyringError::InvalidSecretMaterial("mnemonic must be utf-8".into())
                })?;
            Ok(Zeroizing::new(s.to_owned()))
        }
        KeyStoreKind::PrivateKey => Ok(Zeroizing::new(hex::encode(material))),
        KeyStoreKind::Ledger => {
            Err(KeyringError::InvalidOption(
                "ledger key stores hold no exportable secret".into(),
            )
            .into())
        }
    }
}

fn new_entry(kind: KeyStoreKind, name: &str, bip44_hd_path: Bip44HdPath) -> KeyStoreEntry {
    KeyStoreEntry {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        crypto: None,
        password_check: None,
        meta: BTreeMap::from([("name".to_owned(), name.to_owned())]),
        bip44_hd_path,
        coin_type_for_chain: BTreeMap::new(),
        ledger_public_keys: BTreeMap::new(),
        created_at: utc_now_iso(),
    }
}

fn reseal(
    entry: &KeyStoreEntry,
    kdf: KdfAlgorithm,
    current: &SecretString,
    next: &SecretString,
) -> eyre::Result<KeyStoreEntry> {
    let mut out = entry.clone();
    match entry.kind {
        KeyStoreKind::Ledger => {
            verify_entry_password(entry, current)?;
            out.password_check = Some(crypto::seal_password_check(&entry.id, kdf, next)?);
        }
        KeyStoreKind::Mnemonic | KeyStoreKind::PrivateKey => {
            let material = crypto::open_secret(&entry.id, entry.password_verifier()?, current)?;
            out.crypto = Some(crypto::seal_secret(&entry.id, kdf, next, &material)?);
        }
    }
    Ok(out)
}

/// What the signer needs once the ring lock is released.
enum SigningMaterial {
    Software { secret: Zeroizing<[u8; 32]>, algo: KeyAlgo },
    Ledger { path: Bip44HdPath, pub_key: Vec<u8>, algo: KeyAlgo },
}

pub struct KeyRing {
    kv: Arc<dyn KvStore>,
    ledger: Arc<dyn LedgerSigner>,
    kdf: KdfAlgorithm,
    state: RwLock<RingState>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing").field("kdf", &self.kdf).finish_non_exhaustive()
    }
}

impl KeyRing {
    pub fn new(kv: Arc<dyn KvStore>, ledger: Arc<dyn LedgerSigner>, kdf: KdfAlgorithm) -> Self {
        Self {
            kv,
            ledger,
            kdf,
            state: RwLock::new(RingState::default()),
        }
    }

    /// Load the persisted collection. A session already open in this process survives.
    pub async fn restore(&self) -> eyre::Result<KeyRingStatus> {
        let index = KeyStoreIndex::load(self.kv.as_ref())?;
        let mut st = self.state.write().await;
        if index.entries.is_empty() || index.selected_index != st.index.selected_index {
            st.session = None;
        }
        st.index = index;
        st.loaded = true;
        let status = st.status();
        tracing::info!(?status, entries = st.index.entries.len(), "keyring restored");
        Ok(status)
    }

    pub async fn status(&self) -> KeyRingStatus {
        self.state.read().await.status()
    }

    pub async fn unlock(&self, password: &SecretString) -> eyre::Result<KeyRingStatus> {
        let mut st = self.state.write().await;
        st.ensure_loaded()?;
        let entry = st.index.selected().ok_or(KeyringError::NoKeyRing)?;
        match open_session(entry, password) {
            Ok(session) => st.session = Some(session),
            Err(e) => {
                tracing::warn!("unlock failed");
                return Err(e);
            }
        }
        tracing::info!("keyring unlocked");
        Ok(st.status())
    }

    pub async fn lock(&self) -> KeyRingStatus {
        let mut st = self.state.write().await;
        st.session = None;
        tracing::info!("keyring locked");
        st.status()
    }

    async fn create_software_key(
        &self,
        kind: KeyStoreKind,
        material: &[u8],
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let secret = SessionSecret::from_material(kind, material)?;
        let mut st = self.state.write().await;
        st.ensure_loaded()?;
        if !st.index.entries.is_empty() {
            return Err(KeyringError::NotEmpty.into());
        }
        let mut entry = new_entry(kind, name, path);
        entry.crypto = Some(crypto::seal_secret(&entry.id, self.kdf, password, material)?);
        let next = KeyStoreIndex {
            entries: vec![entry],
            selected_index: 0,
        };
        next.save(self.kv.as_ref())?;
        st.index = next;
        st.session = Some(Session {
            password: dup_password(password),
            secret: Some(secret),
            keys: HashMap::new(),
        });
        tracing::info!(?kind, "key store created");
        Ok(st.snapshot())
    }

    pub async fn create_mnemonic_key(
        &self,
        mnemonic: &str,
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let phrase = derive::parse_mnemonic(mnemonic)?.to_string();
        self.create_software_key(KeyStoreKind::Mnemonic, phrase.as_bytes(), password, name, path)
            .await
    }

    pub async fn create_private_key(
        &self,
        private_key: &[u8],
        password: &SecretString,
        name: &str,
    ) -> eyre::Result<RingSnapshot> {
        self.create_software_key(
            KeyStoreKind::PrivateKey,
            private_key,
            password,
            name,
            Bip44HdPath::default(),
        )
        .await
    }

    async fn read_ledger_public_key(
        &self,
        app: LedgerApp,
        path: Bip44HdPath,
    ) -> eyre::Result<String> {
        let (coin_type, algo) = match app {
            LedgerApp::Cosmos => (derive::COSMOS_COIN_TYPE, KeyAlgo::Secp256k1),
            LedgerApp::Ethereum => (derive::ETH_COIN_TYPE, KeyAlgo::Ethsecp256k1),
        };
        self.ledger.open(app).await?;
        let pk = self.ledger.public_key(app, coin_type, path).await;
        self.ledger.close().await;
        let key = Key::from_public_key(&pk?, algo, true)?;
        Ok(hex::encode(key.pub_key))
    }

    /// The Cosmos app key is required. The Ethereum app key is recorded when the app answers;
    /// without it the entry cannot serve coin type 60 chains.
    async fn read_ledger_public_keys(
        &self,
        path: Bip44HdPath,
    ) -> eyre::Result<BTreeMap<LedgerApp, String>> {
        let mut keys = BTreeMap::new();
        keys.insert(
            LedgerApp::Cosmos,
            self.read_ledger_public_key(LedgerApp::Cosmos, path).await?,
        );
        match self.read_ledger_public_key(LedgerApp::Ethereum, path).await {
            Ok(pk) => {
                keys.insert(LedgerApp::Ethereum, pk);
            }
            Err(e) => {
                tracing::warn!(error = %e, "ethereum app unavailable; ledger entry is cosmos-only");
            }
        }
        Ok(keys)
    }

    fn ledger_entry(
        &self,
        public_keys: BTreeMap<LedgerApp, String>,
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<KeyStoreEntry> {
        let mut entry = new_entry(KeyStoreKind::Ledger, name, path);
        entry.password_check = Some(crypto::seal_password_check(&entry.id, self.kdf, password)?);
        entry.ledger_public_keys = public_keys;
        Ok(entry)
    }

    pub async fn create_ledger_key(
        &self,
        password: &SecretString,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        {
            let st = self.state.read().await;
            st.ensure_loaded()?;
            if !st.index.entries.is_empty() {
                return Err(KeyringError::NotEmpty.into());
            }
        }
        let public_keys = self.read_ledger_public_keys(path).await?;
        let entry = self.ledger_entry(public_keys, password, name, path)?;

        let mut st = self.state.write().await;
        if !st.index.entries.is_empty() {
            return Err(KeyringError::NotEmpty.into());
        }
        let next = KeyStoreIndex {
            entries: vec![entry],
            selected_index: 0,
        };
        next.save(self.kv.as_ref())?;
        st.index = next;
        st.session = Some(Session {
            password: dup_password(password),
            secret: None,
            keys: HashMap::new(),
        });
        tracing::info!(kind = ?KeyStoreKind::Ledger, "key store created");
        Ok(st.snapshot())
    }

    async fn append_entry(
        &self,
        build: impl FnOnce(&SecretString) -> eyre::Result<KeyStoreEntry>,
    ) -> eyre::Result<RingSnapshot> {
        let mut st = self.state.write().await;
        let password = &st.session()?.password;
        let entry = build(password)?;
        let kind = entry.kind;
        let mut next = st.index.clone();
        next.entries.push(entry);
        next.save(self.kv.as_ref())?;
        st.index = next;
        tracing::info!(index = st.index.entries.len() - 1, ?kind, "key store added");
        Ok(st.snapshot())
    }

    /// Append a mnemonic entry sealed under the session password. Selection is unchanged.
    pub async fn add_mnemonic_key(
        &self,
        mnemonic: &str,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        let phrase = Zeroizing::new(derive::parse_mnemonic(mnemonic)?.to_string());
        self.append_entry(|pw| {
            let mut entry = new_entry(KeyStoreKind::Mnemonic, name, path);
            entry.crypto = Some(crypto::seal_secret(&entry.id, self.kdf, pw, phrase.as_bytes())?);
            Ok(entry)
        })
        .await
    }

    pub async fn add_private_key(
        &self,
        private_key: &[u8],
        name: &str,
    ) -> eyre::Result<RingSnapshot> {
        SessionSecret::from_material(KeyStoreKind::PrivateKey, private_key)?;
        self.append_entry(|pw| {
            let mut entry = new_entry(KeyStoreKind::PrivateKey, name, Bip44HdPath::default());
            entry.crypto = Some(crypto::seal_secret(&entry.id, self.kdf, pw, private_key)?);
            Ok(entry)
        })
        .await
    }

    pub async fn add_ledger_key(
        &self,
        name: &str,
        path: Bip44HdPath,
    ) -> eyre::Result<RingSnapshot> {
        self.state.read().await.ensure_unlocked()?;
        let public_keys = self.read_ledger_public_keys(path).await?;
        self.append_entry(|pw| self.ledger_entry(public_keys, pw, name, path))
            .await
    }

    /// Remove the entry at `index` after checking `password` against it.
    pub async fn delete_key_ring(
        &self,
        index: usize,
        password: &SecretString,
    ) -> eyre::Result<DeleteOutcome> {
        let mut st = self.state.write().await;
        st.ensure_loaded()?;
        let entry = st
            .index
            .entries
            .get(index)
            .ok_or(KeyringError::IndexOutOfRange(index))?;
        verify_entry_password(entry, password)?;

        let was_selected = index == st.index.selected_index;
        let mut next = st.index.clone();
        next.entries.remove(index);
        if was_selected {
            next.selected_index = 0;
        } else if index < next.selected_index {
            next.selected_index -= 1;
        }
        next.save(self.kv.as_ref())?;

        let session_password = st.session.as_ref().map(|s| dup_password(&s.password));
        st.index = next;
        if was_selected {
            let reopened = match (st.index.selected(), session_password) {
                (Some(entry), Some(pw)) => open_session(entry, &pw)
                    .inspect_err(|e| tracing::warn!(error = %e, "re-unlock after delete failed"))
                    .ok(),
                (None, _) | (_, None) => None,
            };
            st.session = reopened;
        }
        tracing::info!(index, was_selected, "key store deleted");
        Ok(DeleteOutcome {
            status: st.status(),
            key_stores: st.index.infos(),
            key_store_changed: was_selected,
        })
    }

    pub async fn update_name_key_ring(
        &self,
        index: usize,
        name: &str,
    ) -> eyre::Result<Vec<KeyStoreInfo>> {
        let mut st = self.state.write().await;
        st.ensure_loaded()?;
        let mut next = st.index.clone();
        let entry = next
            .entries
            .get_mut(index)
            .ok_or(KeyringError::IndexOutOfRange(index))?;
        entry.meta.insert("name".into(), name.to_owned());
        next.save(self.kv.as_ref())?;
        st.index = next;
        Ok(st.index.infos())
    }

    /// Decrypt the entry at `index` for display. Nothing is cached.
    pub async fn show_key_ring(
        &self,
        index: usize,
        password: &SecretString,
    ) -> eyre::Result<Zeroizing<String>> {
        let st = self.state.read().await;
        st.ensure_unlocked()?;
        let entry = st
            .index
            .entries
            .get(index)
            .ok_or(KeyringError::IndexOutOfRange(index))?;
        if entry.kind == KeyStoreKind::Ledger {
            return display_secret(entry.kind, &[]);
        }
        let material = crypto::open_secret(&entry.id, entry.password_verifier()?, password)?;
        display_secret(entry.kind, &material)
    }

    /// Whether `password` opens the selected entry.
    pub async fn check_password(&self, password: &SecretString) -> eyre::Result<bool> {
        let st = self.state.read().await;
        let entry = st.selected()?;
        match verify_entry_password(entry, password) {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.downcast_ref::<KeyringError>(),
                    Some(KeyringError::WrongPassword)
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-seal every entry under `next` with fresh salts. All or nothing.
    pub async fn change_password(
        &self,
        current: &SecretString,
        next: &SecretString,
    ) -> eyre::Result<()> {
        let mut st = self.state.write().await;
        st.ensure_unlocked()?;
        let entries = st
            .index
            .entries
            .iter()
            .map(|e| reseal(e, self.kdf, current, next))
            .collect::<eyre::Result<Vec<_>>>()?;
        let updated = KeyStoreIndex {
            entries,
            selected_index: st.index.selected_index,
        };
        updated.save(self.kv.as_ref())?;
        st.index = updated;
        if let Some(session) = st.session.as_mut() {
            session.password = dup_password(next);
        }
        tracing::info!("keyring password changed");
        Ok(())
    }

    /// Decrypt every software entry. Ledger entries have nothing to export and are skipped.
    pub async fn export_key_ring_datas(
        &self,
        password: &SecretString,
    ) -> eyre::Result<Vec<ExportedKeyRing>> {
        let st = self.state.read().await;
        st.ensure_unlocked()?;
        let mut out = Vec::with_capacity(st.index.entries.len());
        for (index, entry) in st.index.entries.iter().enumerate() {
            if entry.kind == KeyStoreKind::Ledger {
                continue;
            }
            let material = crypto::open_secret(&entry.id, entry.password_verifier()?, password)?;
            out.push(ExportedKeyRing {
                index,
                kind: entry.kind,
                meta: entry.meta.clone(),
                bip44_hd_path: entry.bip44_hd_path,
                coin_type_for_chain: entry.coin_type_for_chain.clone(),
                secret: display_secret(entry.kind, &material)?,
            });
        }
        Ok(out)
    }

    /// Select another entry, opening it with the session password.
    pub async fn change_key_store_from_multi_key_store(
        &self,
        index: usize,
    ) -> eyre::Result<RingSnapshot> {
        let mut st = self.state.write().await;
        let session = open_session(
            st.index
                .entries
                .get(index)
                .ok_or(KeyringError::IndexOutOfRange(index))?,
            &st.session()?.password,
        )?;
        let mut next = st.index.clone();
        next.selected_index = index;
        next.save(self.kv.as_ref())?;
        st.index = next;
        st.session = Some(session);
        tracing::info!(index, "key store selected");
        Ok(st.snapshot())
    }

    pub async fn multi_key_store_info(&self) -> eyre::Result<Vec<KeyStoreInfo>> {
        let st = self.state.read().await;
        st.ensure_loaded()?;
        Ok(st.index.infos())
    }

    pub async fn key_ring_type(&self) -> eyre::Result<KeyStoreKind> {
        Ok(self.state.read().await.selected()?.kind)
    }

    pub async fn get_key(&self, coin_type: u32) -> eyre::Result<Key> {
        self.state.write().await.key(coin_type)
    }

    pub async fn compute_key_store_coin_type(&self, chain: &ChainInfo) -> eyre::Result<u32> {
        let st = self.state.read().await;
        Ok(coin_type::compute_coin_type(st.selected()?, chain))
    }

    pub async fn is_key_store_coin_type_set(&self, chain: &ChainInfo) -> eyre::Result<bool> {
        let st = self.state.read().await;
        Ok(coin_type::is_coin_type_set(st.selected()?, chain))
    }

    /// Fix the coin type the selected entry uses on `chain`. Returns whether anything changed.
    pub async fn set_key_store_coin_type(
        &self,
        chain: &ChainInfo,
        coin_type: u32,
    ) -> eyre::Result<bool> {
        coin_type::ensure_candidate(chain, coin_type)?;
        let mut st = self.state.write().await;
        let entry = st.selected()?;
        if entry.kind == KeyStoreKind::Ledger {
            return Err(KeyringError::InvalidOption(
                "ledger key stores use a fixed coin type".into(),
            )
            .into());
        }
        let identifier = coin_type::chain_identifier(&chain.chain_id).to_owned();
        if entry.coin_type_for_chain.get(&identifier) == Some(&coin_type) {
            return Ok(false);
        }
        let mut next = st.index.clone();
        if let Some(e) = next.selected_mut() {
            e.coin_type_for_chain.insert(identifier.clone(), coin_type);
        }
        next.save(self.kv.as_ref())?;
        st.index = next;
        tracing::info!(chain = %identifier, coin_type, "coin type set");
        Ok(true)
    }

    /// Candidate paths with their addresses, for a chain whose coin type is still open.
    pub async fn bip44_selectables(&self, chain: &ChainInfo) -> eyre::Result<Vec<Bip44Selectable>> {
        let mut st = self.state.write().await;
        let entry = st.selected()?;
        let path = entry.bip44_hd_path;
        let candidates = coin_type::selectable_coin_types(entry, chain);
        let mut out = Vec::with_capacity(candidates.len());
        for ct in candidates {
            let key = st.key(ct)?;
            let bech32_address = if chain.uses_hex_addresses() {
                key.hex_address()
            } else {
                key.bech32_address(&chain.bech32_prefix)?
            };
            out.push(Bip44Selectable {
                coin_type: ct,
                path: path.to_path_string(ct),
                bech32_address,
            });
        }
        Ok(out)
    }

    /// Resolve signing material for the selected entry, refusing if its key is no longer
    /// `expected_pub_key`. The ring lock is released before any device I/O.
    async fn signing_material(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
    ) -> eyre::Result<SigningMaterial> {
        let mut st = self.state.write().await;
        let key = st.key(coin_type)?;
        if key.pub_key != expected_pub_key {
            return Err(KeyringError::SignerMismatch {
                expected: hex::encode(expected_pub_key),
                actual: hex::encode(&key.pub_key),
            }
            .into());
        }
        let entry = st.selected()?;
        if key.is_nano_ledger {
            return Ok(SigningMaterial::Ledger {
                path: entry.bip44_hd_path,
                pub_key: key.pub_key,
                algo: key.algo,
            });
        }
        let path = entry.bip44_hd_path;
        let secret = st
            .session()?
            .secret
            .as_ref()
            .ok_or(KeyringError::Locked)?
            .private_key(coin_type, path)?;
        Ok(SigningMaterial::Software { secret, algo: key.algo })
    }

    /// 64-byte `r || s` signature over `message`, digested per the coin type's algorithm.
    pub async fn sign(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
        message: &[u8],
    ) -> eyre::Result<[u8; 64]> {
        match self.signing_material(coin_type, expected_pub_key).await? {
            SigningMaterial::Software { secret, algo } => {
                derive::sign_digest(&secret, &algo.digest(message))
            }
            SigningMaterial::Ledger { path, pub_key, algo } => {
                let app = coin_type::ledger_app_for(coin_type);
                self.ledger.open(app).await?;
                let sig = match algo {
                    KeyAlgo::Secp256k1 => self.ledger.sign(path, &pub_key, message).await,
                    KeyAlgo::Ethsecp256k1 => self
                        .ledger
                        .sign_ethereum(path, &pub_key, &algo.digest(message))
                        .await
                        .and_then(|rsv| {
                            rsv.get(..64)
                                .and_then(|rs| <[u8; 64]>::try_from(rs).ok())
                                .ok_or_else(|| {
                                    KeyringError::DerivationFailure(
                                        "short ledger signature".into(),
                                    )
                                    .into()
                                })
                        }),
                };
                self.ledger.close().await;
                sig.inspect_err(|e| tracing::warn!(error = %e, "ledger signing failed"))
            }
        }
    }

    /// Recoverable signature over a 32-byte Ethereum digest.
    pub async fn sign_ethereum_hash(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
        digest: &[u8; 32],
    ) -> eyre::Result<Signature> {
        match self.signing_material(coin_type, expected_pub_key).await? {
            SigningMaterial::Software { secret, .. } => {
                let signer = PrivateKeySigner::from_slice(secret.as_slice())
                    .map_err(|e| KeyringError::DerivationFailure(format!("signer: {e}")))?;
                signer
                    .sign_hash_sync(&B256::from(*digest))
                    .map_err(|e| KeyringError::DerivationFailure(format!("sign hash: {e}")).into())
            }
            SigningMaterial::Ledger { path, pub_key, .. } => {
                self.ledger.open(LedgerApp::Ethereum).await?;
                let rsv = self.ledger.sign_ethereum(path, &pub_key, digest).await;
                self.ledger.close().await;
                signature_from_rsv(&rsv?)
            }
        }
    }

    async fn software_secret(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
    ) -> eyre::Result<Zeroizing<[u8; 32]>> {
        match self.signing_material(coin_type, expected_pub_key).await? {
            SigningMaterial::Software { secret, .. } => Ok(secret),
            SigningMaterial::Ledger { .. } => {
                Err(KeyringError::InvalidOption(
                    "proxy re-encryption requires a software key".into(),
                )
                .into())
            }
        }
    }

    pub async fn proxy_decrypt(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
        envelope: &EciesEnvelope,
    ) -> eyre::Result<Zeroizing<Vec<u8>>> {
        let secret = self.software_secret(coin_type, expected_pub_key).await?;
        crypto::ecies_decrypt(&secret, envelope)
    }

    /// Open `envelope` and seal the plaintext again for `recipient_pub_key`.
    pub async fn proxy_reencrypt(
        &self,
        coin_type: u32,
        expected_pub_key: &[u8],
        envelope: &EciesEnvelope,
        recipient_pub_key: &[u8],
    ) -> eyre::Result<EciesEnvelope> {
        let secret = self.software_secret(coin_type, expected_pub_key).await?;
        let plaintext = crypto::ecies_decrypt(&secret, envelope)?;
        crypto::ecies_encrypt(recipient_pub_key, &plaintext)
    }
}
