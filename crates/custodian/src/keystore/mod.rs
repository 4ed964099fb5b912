//! Persisted key store collection: one encrypted entry per custody unit plus the selection.

pub mod crypto;

use crate::kv::KvStore;
use crypto::EncryptedSecret;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const INDEX_KEY: &str = "keystore-index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStoreKind {
    Mnemonic,
    PrivateKey,
    Ledger,
}

/// Hardware app a ledger-backed key lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerApp {
    Cosmos,
    Ethereum,
}

/// BIP44 path minus purpose and coin type (`m/44'/{coin}'/{account}'/{change}/{address_index}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bip44HdPath {
    pub account: u32,
    pub change: u32,
    pub address_index: u32,
}

impl Bip44HdPath {
    pub fn to_path_string(self, coin_type: u32) -> String {
        format!(
            "m/44'/{coin_type}'/{}'/{}/{}",
            self.account, self.change, self.address_index
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreEntry {
    pub id: String,
    pub kind: KeyStoreKind,
    /// Absent for ledger entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<EncryptedSecret>,
    /// Ledger entries only: lets the shared password gate hardware-backed entries too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_check: Option<EncryptedSecret>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub bip44_hd_path: Bip44HdPath,
    /// Chain identifier -> coin type picked the first time the chain was used.
    #[serde(default)]
    pub coin_type_for_chain: BTreeMap<String, u32>,
    /// Compressed secp256k1 keys reported by the device, hex encoded, per app.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ledger_public_keys: BTreeMap<LedgerApp, String>,
    pub created_at: String,
}

impl KeyStoreEntry {
    pub fn name(&self) -> &str {
        self.meta.get("name").map_or("", String::as_str)
    }

    /// Whichever sealed blob verifies the password for this entry.
    pub fn password_verifier(&self) -> eyre::Result<&EncryptedSecret> {
        self.crypto
            .as_ref()
            .or(self.password_check.as_ref())
            .ok_or_else(|| eyre::eyre!("key store {} has no password verifier", self.id))
    }
}

/// Public view of one entry; never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreInfo {
    pub index: usize,
    pub kind: KeyStoreKind,
    pub meta: BTreeMap<String, String>,
    pub bip44_hd_path: Bip44HdPath,
    pub coin_type_for_chain: BTreeMap<String, u32>,
    pub selected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreIndex {
    pub entries: Vec<KeyStoreEntry>,
    #[serde(default)]
    pub selected_index: usize,
}

impl KeyStoreIndex {
    pub fn load(kv: &dyn KvStore) -> eyre::Result<Self> {
        let Some(v) = kv.get(INDEX_KEY)? else {
            return Ok(Self::default());
        };
        let mut idx: Self = serde_json::from_value(v).context("parse keystore index")?;
        // A torn write can never leave a dangling selection behind.
        if idx.selected_index >= idx.entries.len() {
            idx.selected_index = 0;
        }
        Ok(idx)
    }

    pub fn save(&self, kv: &dyn KvStore) -> eyre::Result<()> {
        let v = serde_json::to_value(self).context("serialize keystore index")?;
        kv.set(INDEX_KEY, v).context("persist keystore index")
    }

    pub fn selected(&self) -> Option<&KeyStoreEntry> {
        self.entries.get(self.selected_index)
    }

    pub fn selected_mut(&mut self) -> Option<&mut KeyStoreEntry> {
        self.entries.get_mut(self.selected_index)
    }

    pub fn infos(&self) -> Vec<KeyStoreInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, e)| KeyStoreInfo {
                index,
                kind: e.kind,
                meta: e.meta.clone(),
                bip44_hd_path: e.bip44_hd_path,
                coin_type_for_chain: e.coin_type_for_chain.clone(),
                selected: index == self.selected_index,
            })
            .collect()
    }
}

pub fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}
