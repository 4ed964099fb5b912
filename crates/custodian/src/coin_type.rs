//! Which BIP44 coin type a key store uses on a given chain.

use crate::{
    config::ChainInfo,
    derive::{COSMOS_COIN_TYPE, ETH_COIN_TYPE},
    errors::KeyringError,
    keystore::{KeyStoreEntry, KeyStoreKind, LedgerApp},
};
use serde::{Deserialize, Serialize};

/// Chain id without its trailing `-<revision>`, so overrides survive chain upgrades.
///
/// `cosmoshub-4` -> `cosmoshub`, `evmos_9001-2` -> `evmos_9001`, `eip155:1` unchanged.
pub fn chain_identifier(chain_id: &str) -> &str {
    match chain_id.rsplit_once('-') {
        Some((head, rev))
            if !head.is_empty() && !rev.is_empty() && rev.bytes().all(|b| b.is_ascii_digit()) =>
        {
            head
        }
        _ => chain_id,
    }
}

/// Hardware app that owns keys for `coin_type`.
pub const fn ledger_app_for(coin_type: u32) -> LedgerApp {
    if coin_type == ETH_COIN_TYPE {
        LedgerApp::Ethereum
    } else {
        LedgerApp::Cosmos
    }
}

pub fn compute_coin_type(entry: &KeyStoreEntry, chain: &ChainInfo) -> u32 {
    if entry.kind == KeyStoreKind::Ledger {
        return match ledger_app_for(chain.coin_type) {
            LedgerApp::Ethereum => ETH_COIN_TYPE,
            LedgerApp::Cosmos => COSMOS_COIN_TYPE,
        };
    }
    entry
        .coin_type_for_chain
        .get(chain_identifier(&chain.chain_id))
        .copied()
        .unwrap_or(chain.coin_type)
}

pub fn is_coin_type_set(entry: &KeyStoreEntry, chain: &ChainInfo) -> bool {
    entry.kind == KeyStoreKind::Ledger
        || chain.candidate_coin_types().len() <= 1
        || entry
            .coin_type_for_chain
            .contains_key(chain_identifier(&chain.chain_id))
}

/// Coin types still open for selection; empty once the choice is fixed.
pub fn selectable_coin_types(entry: &KeyStoreEntry, chain: &ChainInfo) -> Vec<u32> {
    if is_coin_type_set(entry, chain) {
        return Vec::new();
    }
    chain.candidate_coin_types()
}

pub fn ensure_candidate(chain: &ChainInfo, coin_type: u32) -> eyre::Result<()> {
    if chain.candidate_coin_types().contains(&coin_type) {
        return Ok(());
    }
    Err(KeyringError::UnsupportedCoinType {
        chain_id: chain.chain_id.clone(),
        coin_type,
    }
    .into())
}

/// One derivation option shown when a chain is used for the first time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bip44Selectable {
    pub coin_type: u32,
    pub path: String,
    pub bech32_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::builtin_chains, keystore::Bip44HdPath};
    use eyre::ContextCompat as _;
    use std::collections::BTreeMap;

    fn chain(id: &str) -> eyre::Result<ChainInfo> {
        builtin_chains()
            .into_iter()
            .find(|c| c.chain_id == id)
            .with_context(|| format!("builtin chain {id}"))
    }

    fn entry(kind: KeyStoreKind) -> KeyStoreEntry {
        KeyStoreEntry {
            id: "e".into(),
            kind,
            crypto: None,
            password_check: None,
            meta: BTreeMap::new(),
            bip44_hd_path: Bip44HdPath::default(),
            coin_type_for_chain: BTreeMap::new(),
            ledger_public_keys: BTreeMap::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn identifiers_drop_numeric_revision_only() {
        assert_eq!(chain_identifier("cosmoshub-4"), "cosmoshub");
        assert_eq!(chain_identifier("evmos_9001-2"), "evmos_9001");
        assert_eq!(chain_identifier("eip155:1"), "eip155:1");
        assert_eq!(chain_identifier("my-chain"), "my-chain");
        assert_eq!(chain_identifier("-4"), "-4");
    }

    #[test]
    fn override_wins_and_marks_chain_as_set() -> eyre::Result<()> {
        let secret = chain("secret-4")?;
        let mut e = entry(KeyStoreKind::Mnemonic);
        assert_eq!(compute_coin_type(&e, &secret), 529);
        assert!(!is_coin_type_set(&e, &secret));
        assert_eq!(selectable_coin_types(&e, &secret), vec![529, 118]);

        e.coin_type_for_chain.insert("secret".into(), 118);
        assert_eq!(compute_coin_type(&e, &secret), 118);
        assert!(is_coin_type_set(&e, &secret));
        assert!(selectable_coin_types(&e, &secret).is_empty());
        Ok(())
    }

    #[test]
    fn single_candidate_chains_and_ledgers_are_always_set() -> eyre::Result<()> {
        let hub = chain("cosmoshub-4")?;
        assert!(is_coin_type_set(&entry(KeyStoreKind::PrivateKey), &hub));
        let secret = chain("secret-4")?;
        let ledger = entry(KeyStoreKind::Ledger);
        assert!(is_coin_type_set(&ledger, &secret));
        assert_eq!(compute_coin_type(&ledger, &secret), COSMOS_COIN_TYPE);
        assert_eq!(compute_coin_type(&ledger, &chain("evmos_9001-2")?), ETH_COIN_TYPE);
        Ok(())
    }

    #[test]
    fn non_candidates_are_refused() -> eyre::Result<()> {
        let secret = chain("secret-4")?;
        ensure_candidate(&secret, 118)?;
        let err = ensure_candidate(&secret, 60).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<KeyringError>()),
            Some(KeyringError::UnsupportedCoinType { coin_type: 60, .. })
        ));
        Ok(())
    }
}
