//! Multi-chain wallet custody core.
//!
//! [`keyring::KeyRing`] owns the encrypted key stores and the lock state machine;
//! [`service::KeyRingService`] is the approval-gated signing protocol in front of it.

#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

pub mod chains;
pub mod coin_type;
pub mod collab;
pub mod config;
pub mod derive;
pub mod errors;
pub mod fsutil;
pub mod keyring;
pub mod keystore;
pub mod kv;
pub mod paths;
pub mod retry;
pub mod rpc;
pub mod service;
pub mod store;
