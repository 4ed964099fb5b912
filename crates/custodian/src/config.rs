use crate::keystore::crypto::KdfAlgorithm;
use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Gas limit offered to the approval step when `eth_estimateGas` fails.
pub const DEFAULT_FALLBACK_GAS_LIMIT: u64 = 0x5028;

/// Chain metadata the keyring needs: address encoding, derivation defaults and RPC endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub chain_id: String,
    pub chain_name: String,
    /// Bech32 account prefix. Empty for chains whose native encoding is `0x` hex.
    #[serde(default)]
    pub bech32_prefix: String,
    pub coin_type: u32,
    /// Extra BIP44 coin types a user may pick the first time they use the chain.
    #[serde(default)]
    pub alternative_coin_types: Vec<u32>,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub fallback_rpc_urls: Vec<String>,
    /// EIP-155 chain id, for chains that accept Ethereum transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evm_chain_id: Option<u64>,
    pub fee_currency_decimals: u8,
}

impl ChainInfo {
    /// Default coin type first, then alternatives, without duplicates.
    pub fn candidate_coin_types(&self) -> Vec<u32> {
        let mut out = vec![self.coin_type];
        for ct in &self.alternative_coin_types {
            if !out.contains(ct) {
                out.push(*ct);
            }
        }
        out
    }

    pub fn uses_hex_addresses(&self) -> bool {
        self.bech32_prefix.is_empty()
    }

    /// Primary RPC URL followed by fallbacks, trimmed and de-duplicated.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(1 + self.fallback_rpc_urls.len());
        for u in std::iter::once(&self.rpc_url).chain(&self.fallback_rpc_urls) {
            let t = u.trim();
            if t.is_empty() || urls.iter().any(|x| x == t) {
                continue;
            }
            urls.push(t.to_owned());
        }
        urls
    }
}

struct ChainDef {
    chain_id: &'static str,
    chain_name: &'static str,
    bech32_prefix: &'static str,
    coin_type: u32,
    alternatives: &'static [u32],
    rpc_url: &'static str,
    fallbacks: &'static [&'static str],
    evm_chain_id: Option<u64>,
    decimals: u8,
}

const BUILTIN_CHAINS: &[ChainDef] = &[
    ChainDef {
        chain_id: "cosmoshub-4",
        chain_name: "Cosmos Hub",
        bech32_prefix: "cosmos",
        coin_type: 118,
        alternatives: &[],
        rpc_url: "https://cosmos-rpc.publicnode.com",
        fallbacks: &[],
        evm_chain_id: None,
        decimals: 6,
    },
    ChainDef {
        chain_id: "osmosis-1",
        chain_name: "Osmosis",
        bech32_prefix: "osmo",
        coin_type: 118,
        alternatives: &[],
        rpc_url: "https://osmosis-rpc.publicnode.com",
        fallbacks: &[],
        evm_chain_id: None,
        decimals: 6,
    },
    ChainDef {
        chain_id: "secret-4",
        chain_name: "Secret Network",
        bech32_prefix: "secret",
        coin_type: 529,
        alternatives: &[118],
        rpc_url: "https://secret-rpc.publicnode.com",
        fallbacks: &[],
        evm_chain_id: None,
        decimals: 6,
    },
    ChainDef {
        chain_id: "evmos_9001-2",
        chain_name: "Evmos",
        bech32_prefix: "evmos",
        coin_type: 60,
        alternatives: &[],
        rpc_url: "https://evmos-evm-rpc.publicnode.com",
        fallbacks: &["https://evmos.lava.build"],
        evm_chain_id: Some(9001),
        decimals: 18,
    },
    ChainDef {
        chain_id: "eip155:1",
        chain_name: "Ethereum",
        bech32_prefix: "",
        coin_type: 60,
        alternatives: &[],
        rpc_url: "https://eth.llamarpc.com",
        fallbacks: &[
            "https://ethereum-rpc.publicnode.com",
            "https://rpc.ankr.com/eth",
        ],
        evm_chain_id: Some(1),
        decimals: 18,
    },
];

pub fn builtin_chains() -> Vec<ChainInfo> {
    BUILTIN_CHAINS
        .iter()
        .map(|def| ChainInfo {
            chain_id: def.chain_id.into(),
            chain_name: def.chain_name.into(),
            bech32_prefix: def.bech32_prefix.into(),
            coin_type: def.coin_type,
            alternative_coin_types: def.alternatives.to_vec(),
            rpc_url: def.rpc_url.into(),
            fallback_rpc_urls: def.fallbacks.iter().map(|&s| s.into()).collect(),
            evm_chain_id: def.evm_chain_id,
            fee_currency_decimals: def.decimals,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub fallback_gas_limit: u64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fallback_gas_limit: DEFAULT_FALLBACK_GAS_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// Full passes over every endpoint before giving up.
    pub backoff_rounds: usize,
    pub backoff_base_delay_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 20,
            connect_timeout_seconds: 5,
            backoff_rounds: 3,
            backoff_base_delay_ms: 400,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            rounds: self.backoff_rounds,
            base_delay: Duration::from_millis(self.backoff_base_delay_ms),
            ..BackoffConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodianConfig {
    /// KDF used when new key stores are created.
    pub kdf: KdfAlgorithm,
    pub fee: FeeConfig,
    pub rpc: RpcConfig,
    pub chains: Vec<ChainInfo>,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            kdf: KdfAlgorithm::Scrypt,
            fee: FeeConfig::default(),
            rpc: RpcConfig::default(),
            chains: builtin_chains(),
        }
    }
}
