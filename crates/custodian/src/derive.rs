//! BIP39/BIP44 key derivation, address computation and raw secp256k1 signing.

use crate::{
    errors::KeyringError,
    keystore::{Bip44HdPath, KeyStoreKind},
};
use alloy::primitives::{keccak256, Address};
use bip39::{Language, Mnemonic};
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::Network;
use eyre::Context as _;
use k256::ecdsa::{
    signature::hazmat::{PrehashSigner as _, PrehashVerifier as _},
    Signature, SigningKey, VerifyingKey,
};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

/// Coin type of Ethereum-style keys (keccak addresses and digests).
pub const ETH_COIN_TYPE: u32 = 60;
/// Coin type the Cosmos hardware app derives under.
pub const COSMOS_COIN_TYPE: u32 = 118;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgo {
    Secp256k1,
    Ethsecp256k1,
}

impl KeyAlgo {
    pub const fn for_coin_type(coin_type: u32) -> Self {
        if coin_type == ETH_COIN_TYPE {
            Self::Ethsecp256k1
        } else {
            Self::Secp256k1
        }
    }

    /// Digest a message the way signatures for this algorithm commit to it.
    pub fn digest(self, message: &[u8]) -> [u8; 32] {
        match self {
            Self::Secp256k1 => Sha256::digest(message).into(),
            Self::Ethsecp256k1 => keccak256(message).0,
        }
    }
}

/// Public half of a derived account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub algo: KeyAlgo,
    /// Compressed SEC1 public key.
    pub pub_key: Vec<u8>,
    pub address: [u8; 20],
    pub is_nano_ledger: bool,
}

impl Key {
    pub fn from_public_key(
        pub_key: &[u8],
        algo: KeyAlgo,
        is_nano_ledger: bool,
    ) -> eyre::Result<Self> {
        let vk = VerifyingKey::from_sec1_bytes(pub_key)
            .map_err(|e| KeyringError::DerivationFailure(format!("invalid public key: {e}")))?;
        let compressed = vk.to_encoded_point(true);
        let address = match algo {
            KeyAlgo::Secp256k1 => {
                let sha = Sha256::digest(compressed.as_bytes());
                let mut out = [0_u8; 20];
                out.copy_from_slice(&Ripemd160::digest(sha));
                out
            }
            KeyAlgo::Ethsecp256k1 => {
                let uncompressed = vk.to_encoded_point(false);
                let body = uncompressed
                    .as_bytes()
                    .get(1..)
                    .ok_or_else(|| eyre::eyre!("empty uncompressed point"))?;
                keccak256(body)
                    .get(12..)
                    .and_then(|tail| <[u8; 20]>::try_from(tail).ok())
                    .ok_or_else(|| eyre::eyre!("short keccak digest"))?
            }
        };
        Ok(Self {
            algo,
            pub_key: compressed.as_bytes().to_vec(),
            address,
            is_nano_ledger,
        })
    }

    pub fn from_private_key(secret: &[u8; 32], algo: KeyAlgo) -> eyre::Result<Self> {
        let sk = signing_key(secret)?;
        let pk = sk.verifying_key().to_encoded_point(true);
        Self::from_public_key(pk.as_bytes(), algo, false)
    }

    pub fn bech32_address(&self, prefix: &str) -> eyre::Result<String> {
        crate::chains::cosmos::address::encode(prefix, &self.address)
    }

    /// EIP-55 checksummed `0x` address.
    pub fn hex_address(&self) -> String {
        Address::from(self.address).to_checksum(None)
    }
}

/// Decrypted material held only while the keyring is unlocked.
pub enum SessionSecret {
    Seed(Zeroizing<[u8; 64]>),
    PrivateKey(Zeroizing<[u8; 32]>),
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seed(_) => f.write_str("SessionSecret::Seed(..)"),
            Self::PrivateKey(_) => f.write_str("SessionSecret::PrivateKey(..)"),
        }
    }
}

impl SessionSecret {
    /// Interpret decrypted key store bytes according to the entry kind.
    pub fn from_material(kind: KeyStoreKind, material: &[u8]) -> eyre::Result<Self> {
        match kind {
            KeyStoreKind::Mnemonic => {
                let phrase = std::str::from_utf8(material).map_err(|_utf8| {
                    KeyringError::InvalidSecretMaterial("mnemonic must be utf-8".into())
                })?;
                let mnemonic = parse_mnemonic(phrase)?;
                Ok(Self::Seed(Zeroizing::new(mnemonic.to_seed_normalized(""))))
            }
            KeyStoreKind::PrivateKey => {
                let bytes: [u8; 32] = material.try_into().map_err(|_len| {
                    KeyringError::InvalidSecretMaterial("private key must be 32 bytes".into())
                })?;
                signing_key(&bytes).map_err(|_scalar| {
                    KeyringError::InvalidSecretMaterial("private key out of range".into())
                })?;
                Ok(Self::PrivateKey(Zeroizing::new(bytes)))
            }
            KeyStoreKind::Ledger => Err(KeyringError::InvalidSecretMaterial(
                "ledger entries hold no secret".into(),
            )
            .into()),
        }
    }

    /// Private key for `coin_type` at `path`. Raw private keys ignore the path.
    pub fn private_key(
        &self,
        coin_type: u32,
        path: Bip44HdPath,
    ) -> eyre::Result<Zeroizing<[u8; 32]>> {
        match self {
            Self::PrivateKey(sk) => Ok(Zeroizing::new(**sk)),
            Self::Seed(seed) => {
                let secp = Secp256k1::signing_only();
                let master = Xpriv::new_master(Network::Bitcoin, seed.as_slice())
                    .map_err(|e| KeyringError::DerivationFailure(format!("master key: {e}")))?;
                let path: DerivationPath = path
                    .to_path_string(coin_type)
                    .parse()
                    .context("parse bip44 path")?;
                let child = master
                    .derive_priv(&secp, &path)
                    .map_err(|e| KeyringError::DerivationFailure(format!("derive child: {e}")))?;
                Ok(Zeroizing::new(child.private_key.secret_bytes()))
            }
        }
    }
}

pub fn parse_mnemonic(phrase: &str) -> eyre::Result<Mnemonic> {
    Mnemonic::parse_in_normalized(Language::English, phrase.trim())
        .map_err(|e| KeyringError::InvalidSecretMaterial(format!("mnemonic: {e}")).into())
}

pub fn generate_mnemonic(words: usize) -> eyre::Result<Zeroizing<String>> {
    let mnemonic = Mnemonic::generate_in(Language::English, words).context("generate mnemonic")?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Parse a hex private key (with or without `0x`) into validated raw bytes.
pub fn parse_private_key_hex(s: &str) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let t = s.trim();
    let bytes = Zeroizing::new(hex::decode(t.strip_prefix("0x").unwrap_or(t)).map_err(|_hex| {
        KeyringError::InvalidSecretMaterial("private key must be hex".into())
    })?);
    SessionSecret::from_material(KeyStoreKind::PrivateKey, &bytes)?;
    Ok(bytes)
}

fn signing_key(secret: &[u8; 32]) -> eyre::Result<SigningKey> {
    SigningKey::from_slice(secret)
        .map_err(|e| KeyringError::DerivationFailure(format!("invalid private key: {e}")).into())
}

/// 64-byte `r || s` signature (low-S) over an already digested message.
pub fn sign_digest(secret: &[u8; 32], digest: &[u8; 32]) -> eyre::Result<[u8; 64]> {
    let sig: Signature = signing_key(secret)?
        .sign_prehash(digest)
        .map_err(|e| KeyringError::DerivationFailure(format!("sign: {e}")))?;
    let mut out = [0_u8; 64];
    out.copy_from_slice(&sig.to_bytes());
    Ok(out)
}

/// Verify a 64-byte signature over `message` digested per `algo`.
pub fn verify_signature(pub_key: &[u8], algo: KeyAlgo, message: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_sec1_bytes(pub_key) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify_prehash(&algo.digest(message), &sig).is_ok()
}
