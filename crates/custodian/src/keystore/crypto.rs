use crate::errors::KeyringError;
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use eyre::Context as _;
use hkdf::Hkdf;
use k256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

const SCRYPT_LOG_N: u8 = 17;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const PBKDF2_ROUNDS: u32 = 4000;
// These match `argon2::Params::DEFAULT` in argon2 0.5.x.
const ARGON2_M_COST_KIB: u32 = 19 * 1024;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

const PASSWORD_CHECK_TAG: &[u8] = b"custodian:password-check:v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgorithm {
    #[default]
    Scrypt,
    Sha256,
    Pbkdf2,
    Argon2id,
}

/// KDF algorithm plus the salt and cost parameters it was run with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum KdfParams {
    Scrypt {
        salt_b64: String,
        log_n: u8,
        r: u32,
        p: u32,
    },
    Sha256 {
        salt_b64: String,
    },
    Pbkdf2 {
        salt_b64: String,
        rounds: u32,
    },
    Argon2id {
        salt_b64: String,
        m_cost_kib: u32,
        t_cost: u32,
        p_cost: u32,
    },
}

impl KdfParams {
    /// Fresh parameters with a random 32-byte salt.
    pub fn generate(algorithm: KdfAlgorithm) -> Self {
        let mut salt = [0_u8; 32];
        fill_random(&mut salt);
        let salt_b64 = B64.encode(salt);
        match algorithm {
            KdfAlgorithm::Scrypt => Self::Scrypt {
                salt_b64,
                log_n: SCRYPT_LOG_N,
                r: SCRYPT_R,
                p: SCRYPT_P,
            },
            KdfAlgorithm::Sha256 => Self::Sha256 { salt_b64 },
            KdfAlgorithm::Pbkdf2 => Self::Pbkdf2 {
                salt_b64,
                rounds: PBKDF2_ROUNDS,
            },
            KdfAlgorithm::Argon2id => Self::Argon2id {
                salt_b64,
                m_cost_kib: ARGON2_M_COST_KIB,
                t_cost: ARGON2_T_COST,
                p_cost: ARGON2_P_COST,
            },
        }
    }

    pub const fn algorithm(&self) -> KdfAlgorithm {
        match self {
            Self::Scrypt { .. } => KdfAlgorithm::Scrypt,
            Self::Sha256 { .. } => KdfAlgorithm::Sha256,
            Self::Pbkdf2 { .. } => KdfAlgorithm::Pbkdf2,
            Self::Argon2id { .. } => KdfAlgorithm::Argon2id,
        }
    }

    fn salt(&self) -> eyre::Result<Vec<u8>> {
        let (Self::Scrypt { salt_b64, .. }
        | Self::Sha256 { salt_b64 }
        | Self::Pbkdf2 { salt_b64, .. }
        | Self::Argon2id { salt_b64, .. }) = self;
        B64.decode(salt_b64).context("decode kdf salt")
    }

    /// Stretch `password` into a 32-byte key.
    pub fn derive_key(&self, password: &SecretString) -> eyre::Result<Zeroizing<[u8; 32]>> {
        let pw = password.expose_secret().as_bytes();
        let salt = self.salt()?;
        let mut out = Zeroizing::new([0_u8; 32]);
        match self {
            Self::Scrypt { log_n, r, p, .. } => {
                let params = scrypt::Params::new(*log_n, *r, *p, 32)
                    .map_err(|e| eyre::eyre!("scrypt params: {e}"))?;
                scrypt::scrypt(pw, &salt, &params, out.as_mut_slice())
                    .map_err(|e| eyre::eyre!("scrypt: {e}"))?;
            }
            Self::Sha256 { .. } => {
                let mut h = Sha256::new();
                h.update(&salt);
                h.update(pw);
                out.copy_from_slice(&h.finalize());
            }
            Self::Pbkdf2 { rounds, .. } => {
                pbkdf2::pbkdf2_hmac::<Sha256>(pw, &salt, *rounds, out.as_mut_slice());
            }
            Self::Argon2id {
                m_cost_kib,
                t_cost,
                p_cost,
                ..
            } => {
                let params = Params::new(*m_cost_kib, *t_cost, *p_cost, Some(32))
                    .map_err(|e| eyre::eyre!("argon2 params: {e}"))?;
                Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                    .hash_password_into(pw, &salt, out.as_mut_slice())
                    .map_err(|e| eyre::eyre!("argon2 hash: {e}"))?;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

/// Ciphertext of a key store secret together with the KDF that protects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub kdf: KdfParams,
    pub cipher: CryptoBox,
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

fn derive_subkey(master: &[u8; 32], entry_id: &str, purpose: &str) -> eyre::Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let info = format!("custodian:{entry_id}:{purpose}");
    let mut out = [0_u8; 32];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}

pub fn encrypt_aes_gcm(key32: &[u8; 32], plaintext: &[u8]) -> eyre::Result<CryptoBox> {
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let mut nonce = [0_u8; 12];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

    Ok(CryptoBox {
        v: 1,
        nonce_b64: B64.encode(nonce),
        ct_b64: B64.encode(ct),
    })
}

/// `Ok(None)` means the ciphertext did not authenticate under `key32`.
pub fn decrypt_aes_gcm(
    key32: &[u8; 32],
    b: &CryptoBox,
) -> eyre::Result<Option<Zeroizing<Vec<u8>>>> {
    if b.v != 1 {
        eyre::bail!("unsupported CryptoBox version: {}", b.v);
    }
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let nonce = B64.decode(&b.nonce_b64).context("decode nonce")?;
    if nonce.len() != 12 {
        eyre::bail!("invalid nonce length");
    }
    let ct = B64.decode(&b.ct_b64).context("decode ciphertext")?;
    Ok(cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
        .ok()
        .map(Zeroizing::new))
}

/// Encrypt `plaintext` under `password` with fresh KDF parameters.
pub fn seal_secret(
    entry_id: &str,
    algorithm: KdfAlgorithm,
    password: &SecretString,
    plaintext: &[u8],
) -> eyre::Result<EncryptedSecret> {
    let kdf = KdfParams::generate(algorithm);
    let base = kdf.derive_key(password)?;
    let key = Zeroizing::new(derive_subkey(&base, entry_id, "secret")?);
    let cipher = encrypt_aes_gcm(&key, plaintext)?;
    Ok(EncryptedSecret { kdf, cipher })
}

/// Decrypt a sealed secret; a failed authentication is reported as [`KeyringError::WrongPassword`].
pub fn open_secret(
    entry_id: &str,
    sealed: &EncryptedSecret,
    password: &SecretString,
) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let base = sealed.kdf.derive_key(password)?;
    let key = Zeroizing::new(derive_subkey(&base, entry_id, "secret")?);
    decrypt_aes_gcm(&key, &sealed.cipher)?.ok_or_else(|| KeyringError::WrongPassword.into())
}

/// Password verifier for entries that hold no secret of their own.
pub fn seal_password_check(
    entry_id: &str,
    algorithm: KdfAlgorithm,
    password: &SecretString,
) -> eyre::Result<EncryptedSecret> {
    seal_secret(entry_id, algorithm, password, PASSWORD_CHECK_TAG)
}

pub fn verify_password_check(
    entry_id: &str,
    check: &EncryptedSecret,
    password: &SecretString,
) -> eyre::Result<()> {
    let pt = open_secret(entry_id, check, password)?;
    if pt.as_slice() != PASSWORD_CHECK_TAG {
        return Err(KeyringError::WrongPassword.into());
    }
    Ok(())
}

/// A payload encrypted to a secp256k1 public key (ECDH, HKDF-SHA256, AES-256-GCM).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EciesEnvelope {
    pub ephemeral_pub_key_b64: String,
    pub nonce_b64: String,
    pub ct_b64: String,
}

fn ecies_key(shared: &k256::ecdh::SharedSecret, ephemeral_pub: &[u8]) -> eyre::Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(ephemeral_pub), shared.raw_secret_bytes().as_slice());
    let mut out = [0_u8; 32];
    hk.expand(b"custodian:ecies:v1", &mut out)
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}

pub fn ecies_encrypt(recipient_pub_key: &[u8], plaintext: &[u8]) -> eyre::Result<EciesEnvelope> {
    let recipient = k256::PublicKey::from_sec1_bytes(recipient_pub_key)
        .map_err(|e| eyre::eyre!("invalid recipient public key: {e}"))?;
    let mut seed = Zeroizing::new([0_u8; 32]);
    fill_random(seed.as_mut_slice());
    let ephemeral = k256::SecretKey::from_slice(seed.as_slice())
        .map_err(|e| eyre::eyre!("ephemeral key: {e}"))?;
    let ephemeral_pub = ephemeral.public_key().to_encoded_point(true);
    let shared = k256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let key = Zeroizing::new(ecies_key(&shared, ephemeral_pub.as_bytes())?);
    let sealed = encrypt_aes_gcm(&key, plaintext)?;
    Ok(EciesEnvelope {
        ephemeral_pub_key_b64: B64.encode(ephemeral_pub.as_bytes()),
        nonce_b64: sealed.nonce_b64,
        ct_b64: sealed.ct_b64,
    })
}

pub fn ecies_decrypt(
    secret: &[u8; 32],
    envelope: &EciesEnvelope,
) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let sk = k256::SecretKey::from_slice(secret).map_err(|e| eyre::eyre!("secret key: {e}"))?;
    let ephemeral_pub = B64
        .decode(&envelope.ephemeral_pub_key_b64)
        .context("decode ephemeral public key")?;
    let ephemeral = k256::PublicKey::from_sec1_bytes(&ephemeral_pub)
        .map_err(|e| eyre::eyre!("invalid ephemeral public key: {e}"))?;
    let shared = k256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), ephemeral.as_affine());
    let key = Zeroizing::new(ecies_key(&shared, &ephemeral_pub)?);
    let sealed = CryptoBox {
        v: 1,
        nonce_b64: envelope.nonce_b64.clone(),
        ct_b64: envelope.ct_b64.clone(),
    };
    decrypt_aes_gcm(&key, &sealed)?
        .ok_or_else(|| eyre::eyre!("envelope is not addressed to this key"))
}
