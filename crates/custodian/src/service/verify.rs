use super::KeyRingService;
use crate::{
    chains::cosmos::{
        adr36,
        amino::{self, StdSignature, ETH_SECP256K1_PUB_KEY_TYPE, SECP256K1_PUB_KEY_TYPE},
    },
    derive,
    errors::KeyringError,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Why an ADR-36 signature was or was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Adr36Verification {
    Valid,
    SignerMismatch,
    PubKeyTypeMismatch,
    PubKeyMismatch,
    InvalidSignature,
}

pub(super) async fn verify_adr36(
    svc: &KeyRingService,
    chain_id: &str,
    signer: &str,
    data: &[u8],
    signature: &StdSignature,
) -> eyre::Result<Adr36Verification> {
    let r = svc.resolve(chain_id).await?;
    if r.chain.uses_hex_addresses() {
        return Err(
            KeyringError::InvalidOption(format!("{chain_id} has no bech32 accounts")).into(),
        );
    }

    if r.key.bech32_address(&r.chain.bech32_prefix)? != signer {
        return Ok(Adr36Verification::SignerMismatch);
    }

    let kind = signature.pub_key.kind.as_str();
    if kind != SECP256K1_PUB_KEY_TYPE && kind != ETH_SECP256K1_PUB_KEY_TYPE {
        return Err(KeyringError::UnsupportedPubKeyType(kind.to_owned()).into());
    }
    if kind != amino::pub_key_type(r.key.algo) {
        return Ok(Adr36Verification::PubKeyTypeMismatch);
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    match b64.decode(&signature.pub_key.value) {
        Ok(pk) if pk == r.key.pub_key => {}
        Ok(_) | Err(_) => return Ok(Adr36Verification::PubKeyMismatch),
    }
    let Ok(sig) = b64.decode(&signature.signature) else {
        return Ok(Adr36Verification::InvalidSignature);
    };

    let doc = adr36::make_sign_doc(signer, data);
    let bytes = amino::serialize_sign_doc(&doc)?;
    if derive::verify_signature(&r.key.pub_key, r.key.algo, &bytes, &sig) {
        Ok(Adr36Verification::Valid)
    } else {
        Ok(Adr36Verification::InvalidSignature)
    }
}
