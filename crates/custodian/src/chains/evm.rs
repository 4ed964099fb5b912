use crate::errors::KeyringError;
use alloy::{
    consensus::{SignableTransaction as _, TxEnvelope, TxLegacy},
    dyn_abi::TypedData,
    eips::eip2718::Encodable2718 as _,
    primitives::{Address, Bytes, Signature, TxKind, B256, U256},
};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::str::FromStr as _;

/// Transaction fields as a dapp submits them: JSON-RPC style hex quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumTxDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl EthereumTxDraft {
    /// Call object for `eth_estimateGas`.
    pub fn estimate_call(&self, from: &str) -> serde_json::Value {
        let mut call = serde_json::json!({ "from": from });
        for (k, v) in [
            ("to", &self.to),
            ("value", &self.value),
            ("data", &self.data),
        ] {
            if let Some(v) = v {
                call[k] = serde_json::Value::String(v.clone());
            }
        }
        call
    }
}

/// Parse a `0x` hex or decimal quantity.
pub fn parse_quantity(s: &str) -> eyre::Result<U256> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some("") => Ok(U256::ZERO),
        Some(h) => U256::from_str_radix(h, 16),
        None => U256::from_str_radix(t, 10),
    };
    parsed.map_err(|e| KeyringError::InvalidOption(format!("invalid quantity {t:?}: {e}")).into())
}

pub fn parse_quantity_u64(s: &str) -> eyre::Result<u64> {
    u64::try_from(parse_quantity(s)?)
        .map_err(|_overflow| {
            KeyringError::InvalidOption(format!("quantity {s:?} exceeds u64")).into()
        })
}

pub fn parse_quantity_u128(s: &str) -> eyre::Result<u128> {
    u128::try_from(parse_quantity(s)?)
        .map_err(|_overflow| {
            KeyringError::InvalidOption(format!("quantity {s:?} exceeds u128")).into()
        })
}

pub fn to_quantity(v: U256) -> String {
    format!("0x{v:x}")
}

/// Accepts `0x` hex or a bech32 account address of any prefix.
pub fn parse_address_bytes(s: &str) -> eyre::Result<[u8; 20]> {
    if s.starts_with("0x") || s.starts_with("0X") {
        let a = Address::from_str(s).with_context(|| format!("invalid address {s}"))?;
        return Ok(a.into_array());
    }
    let (_hrp, data) = crate::chains::cosmos::address::decode(s)?;
    <[u8; 20]>::try_from(data.as_slice()).map_err(|_len| eyre::eyre!("invalid address length"))
}

pub struct LegacyFields {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
}

pub fn build_legacy_tx(draft: &EthereumTxDraft, fields: &LegacyFields) -> eyre::Result<TxLegacy> {
    let to = match draft.to.as_deref().map(str::trim) {
        None | Some("") => TxKind::Create,
        Some(s) => TxKind::Call(
            Address::from_str(s).map_err(|e| {
                KeyringError::InvalidOption(format!("invalid to address: {e}"))
            })?,
        ),
    };
    let value = draft
        .value
        .as_deref()
        .map(parse_quantity)
        .transpose()?
        .unwrap_or(U256::ZERO);
    let input = match draft.data.as_deref().map(str::trim) {
        None | Some("" | "0x") => Bytes::new(),
        Some(s) => Bytes::from_str(s)
            .map_err(|e| KeyringError::InvalidOption(format!("invalid data: {e}")))?,
    };
    Ok(TxLegacy {
        chain_id: Some(fields.chain_id),
        nonce: fields.nonce,
        gas_price: fields.gas_price,
        gas_limit: fields.gas_limit,
        to,
        value,
        input,
    })
}

/// Attach `sig` and return the EIP-2718 encoding plus the transaction hash.
pub fn finalize_legacy(tx: TxLegacy, sig: Signature) -> (Vec<u8>, B256) {
    let signed = tx.into_signed(sig);
    let tx_hash = *signed.hash();
    let envelope = TxEnvelope::Legacy(signed);
    (envelope.encoded_2718(), tx_hash)
}

pub fn broadcast_err_is_ok(err: &eyre::Report) -> bool {
    let s = format!("{err:#}").to_lowercase();
    s.contains("already known")
        || s.contains("known transaction")
        || s.contains("already imported")
        || s.contains("already in mempool")
}

/// Rejections every node would repeat; retrying other endpoints cannot help.
pub fn broadcast_err_is_final(err: &eyre::Report) -> bool {
    let s = format!("{err:#}").to_lowercase();
    s.contains("nonce too low") || s.contains("insufficient funds")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedDataVersion {
    V1,
    V3,
    V4,
}

/// EIP-712 signing hash of a typed-data payload.
pub fn typed_data_hash(
    typed_data: &serde_json::Value,
    version: TypedDataVersion,
) -> eyre::Result<B256> {
    if version == TypedDataVersion::V1 {
        return Err(KeyringError::InvalidOption("typed data V1 is not supported".into()).into());
    }
    let typed: TypedData = serde_json::from_value(typed_data.clone())
        .map_err(|e| KeyringError::InvalidOption(format!("invalid typed data: {e}")))?;
    typed
        .eip712_signing_hash()
        .map_err(|e| KeyringError::InvalidOption(format!("typed data hash: {e}")).into())
}

/// Recoverable signature in the `{ v, r, s }` shape wallets hand back to dapps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableSignature {
    pub v: u64,
    pub r: String,
    pub s: String,
    /// 65-byte `r || s || v` hex.
    pub signature: String,
}

impl From<&Signature> for RecoverableSignature {
    fn from(sig: &Signature) -> Self {
        let v = u64::from(sig.v()) + 27;
        let r = B256::from(sig.r());
        let s = B256::from(sig.s());
        let mut raw = Vec::with_capacity(65);
        raw.extend_from_slice(r.as_slice());
        raw.extend_from_slice(s.as_slice());
        raw.push(u8::from(sig.v()) + 27);
        Self {
            v,
            r: r.to_string(),
            s: s.to_string(),
            signature: format!("0x{}", hex::encode(raw)),
        }
    }
}

/// Build an alloy signature from a 65-byte `r || s || v` device response.
pub fn signature_from_rsv(raw: &[u8]) -> eyre::Result<Signature> {
    let (Some(r), Some(s), Some(&v)) = (raw.get(..32), raw.get(32..64), raw.get(64)) else {
        return Err(KeyringError::DerivationFailure("signature must be 65 bytes".into()).into());
    };
    let parity = match v {
        0 | 27 => false,
        1 | 28 => true,
        other => {
            return Err(
                KeyringError::DerivationFailure(format!("invalid recovery id {other}")).into(),
            )
        }
    };
    Ok(Signature::new(
        U256::from_be_slice(r),
        U256::from_be_slice(s),
        parity,
    ))
}
