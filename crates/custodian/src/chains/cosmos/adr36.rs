//! ADR-36 off-chain message sign documents.

use super::amino::{AminoMsg, StdFee, StdSignDoc};
use crate::errors::KeyringError;
use base64::Engine as _;
use serde_json::json;

pub const MSG_SIGN_DATA: &str = "sign/MsgSignData";

fn invalid(reason: &str) -> eyre::Report {
    KeyringError::InvalidSignDoc(reason.to_owned()).into()
}

/// Exactly one `sign/MsgSignData` message, whatever the other fields hold.
pub fn is_adr36_shaped(doc: &StdSignDoc) -> bool {
    matches!(doc.msgs.as_slice(), [msg] if msg.kind == MSG_SIGN_DATA)
}

/// Classify `doc`: `Ok(true)` for an ADR-36 message, `Ok(false)` for an ordinary transaction.
///
/// A doc carrying exactly one `sign/MsgSignData` message is ADR-36 shaped; once it is, every
/// other field must hold the fixed ADR-36 value or the doc is rejected outright.
pub fn check_and_validate(doc: &StdSignDoc, bech32_prefix: &str) -> eyre::Result<bool> {
    if !is_adr36_shaped(doc) {
        return Ok(false);
    }
    let [msg] = doc.msgs.as_slice() else {
        return Ok(false);
    };

    if !doc.chain_id.is_empty() {
        return Err(invalid("chain id should be empty string for ADR-36 signing"));
    }
    if !doc.memo.is_empty() {
        return Err(invalid("memo should be empty string for ADR-36 signing"));
    }
    if doc.account_number != "0" {
        return Err(invalid("account number should be \"0\" for ADR-36 signing"));
    }
    if doc.sequence != "0" {
        return Err(invalid("sequence should be \"0\" for ADR-36 signing"));
    }
    if doc.fee.gas != "0" {
        return Err(invalid("gas should be \"0\" for ADR-36 signing"));
    }
    if !doc.fee.amount.is_empty() {
        return Err(invalid("fee amount should be empty for ADR-36 signing"));
    }

    let Some(value) = msg.value.as_object() else {
        return Err(invalid("empty value in the msg"));
    };
    let signer = value
        .get("signer")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| invalid("signer is missing"))?;
    super::address::validate(signer, bech32_prefix)
        .map_err(|e| KeyringError::InvalidSignDoc(format!("invalid signer: {e}")))?;

    let data = value
        .get("data")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    if data.is_empty() {
        return Err(invalid("empty data in the msg"));
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    let canonical = b64
        .decode(data)
        .map(|raw| b64.encode(raw) == data)
        .unwrap_or(false);
    if !canonical {
        return Err(invalid("data is not encoded by base64"));
    }

    Ok(true)
}

/// The `signer` embedded in the single message of an ADR-36 doc.
pub fn embedded_signer(doc: &StdSignDoc) -> Option<&str> {
    doc.msgs
        .first()
        .and_then(|m| m.value.get("signer"))
        .and_then(serde_json::Value::as_str)
}

pub fn make_sign_doc(signer: &str, data: &[u8]) -> StdSignDoc {
    StdSignDoc {
        chain_id: String::new(),
        account_number: "0".into(),
        sequence: "0".into(),
        timeout_height: None,
        fee: StdFee {
            gas: "0".into(),
            ..StdFee::default()
        },
        msgs: vec![AminoMsg {
            kind: MSG_SIGN_DATA.into(),
            value: json!({
                "signer": signer,
                "data": base64::engine::general_purpose::STANDARD.encode(data),
            }),
        }],
        memo: String::new(),
    }
}
