//! Legacy Amino JSON sign documents and their canonical byte encoding.

use crate::derive::KeyAlgo;
use base64::Engine as _;
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdFee {
    #[serde(default)]
    pub amount: Vec<Coin>,
    pub gas: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AminoMsg {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdSignDoc {
    pub chain_id: String,
    pub account_number: String,
    pub sequence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_height: Option<String>,
    pub fee: StdFee,
    pub msgs: Vec<AminoMsg>,
    #[serde(default)]
    pub memo: String,
}

fn sorted(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sorted).collect()),
        other => other,
    }
}

/// Canonical Amino JSON: keys sorted at every depth, no whitespace, `&`, `<`, `>` escaped.
pub fn serialize_sign_doc(doc: &StdSignDoc) -> eyre::Result<Vec<u8>> {
    let v = serde_json::to_value(doc).context("serialize sign doc")?;
    let s = serde_json::to_string(&sorted(v)).context("encode sign doc")?;
    Ok(s.replace('&', "\\u0026")
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .into_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdSignature {
    pub pub_key: PubKey,
    pub signature: String,
}

pub const SECP256K1_PUB_KEY_TYPE: &str = "tendermint/PubKeySecp256k1";
pub const ETH_SECP256K1_PUB_KEY_TYPE: &str = "ethermint/PubKeyEthSecp256k1";

pub const fn pub_key_type(algo: KeyAlgo) -> &'static str {
    match algo {
        KeyAlgo::Secp256k1 => SECP256K1_PUB_KEY_TYPE,
        KeyAlgo::Ethsecp256k1 => ETH_SECP256K1_PUB_KEY_TYPE,
    }
}

pub fn encode_signature(pub_key: &[u8], algo: KeyAlgo, signature: &[u8]) -> StdSignature {
    let b64 = base64::engine::general_purpose::STANDARD;
    StdSignature {
        pub_key: PubKey {
            kind: pub_key_type(algo).to_owned(),
            value: b64.encode(pub_key),
        },
        signature: b64.encode(signature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send_doc(memo: &str) -> eyre::Result<StdSignDoc> {
        Ok(serde_json::from_value(json!({
            "chain_id": "cosmoshub-4",
            "account_number": "7",
            "sequence": "3",
            "fee": { "gas": "200000", "amount": [{ "denom": "uatom", "amount": "500" }] },
            "msgs": [{
                "type": "cosmos-sdk/MsgSend",
                "value": {
                    "to_address": "cosmos1b",
                    "from_address": "cosmos1a",
                    "amount": [{ "denom": "uatom", "amount": "1" }]
                }
            }],
            "memo": memo
        }))?)
    }

    #[test]
    fn keys_are_sorted_at_every_depth() -> eyre::Result<()> {
        let bytes = serialize_sign_doc(&send_doc("")?)?;
        let s = String::from_utf8(bytes)?;
        assert_eq!(
            s,
            concat!(
                r#"{"account_number":"7","chain_id":"cosmoshub-4","#,
                r#""fee":{"amount":[{"amount":"500","denom":"uatom"}],"gas":"200000"},"#,
                r#""memo":"","msgs":[{"type":"cosmos-sdk/MsgSend","value":{"#,
                r#""amount":[{"amount":"1","denom":"uatom"}],"#,
                r#""from_address":"cosmos1a","to_address":"cosmos1b"}}],"sequence":"3"}"#,
            )
        );
        Ok(())
    }

    #[test]
    fn html_sensitive_characters_are_escaped() -> eyre::Result<()> {
        let s = String::from_utf8(serialize_sign_doc(&send_doc("<a & b>")?)?)?;
        assert!(s.contains(r#""memo":"\u003ca \u0026 b\u003e""#), "{s}");
        assert!(!s.contains('<'), "{s}");
        Ok(())
    }

    #[test]
    fn signature_encoding_names_key_type() {
        let sig = encode_signature(&[2_u8; 33], KeyAlgo::Ethsecp256k1, &[0_u8; 64]);
        assert_eq!(sig.pub_key.kind, ETH_SECP256K1_PUB_KEY_TYPE);
        let sig = encode_signature(&[2_u8; 33], KeyAlgo::Secp256k1, &[0_u8; 64]);
        assert_eq!(sig.pub_key.kind, SECP256K1_PUB_KEY_TYPE);
    }
}
