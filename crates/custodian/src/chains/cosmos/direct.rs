//! Protobuf `SignDoc` used by direct (`SIGN_MODE_DIRECT`) signing.

use crate::errors::KeyringError;
use prost::Message as _;

/// `cosmos.tx.v1beta1.SignDoc`.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct SignDoc {
    #[prost(bytes = "vec", tag = "1")]
    pub body_bytes: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub auth_info_bytes: Vec<u8>,
    #[prost(string, tag = "3")]
    pub chain_id: String,
    #[prost(uint64, tag = "4")]
    pub account_number: u64,
}

impl SignDoc {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> eyre::Result<Self> {
        Self::decode(bytes)
            .map_err(|e| KeyringError::InvalidSignDoc(format!("decode sign doc: {e}")).into())
    }
}
