//! Bech32 account addresses.

use bech32::{Bech32, Hrp};

pub fn encode(prefix: &str, bytes: &[u8]) -> eyre::Result<String> {
    let hrp = Hrp::parse(prefix).map_err(|e| eyre::eyre!("invalid bech32 prefix {prefix:?}: {e}"))?;
    bech32::encode::<Bech32>(hrp, bytes).map_err(|e| eyre::eyre!("bech32 encode: {e}"))
}

/// Returns the human readable part and the payload.
pub fn decode(s: &str) -> eyre::Result<(String, Vec<u8>)> {
    let (hrp, data) = bech32::decode(s).map_err(|e| eyre::eyre!("invalid bech32 address: {e}"))?;
    Ok((hrp.to_string(), data))
}

/// A 20-byte account address carrying exactly `prefix`.
pub fn validate(s: &str, prefix: &str) -> eyre::Result<[u8; 20]> {
    let (hrp, data) = decode(s)?;
    if hrp != prefix {
        eyre::bail!("unexpected bech32 prefix: expected {prefix}, got {hrp}");
    }
    <[u8; 20]>::try_from(data.as_slice())
        .map_err(|_len| eyre::eyre!("invalid address length: {}", data.len()))
}
