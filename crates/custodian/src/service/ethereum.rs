use super::{ensure_signer, guard::InFlightRequest, KeyRingService, Resolved};
use crate::{
    chains::evm::{self, EthereumTxDraft, LegacyFields, RecoverableSignature, TypedDataVersion},
    collab::{
        ApprovalRequest, ApprovalResponse, Env, EthereumApproval, FeeHints,
        EVENT_REQUEST_SIGN_ETHEREUM_END, KIND_REQUEST_SIGN_ETHEREUM, ROUTE_SIGN_ETHEREUM,
    },
    config::ChainInfo,
    derive::KeyAlgo,
    errors::KeyringError,
    retry::try_all_with_backoff,
};
use alloy::{consensus::SignableTransaction as _, primitives::U256};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthereumSignRequest {
    pub chain_id: String,
    pub signer: String,
    pub draft: EthereumTxDraft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthereumBroadcast {
    pub tx_hash: String,
    /// EIP-2718 encoded signed transaction, `0x` hex.
    pub raw_tx: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedDataSignRequest {
    pub chain_id: String,
    /// Checked against the key when present.
    #[serde(default)]
    pub signer: Option<String>,
    pub typed_data: Value,
    pub version: TypedDataVersion,
}

fn ensure_ethereum_key(r: &Resolved) -> eyre::Result<()> {
    if r.key.algo == KeyAlgo::Ethsecp256k1 {
        return Ok(());
    }
    Err(KeyringError::InvalidOption(format!(
        "{} does not derive Ethereum keys (coin type {})",
        r.chain.chain_id, r.coin_type
    ))
    .into())
}

/// One JSON-RPC call, tried across every endpoint of `chain` with backoff.
pub(super) async fn rpc_call(
    svc: &KeyRingService,
    chain: &ChainInfo,
    method: &'static str,
    params: Value,
) -> eyre::Result<Value> {
    let urls = chain.all_rpc_urls();
    try_all_with_backoff(
        &urls,
        &svc.backoff,
        |url| {
            let url = url.clone();
            let params = params.clone();
            let rpc = Arc::clone(&svc.rpc);
            async move { rpc.request(&url, method, params).await }
        },
        |_e| false,
        method,
    )
    .await
}

/// Gas defaults for the approval screen. Never fails: a missing gas price stays unset and
/// a failed estimate falls back to the configured limit.
pub(super) async fn fee_hints(
    svc: &KeyRingService,
    chain: &ChainInfo,
    draft: &EthereumTxDraft,
    from: &str,
) -> FeeHints {
    let estimated_gas_price = match rpc_call(svc, chain, "eth_gasPrice", json!([])).await {
        Ok(Value::String(p)) => Some(p),
        Ok(other) => {
            tracing::warn!(
                chain_id = %chain.chain_id,
                value = %other,
                "unexpected eth_gasPrice result"
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                chain_id = %chain.chain_id,
                error = %format!("{e:#}"),
                "eth_gasPrice failed"
            );
            None
        }
    };

    let estimated = rpc_call(svc, chain, "eth_estimateGas", json!([draft.estimate_call(from)]))
        .await
        .and_then(|v| {
            v.as_str()
                .ok_or_else(|| eyre::eyre!("eth_estimateGas returned {v}"))
                .and_then(evm::parse_quantity_u64)
        });
    let gas_limit = match estimated {
        Ok(g) => g,
        Err(e) => {
            tracing::warn!(
                chain_id = %chain.chain_id,
                error = %format!("{e:#}"),
                fallback = svc.fee.fallback_gas_limit,
                "gas estimation failed, using fallback limit"
            );
            svc.fee.fallback_gas_limit
        }
    };

    FeeHints {
        estimated_gas_price,
        estimated_gas_limit: evm::to_quantity(U256::from(gas_limit)),
        fee_currency_decimals: chain.fee_currency_decimals,
    }
}

async fn pending_nonce(svc: &KeyRingService, chain: &ChainInfo, from: &str) -> eyre::Result<u64> {
    let v = rpc_call(svc, chain, "eth_getTransactionCount", json!([from, "pending"])).await?;
    let s = v
        .as_str()
        .ok_or_else(|| KeyringError::Transport(format!("eth_getTransactionCount returned {v}")))?;
    evm::parse_quantity_u64(s)
}

async fn broadcast(
    svc: &KeyRingService,
    chain: &ChainInfo,
    raw_hex: String,
    tx_hash: String,
) -> eyre::Result<String> {
    let urls = chain.all_rpc_urls();
    try_all_with_backoff(
        &urls,
        &svc.backoff,
        |url| {
            let url = url.clone();
            let raw_hex = raw_hex.clone();
            let tx_hash = tx_hash.clone();
            let rpc = Arc::clone(&svc.rpc);
            async move {
                match rpc
                    .request(&url, "eth_sendRawTransaction", json!([raw_hex]))
                    .await
                {
                    Ok(_) => Ok(tx_hash),
                    Err(e) if evm::broadcast_err_is_ok(&e) => Ok(tx_hash),
                    Err(e) => Err(e),
                }
            }
        },
        evm::broadcast_err_is_final,
        "eth_sendRawTransaction",
    )
    .await
}

fn merged_gas_price(
    approval: &EthereumApproval,
    draft: &EthereumTxDraft,
    hints: &FeeHints,
    gas_limit: u64,
) -> eyre::Result<u128> {
    let fee_cap = approval
        .fees
        .as_deref()
        .map(evm::parse_quantity_u128)
        .transpose()?;
    let price = match (approval.gas_price.as_deref(), fee_cap) {
        (Some(p), _) => evm::parse_quantity_u128(p)?,
        (None, Some(cap)) => cap / u128::from(gas_limit.max(1)),
        (None, None) => {
            let chosen = draft
                .gas_price
                .as_deref()
                .or(hints.estimated_gas_price.as_deref())
                .ok_or_else(|| KeyringError::InvalidOption("no gas price available".into()))?;
            evm::parse_quantity_u128(chosen)?
        }
    };
    if price == 0 {
        return Err(KeyringError::InvalidOption(
            "refusing to broadcast with a zero gas price".into(),
        )
        .into());
    }
    if let Some(cap) = fee_cap {
        let total = price
            .checked_mul(u128::from(gas_limit))
            .ok_or_else(|| KeyringError::InvalidOption("fee overflows u128".into()))?;
        if total > cap {
            return Err(KeyringError::InvalidOption(format!(
                "gas price {price} x limit {gas_limit} exceeds the approved fee {cap}"
            ))
            .into());
        }
    }
    Ok(price)
}

fn merged_gas_limit(
    approval: &EthereumApproval,
    draft: &EthereumTxDraft,
    hints: &FeeHints,
) -> eyre::Result<u64> {
    let chosen = approval
        .gas_limit
        .as_deref()
        .or(draft.gas.as_deref())
        .unwrap_or(&hints.estimated_gas_limit);
    evm::parse_quantity_u64(chosen)
}

pub(super) async fn sign_legacy(
    svc: &KeyRingService,
    env: &Env,
    req: EthereumSignRequest,
) -> eyre::Result<EthereumBroadcast> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_ETHEREUM_END);
    let r = svc.resolve(&req.chain_id).await?;
    let evm_chain_id = r.chain.evm_chain_id.ok_or_else(|| {
        KeyringError::InvalidOption(format!(
            "{} does not accept Ethereum transactions",
            r.chain.chain_id
        ))
    })?;
    ensure_ethereum_key(&r)?;
    ensure_signer(&r.chain, &r.key, &req.signer, true)?;
    let from = r.key.hex_address();

    let hints = fee_hints(svc, &r.chain, &req.draft, &from).await;
    tracing::info!(chain_id = %req.chain_id, mode = "ethereum", "awaiting approval");
    let resp = svc
        .approvals
        .wait_approve(
            env,
            ROUTE_SIGN_ETHEREUM,
            KIND_REQUEST_SIGN_ETHEREUM,
            ApprovalRequest::SignEthereum {
                chain_id: req.chain_id.clone(),
                signer: req.signer.clone(),
                draft: req.draft.clone(),
                fee_hints: hints.clone(),
            },
        )
        .await?;
    let ApprovalResponse::Ethereum(approval) = resp else {
        return Err(KeyringError::InvalidApprovalResponse.into());
    };

    let gas_limit = merged_gas_limit(&approval, &req.draft, &hints)?;
    let gas_price = merged_gas_price(&approval, &req.draft, &hints, gas_limit)?;
    let nonce = match req.draft.nonce.as_deref() {
        Some(n) => evm::parse_quantity_u64(n)?,
        None => pending_nonce(svc, &r.chain, &from).await?,
    };
    let tx = evm::build_legacy_tx(
        &req.draft,
        &LegacyFields {
            chain_id: evm_chain_id,
            nonce,
            gas_price,
            gas_limit,
        },
    )?;

    let sig = svc
        .keyring
        .sign_ethereum_hash(r.coin_type, &r.key.pub_key, &tx.signature_hash().0)
        .await?;
    let (raw, hash) = evm::finalize_legacy(tx, sig);
    let raw_tx = format!("0x{}", hex::encode(raw));
    let tx_hash = broadcast(svc, &r.chain, raw_tx.clone(), hash.to_string()).await?;
    tracing::info!(chain_id = %req.chain_id, mode = "ethereum", %tx_hash, nonce, "broadcast");
    Ok(EthereumBroadcast { tx_hash, raw_tx })
}

pub(super) async fn sign_typed_data(
    svc: &KeyRingService,
    env: &Env,
    req: TypedDataSignRequest,
) -> eyre::Result<RecoverableSignature> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_ETHEREUM_END);
    let r = svc.resolve(&req.chain_id).await?;
    ensure_ethereum_key(&r)?;
    if let Some(signer) = req.signer.as_deref() {
        ensure_signer(&r.chain, &r.key, signer, true)?;
    }
    let digest = evm::typed_data_hash(&req.typed_data, req.version)?;

    tracing::info!(chain_id = %req.chain_id, mode = "typed_data", "awaiting approval");
    let resp = svc
        .approvals
        .wait_approve(
            env,
            ROUTE_SIGN_ETHEREUM,
            KIND_REQUEST_SIGN_ETHEREUM,
            ApprovalRequest::SignEthereumTypedData {
                chain_id: req.chain_id.clone(),
                signer: req.signer.clone(),
                typed_data: req.typed_data,
                version: req.version,
            },
        )
        .await?;
    let ApprovalResponse::Approved = resp else {
        return Err(KeyringError::InvalidApprovalResponse.into());
    };

    let sig = svc
        .keyring
        .sign_ethereum_hash(r.coin_type, &r.key.pub_key, &digest.0)
        .await?;
    Ok(RecoverableSignature::from(&sig))
}
