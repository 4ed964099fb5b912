use super::{ensure_signer, ethereum::fee_hints, guard::InFlightRequest, KeyRingService, Resolved};
use crate::{
    chains::evm::EthereumTxDraft,
    collab::{
        ApprovalRequest, ApprovalResponse, Env, FeeHints, EVENT_REQUEST_SIGN_ETHEREUM_END,
        KIND_REQUEST_SIGN_ETHEREUM, ROUTE_SIGN_ETHEREUM,
    },
    derive::{Key, KeyAlgo},
    errors::KeyringError,
    keystore::crypto::EciesEnvelope,
};
use zeroize::Zeroizing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDecryptRequest {
    pub chain_id: String,
    pub signer: String,
    pub envelope: EciesEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReEncryptRequest {
    pub chain_id: String,
    pub signer: String,
    pub envelope: EciesEnvelope,
    /// Compressed or uncompressed secp256k1 key the plaintext is re-sealed for.
    pub recipient_pub_key: Vec<u8>,
}

/// Fee defaults for chains that take Ethereum transactions; `None` elsewhere.
async fn proxy_fee_hints(svc: &KeyRingService, r: &Resolved) -> Option<FeeHints> {
    if r.chain.evm_chain_id.is_none() || r.chain.all_rpc_urls().is_empty() {
        return None;
    }
    Some(fee_hints(svc, &r.chain, &EthereumTxDraft::default(), &r.key.hex_address()).await)
}

async fn approve(svc: &KeyRingService, env: &Env, request: ApprovalRequest) -> eyre::Result<()> {
    let resp = svc
        .approvals
        .wait_approve(env, ROUTE_SIGN_ETHEREUM, KIND_REQUEST_SIGN_ETHEREUM, request)
        .await?;
    match resp {
        ApprovalResponse::Approved => Ok(()),
        ApprovalResponse::Unlock { .. }
        | ApprovalResponse::Amino(_)
        | ApprovalResponse::Direct(_)
        | ApprovalResponse::Ethereum(_) => Err(KeyringError::InvalidApprovalResponse.into()),
    }
}

pub(super) async fn decrypt(
    svc: &KeyRingService,
    env: &Env,
    req: ProxyDecryptRequest,
) -> eyre::Result<Zeroizing<Vec<u8>>> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_ETHEREUM_END);
    let r = svc.resolve(&req.chain_id).await?;
    ensure_signer(&r.chain, &r.key, &req.signer, false)?;
    let fee_hints = proxy_fee_hints(svc, &r).await;

    tracing::info!(chain_id = %req.chain_id, mode = "proxy_decrypt", "awaiting approval");
    approve(
        svc,
        env,
        ApprovalRequest::ProxyDecrypt {
            chain_id: req.chain_id.clone(),
            signer: req.signer.clone(),
            envelope: req.envelope.clone(),
            fee_hints,
        },
    )
    .await?;
    svc.keyring
        .proxy_decrypt(r.coin_type, &r.key.pub_key, &req.envelope)
        .await
}

pub(super) async fn reencrypt(
    svc: &KeyRingService,
    env: &Env,
    req: ProxyReEncryptRequest,
) -> eyre::Result<EciesEnvelope> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_ETHEREUM_END);
    let r = svc.resolve(&req.chain_id).await?;
    ensure_signer(&r.chain, &r.key, &req.signer, false)?;
    let recipient = Key::from_public_key(&req.recipient_pub_key, KeyAlgo::Secp256k1, false)
        .map_err(|e| KeyringError::InvalidOption(format!("recipient public key: {e}")))?;
    let fee_hints = proxy_fee_hints(svc, &r).await;

    tracing::info!(chain_id = %req.chain_id, mode = "proxy_reencrypt", "awaiting approval");
    approve(
        svc,
        env,
        ApprovalRequest::ProxyReEncrypt {
            chain_id: req.chain_id.clone(),
            signer: req.signer.clone(),
            envelope: req.envelope.clone(),
            recipient_pub_key: hex::encode(&recipient.pub_key),
            fee_hints,
        },
    )
    .await?;
    svc.keyring
        .proxy_reencrypt(r.coin_type, &r.key.pub_key, &req.envelope, &recipient.pub_key)
        .await
}
