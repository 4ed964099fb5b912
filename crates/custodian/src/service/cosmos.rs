use super::{ensure_signer, guard::InFlightRequest, KeyRingService};
use crate::{
    chains::cosmos::{
        adr36,
        amino::{self, StdSignDoc, StdSignature},
        direct::SignDoc,
    },
    collab::{
        ApprovalRequest, ApprovalResponse, Env, EVENT_REQUEST_SIGN_END, KIND_REQUEST_SIGN,
        ROUTE_SIGN,
    },
    errors::KeyringError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AminoSignOptions {
    /// The dapp wants the ADR-36 `data` shown as text. Only valid for ADR-36 docs.
    #[serde(default)]
    pub is_adr36_with_string: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AminoSignRequest {
    pub chain_id: String,
    pub signer: String,
    pub sign_doc: StdSignDoc,
    #[serde(default)]
    pub options: AminoSignOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AminoSignResponse {
    /// The doc that was signed, including any edits made during approval.
    pub signed: StdSignDoc,
    pub signature: StdSignature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSignRequest {
    pub chain_id: String,
    pub signer: String,
    pub sign_doc: SignDoc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSignResponse {
    pub signed: SignDoc,
    pub signature: StdSignature,
}

/// ADR-36 docs carry an empty chain id; everything else must name the requested chain.
fn ensure_doc_chain_id(doc: &StdSignDoc, chain_id: &str, is_adr36: bool) -> eyre::Result<()> {
    if is_adr36 || doc.chain_id == chain_id {
        return Ok(());
    }
    Err(KeyringError::InvalidSignDoc(format!(
        "sign doc chain id {} does not match {chain_id}",
        doc.chain_id
    ))
    .into())
}

fn ensure_embedded_signer(doc: &StdSignDoc, signer: &str, err: KeyringError) -> eyre::Result<()> {
    if adr36::embedded_signer(doc) == Some(signer) {
        Ok(())
    } else {
        Err(err.into())
    }
}

pub(super) async fn sign_amino(
    svc: &KeyRingService,
    env: &Env,
    req: AminoSignRequest,
) -> eyre::Result<AminoSignResponse> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_END);
    let r = svc.resolve(&req.chain_id).await?;
    if r.chain.uses_hex_addresses() {
        return Err(KeyringError::InvalidOption(format!(
            "{} has no bech32 accounts",
            r.chain.chain_id
        ))
        .into());
    }
    ensure_signer(&r.chain, &r.key, &req.signer, false)?;

    let prefix = r.chain.bech32_prefix.as_str();
    if adr36::is_adr36_shaped(&req.sign_doc) {
        ensure_embedded_signer(&req.sign_doc, &req.signer, KeyringError::UnmatchedSignerInSignDoc)?;
    }
    let is_adr36 = adr36::check_and_validate(&req.sign_doc, prefix)?;
    ensure_doc_chain_id(&req.sign_doc, &req.chain_id, is_adr36)?;
    if req.options.is_adr36_with_string && !is_adr36 {
        return Err(KeyringError::InvalidOption(
            "is_adr36_with_string is only valid for ADR-36 sign docs".into(),
        )
        .into());
    }

    tracing::info!(chain_id = %req.chain_id, mode = "amino", is_adr36, "awaiting approval");
    let resp = svc
        .approvals
        .wait_approve(
            env,
            ROUTE_SIGN,
            KIND_REQUEST_SIGN,
            ApprovalRequest::SignAmino {
                chain_id: req.chain_id.clone(),
                signer: req.signer.clone(),
                sign_doc: req.sign_doc,
                is_adr36,
                is_adr36_with_string: req.options.is_adr36_with_string,
            },
        )
        .await?;
    let ApprovalResponse::Amino(approved) = resp else {
        return Err(KeyringError::InvalidApprovalResponse.into());
    };

    // The user may edit fee and memo, never what kind of document this is.
    if adr36::check_and_validate(&approved, prefix)? != is_adr36 {
        return Err(KeyringError::ClassificationChanged.into());
    }
    ensure_doc_chain_id(&approved, &req.chain_id, is_adr36)?;
    if is_adr36 {
        ensure_embedded_signer(
            &approved,
            &req.signer,
            KeyringError::UnmatchedSignerInApprovedSignDoc,
        )?;
    }

    let bytes = amino::serialize_sign_doc(&approved)?;
    let sig = svc.keyring.sign(r.coin_type, &r.key.pub_key, &bytes).await?;
    tracing::info!(chain_id = %req.chain_id, mode = "amino", "signed");
    Ok(AminoSignResponse {
        signed: approved,
        signature: amino::encode_signature(&r.key.pub_key, r.key.algo, &sig),
    })
}

pub(super) async fn sign_direct(
    svc: &KeyRingService,
    env: &Env,
    req: DirectSignRequest,
) -> eyre::Result<DirectSignResponse> {
    let _in_flight = InFlightRequest::acquire(&svc.events, EVENT_REQUEST_SIGN_END);
    let r = svc.resolve(&req.chain_id).await?;
    ensure_signer(&r.chain, &r.key, &req.signer, false)?;
    if req.sign_doc.chain_id != req.chain_id {
        return Err(KeyringError::InvalidSignDoc(format!(
            "sign doc chain id {} does not match {}",
            req.sign_doc.chain_id, req.chain_id
        ))
        .into());
    }

    tracing::info!(chain_id = %req.chain_id, mode = "direct", "awaiting approval");
    let resp = svc
        .approvals
        .wait_approve(
            env,
            ROUTE_SIGN,
            KIND_REQUEST_SIGN,
            ApprovalRequest::SignDirect {
                chain_id: req.chain_id.clone(),
                signer: req.signer.clone(),
                sign_doc_bytes: req.sign_doc.to_bytes(),
            },
        )
        .await?;
    let ApprovalResponse::Direct(bytes) = resp else {
        return Err(KeyringError::InvalidApprovalResponse.into());
    };
    let approved = SignDoc::from_bytes(&bytes)?;
    if approved.chain_id != req.chain_id {
        return Err(KeyringError::InvalidSignDoc("chain id changed during approval".into()).into());
    }

    let sig = svc
        .keyring
        .sign(r.coin_type, &r.key.pub_key, &approved.to_bytes())
        .await?;
    tracing::info!(chain_id = %req.chain_id, mode = "direct", "signed");
    Ok(DirectSignResponse {
        signed: approved,
        signature: amino::encode_signature(&r.key.pub_key, r.key.algo, &sig),
    })
}
