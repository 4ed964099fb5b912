use custodian::{
    chains::{
        cosmos::{
            adr36,
            amino::{self, AminoMsg, StdFee, StdSignDoc},
            direct::SignDoc,
        },
        evm::{self, EthereumTxDraft, TypedDataVersion},
    },
    collab::{
        ApprovalInteraction, ApprovalRequest, ApprovalResponse, Audience, ChannelEvents,
        ConfigChainRegistry, DispatchedEvent, Env, EthereumApproval, EventDispatcher, LedgerSigner,
        NoLedger, RpcTransport,
        EVENT_KEYSTORE_CHANGED, EVENT_REQUEST_SIGN_END, EVENT_REQUEST_SIGN_ETHEREUM_END,
    },
    config::{builtin_chains, FeeConfig},
    derive::{self, Key, KeyAlgo},
    errors::KeyringError,
    keyring::{KeyRing, KeyRingStatus},
    keystore::{
        crypto::{self, KdfAlgorithm},
        Bip44HdPath, LedgerApp,
    },
    kv::MemoryKvStore,
    retry::BackoffConfig,
    service::{
        Adr36Verification, AminoSignOptions, AminoSignRequest, Collaborators, DirectSignRequest,
        EthereumSignRequest, KeyRingService, ProxyDecryptRequest, ProxyReEncryptRequest,
        TypedDataSignRequest,
    },
};
use alloy::{
    primitives::{B256, U256},
    signers::{local::PrivateKeySigner, SignerSync as _},
};
use eyre::ContextCompat as _;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::broadcast;

const ABANDON: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const COSMOS_ADDR: &str = "cosmos19rl4cm2hmr8afy4kldpxz3fka4jguq0auqdal4";

type Answer = Box<dyn FnOnce(ApprovalRequest) -> eyre::Result<ApprovalResponse> + Send>;

/// Replays queued answers in order and records every prompt it was shown.
#[derive(Default)]
struct ScriptedApprovals {
    answers: Mutex<VecDeque<Answer>>,
    seen: Mutex<Vec<(String, ApprovalRequest)>>,
}

impl ScriptedApprovals {
    fn push(
        &self,
        answer: impl FnOnce(ApprovalRequest) -> eyre::Result<ApprovalResponse> + Send + 'static,
    ) {
        if let Ok(mut q) = self.answers.lock() {
            q.push_back(Box::new(answer));
        }
    }

    fn seen(&self) -> Vec<(String, ApprovalRequest)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ApprovalInteraction for ScriptedApprovals {
    async fn wait_approve(
        &self,
        _env: &Env,
        route: &str,
        _kind: &str,
        request: ApprovalRequest,
    ) -> eyre::Result<ApprovalResponse> {
        self.seen
            .lock()
            .map_err(|_poisoned| eyre::eyre!("poisoned"))?
            .push((route.to_owned(), request.clone()));
        let answer = self
            .answers
            .lock()
            .map_err(|_poisoned| eyre::eyre!("poisoned"))?
            .pop_front()
            .context("unexpected approval prompt")?;
        answer(request)
    }
}

/// Canned JSON-RPC node that remembers what was broadcast.
#[derive(Default)]
struct FakeNode {
    calls: Mutex<Vec<String>>,
    broadcast: Mutex<Vec<String>>,
    fail_estimate: bool,
}

#[async_trait::async_trait]
impl RpcTransport for FakeNode {
    async fn request(&self, _url: &str, method: &str, params: Value) -> eyre::Result<Value> {
        self.calls
            .lock()
            .map_err(|_poisoned| eyre::eyre!("poisoned"))?
            .push(method.to_owned());
        match method {
            "eth_gasPrice" => Ok(json!("0x3b9aca00")),
            "eth_estimateGas" if self.fail_estimate => {
                Err(KeyringError::Transport("execution reverted".into()).into())
            }
            "eth_estimateGas" => Ok(json!("0x5208")),
            "eth_getTransactionCount" => Ok(json!("0x7")),
            "eth_sendRawTransaction" => {
                let raw = params
                    .get(0)
                    .and_then(Value::as_str)
                    .context("raw tx param")?
                    .to_owned();
                self.broadcast
                    .lock()
                    .map_err(|_poisoned| eyre::eyre!("poisoned"))?
                    .push(raw);
                Ok(json!("0xignored"))
            }
            other => Err(KeyringError::Transport(format!("unexpected method {other}")).into()),
        }
    }
}

/// Software stand-in for a hardware wallet. `ethereum: None` is a device without the
/// Ethereum app.
struct FakeLedger {
    cosmos: [u8; 32],
    ethereum: Option<[u8; 32]>,
}

impl FakeLedger {
    fn secret(&self, app: LedgerApp) -> eyre::Result<[u8; 32]> {
        match app {
            LedgerApp::Cosmos => Ok(self.cosmos),
            LedgerApp::Ethereum => self
                .ethereum
                .ok_or_else(|| KeyringError::HardwareUnavailable.into()),
        }
    }
}

#[async_trait::async_trait]
impl LedgerSigner for FakeLedger {
    async fn open(&self, app: LedgerApp) -> eyre::Result<()> {
        self.secret(app).map(|_secret| ())
    }

    async fn close(&self) {}

    async fn public_key(
        &self,
        app: LedgerApp,
        _coin_type: u32,
        _path: Bip44HdPath,
    ) -> eyre::Result<Vec<u8>> {
        let algo = match app {
            LedgerApp::Cosmos => KeyAlgo::Secp256k1,
            LedgerApp::Ethereum => KeyAlgo::Ethsecp256k1,
        };
        Ok(Key::from_private_key(&self.secret(app)?, algo)?.pub_key)
    }

    async fn sign(
        &self,
        _path: Bip44HdPath,
        _pub_key: &[u8],
        message: &[u8],
    ) -> eyre::Result<[u8; 64]> {
        derive::sign_digest(&self.cosmos, &KeyAlgo::Secp256k1.digest(message))
    }

    async fn sign_ethereum(
        &self,
        _path: Bip44HdPath,
        _pub_key: &[u8],
        digest: &[u8; 32],
    ) -> eyre::Result<Vec<u8>> {
        let signer = PrivateKeySigner::from_slice(&self.secret(LedgerApp::Ethereum)?)?;
        Ok(signer.sign_hash_sync(&B256::from(*digest))?.as_bytes().to_vec())
    }
}

struct Harness {
    svc: KeyRingService,
    approvals: Arc<ScriptedApprovals>,
    node: Arc<FakeNode>,
    events: broadcast::Receiver<DispatchedEvent>,
}

impl Harness {
    fn drain(&mut self) -> Vec<DispatchedEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

fn pw(s: &str) -> SecretString {
    SecretString::from(s.to_owned())
}

fn err_kind(r: &eyre::Report) -> Option<&KeyringError> {
    r.downcast_ref::<KeyringError>()
}

async fn harness_with(node: FakeNode) -> eyre::Result<Harness> {
    let keyring = Arc::new(KeyRing::new(
        Arc::new(MemoryKvStore::default()),
        Arc::new(NoLedger),
        KdfAlgorithm::Sha256,
    ));
    keyring.restore().await?;
    keyring
        .create_mnemonic_key(ABANDON, &pw("p@ss"), "main", Bip44HdPath::default())
        .await?;
    serve(keyring, node)
}

async fn ledger_harness(device: FakeLedger) -> eyre::Result<Harness> {
    let keyring = Arc::new(KeyRing::new(
        Arc::new(MemoryKvStore::default()),
        Arc::new(device),
        KdfAlgorithm::Sha256,
    ));
    keyring.restore().await?;
    keyring
        .create_ledger_key(&pw("p@ss"), "hw", Bip44HdPath::default())
        .await?;
    serve(keyring, FakeNode::default())
}

fn serve(keyring: Arc<KeyRing>, node: FakeNode) -> eyre::Result<Harness> {
    let channel = ChannelEvents::new(64);
    let events = channel.subscribe();
    let events_dyn: Arc<dyn EventDispatcher> = Arc::new(channel);
    let approvals = Arc::new(ScriptedApprovals::default());
    let node = Arc::new(node);
    let svc = KeyRingService::new(
        keyring,
        Collaborators {
            chains: Arc::new(ConfigChainRegistry::new(builtin_chains())),
            approvals: Arc::clone(&approvals) as Arc<dyn ApprovalInteraction>,
            events: events_dyn,
            rpc: Arc::clone(&node) as Arc<dyn RpcTransport>,
        },
        FeeConfig::default(),
        BackoffConfig {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        },
    );
    Ok(Harness {
        svc,
        approvals,
        node,
        events,
    })
}

async fn harness() -> eyre::Result<Harness> {
    harness_with(FakeNode::default()).await
}

fn send_doc(chain_id: &str, from: &str) -> StdSignDoc {
    StdSignDoc {
        chain_id: chain_id.into(),
        account_number: "12".into(),
        sequence: "3".into(),
        timeout_height: None,
        fee: StdFee {
            amount: vec![amino::Coin {
                denom: "uatom".into(),
                amount: "500".into(),
            }],
            gas: "200000".into(),
            payer: None,
            granter: None,
        },
        msgs: vec![AminoMsg {
            kind: "cosmos-sdk/MsgSend".into(),
            value: json!({
                "from_address": from,
                "to_address": from,
                "amount": [{ "denom": "uatom", "amount": "1" }],
            }),
        }],
        memo: String::new(),
    }
}

fn end_events(events: &[DispatchedEvent], name: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event == name && e.audience == Audience::App)
        .count()
}

#[tokio::test]
async fn amino_signs_the_doc_as_edited_during_approval() -> eyre::Result<()> {
    let mut h = harness().await?;
    h.approvals.push(|req| match req {
        ApprovalRequest::SignAmino { mut sign_doc, is_adr36, .. } => {
            assert!(!is_adr36);
            sign_doc.memo = "edited".into();
            Ok(ApprovalResponse::Amino(sign_doc))
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });

    let resp = h
        .svc
        .request_sign_amino(
            &Env::origin("https://app.example"),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: send_doc("cosmoshub-4", COSMOS_ADDR),
                options: AminoSignOptions::default(),
            },
        )
        .await?;

    assert_eq!(resp.signed.memo, "edited");
    assert_eq!(resp.signature.pub_key.kind, amino::SECP256K1_PUB_KEY_TYPE);
    let key = h.svc.get_key("cosmoshub-4").await?;
    let pub_key = hex::decode(&key.pub_key)?;
    let sig = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &resp.signature.signature,
    )?;
    let bytes = amino::serialize_sign_doc(&resp.signed)?;
    assert!(derive::verify_signature(&pub_key, KeyAlgo::Secp256k1, &bytes, &sig));

    let routes: Vec<String> = h.approvals.seen().into_iter().map(|(r, _)| r).collect();
    assert_eq!(routes, vec!["/sign".to_owned()]);
    assert_eq!(end_events(&h.drain(), EVENT_REQUEST_SIGN_END), 1);
    Ok(())
}

#[tokio::test]
async fn wrong_signer_fails_before_any_prompt() -> eyre::Result<()> {
    let mut h = harness().await?;
    let other = "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu";
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: other.into(),
                sign_doc: send_doc("cosmoshub-4", other),
                options: AminoSignOptions::default(),
            },
        )
        .await
        .err()
        .context("foreign signer must be refused")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::SignerMismatch { .. })), "{err:?}");
    assert!(h.approvals.seen().is_empty());
    // The end event fires on every exit path.
    assert_eq!(end_events(&h.drain(), EVENT_REQUEST_SIGN_END), 1);
    Ok(())
}

#[tokio::test]
async fn adr36_embedded_signer_must_match_the_request() -> eyre::Result<()> {
    let h = harness().await?;
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: adr36::make_sign_doc("cosmos1abc", b"hello"),
                options: AminoSignOptions::default(),
            },
        )
        .await
        .err()
        .context("embedded signer mismatch")?;
    assert_eq!(err_kind(&err), Some(&KeyringError::UnmatchedSignerInSignDoc));
    assert!(h.approvals.seen().is_empty());
    Ok(())
}

#[tokio::test]
async fn approval_may_not_change_the_doc_classification() -> eyre::Result<()> {
    let h = harness().await?;
    h.approvals
        .push(|_req| Ok(ApprovalResponse::Amino(send_doc("", COSMOS_ADDR))));
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: adr36::make_sign_doc(COSMOS_ADDR, b"hello"),
                options: AminoSignOptions {
                    is_adr36_with_string: true,
                },
            },
        )
        .await
        .err()
        .context("reclassified doc must be refused")?;
    assert_eq!(err_kind(&err), Some(&KeyringError::ClassificationChanged));
    Ok(())
}

#[tokio::test]
async fn string_option_requires_an_adr36_doc() -> eyre::Result<()> {
    let h = harness().await?;
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: send_doc("cosmoshub-4", COSMOS_ADDR),
                options: AminoSignOptions {
                    is_adr36_with_string: true,
                },
            },
        )
        .await
        .err()
        .context("option on a tx doc")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::InvalidOption(_))), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn adr36_signature_verifies_and_detects_tampering() -> eyre::Result<()> {
    let h = harness().await?;
    h.approvals.push(|req| match req {
        ApprovalRequest::SignAmino { sign_doc, .. } => Ok(ApprovalResponse::Amino(sign_doc)),
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let resp = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: adr36::make_sign_doc(COSMOS_ADDR, b"hello"),
                options: AminoSignOptions::default(),
            },
        )
        .await?;

    for (data, expected) in [
        (&b"hello"[..], Adr36Verification::Valid),
        (&b"hellO"[..], Adr36Verification::InvalidSignature),
    ] {
        let got = h
            .svc
            .verify_adr36_amino_sign_doc_detailed("cosmoshub-4", COSMOS_ADDR, data, &resp.signature)
            .await?;
        assert_eq!(got, expected);
    }
    assert!(
        !h.svc
            .verify_adr36_amino_sign_doc(
                "cosmoshub-4",
                "cosmos1qypqxpq9qcrsszg2pvxq6rs0zqg3yyc5lzv7xu",
                b"hello",
                &resp.signature
            )
            .await?
    );

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut sig_bytes = base64::Engine::decode(&b64, &resp.signature.signature)?;
    let last = sig_bytes.last_mut().context("empty signature")?;
    *last ^= 0x01;
    let mut flipped = resp.signature.clone();
    flipped.signature = base64::Engine::encode(&b64, &sig_bytes);
    assert_eq!(
        h.svc
            .verify_adr36_amino_sign_doc_detailed("cosmoshub-4", COSMOS_ADDR, b"hello", &flipped)
            .await?,
        Adr36Verification::InvalidSignature
    );

    let mut wrong_type = resp.signature.clone();
    wrong_type.pub_key.kind = amino::ETH_SECP256K1_PUB_KEY_TYPE.into();
    assert_eq!(
        h.svc
            .verify_adr36_amino_sign_doc_detailed("cosmoshub-4", COSMOS_ADDR, b"hello", &wrong_type)
            .await?,
        Adr36Verification::PubKeyTypeMismatch
    );
    wrong_type.pub_key.kind = "tendermint/PubKeyEd25519".into();
    let err = h
        .svc
        .verify_adr36_amino_sign_doc_detailed("cosmoshub-4", COSMOS_ADDR, b"hello", &wrong_type)
        .await
        .err()
        .context("unknown key type")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::UnsupportedPubKeyType(_))), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn rejection_propagates_and_still_ends_the_request() -> eyre::Result<()> {
    let mut h = harness().await?;
    h.approvals
        .push(|_req| Err(KeyringError::ApprovalRejected.into()));
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: send_doc("cosmoshub-4", COSMOS_ADDR),
                options: AminoSignOptions::default(),
            },
        )
        .await
        .err()
        .context("rejected")?;
    assert_eq!(err_kind(&err), Some(&KeyringError::ApprovalRejected));
    assert_eq!(end_events(&h.drain(), EVENT_REQUEST_SIGN_END), 1);
    Ok(())
}

#[tokio::test]
async fn direct_sign_rejects_a_chain_id_swap() -> eyre::Result<()> {
    let h = harness().await?;
    let doc = SignDoc {
        body_bytes: vec![1, 2, 3],
        auth_info_bytes: vec![4, 5],
        chain_id: "cosmoshub-4".into(),
        account_number: 12,
    };
    let request = DirectSignRequest {
        chain_id: "cosmoshub-4".into(),
        signer: COSMOS_ADDR.into(),
        sign_doc: doc.clone(),
    };

    h.approvals.push(|req| match req {
        ApprovalRequest::SignDirect { sign_doc_bytes, .. } => {
            Ok(ApprovalResponse::Direct(sign_doc_bytes))
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let resp = h
        .svc
        .request_sign_direct(&Env::internal(), request.clone())
        .await?;
    assert_eq!(resp.signed, doc);
    let pub_key = hex::decode(h.svc.get_key("cosmoshub-4").await?.pub_key)?;
    let sig = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &resp.signature.signature,
    )?;
    assert!(derive::verify_signature(&pub_key, KeyAlgo::Secp256k1, &doc.to_bytes(), &sig));

    h.approvals.push(|_req| {
        let swapped = SignDoc {
            body_bytes: vec![1, 2, 3],
            auth_info_bytes: vec![4, 5],
            chain_id: "osmosis-1".into(),
            account_number: 12,
        };
        Ok(ApprovalResponse::Direct(swapped.to_bytes()))
    });
    let err = h
        .svc
        .request_sign_direct(&Env::internal(), request)
        .await
        .err()
        .context("swapped chain id")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::InvalidSignDoc(_))), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn amino_binds_the_doc_to_the_requested_chain() -> eyre::Result<()> {
    let mut h = harness().await?;
    let foreign = AminoSignRequest {
        chain_id: "cosmoshub-4".into(),
        signer: COSMOS_ADDR.into(),
        sign_doc: send_doc("osmosis-1", COSMOS_ADDR),
        options: AminoSignOptions::default(),
    };
    let err = h
        .svc
        .request_sign_amino(&Env::internal(), foreign)
        .await
        .err()
        .context("doc for another chain")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::InvalidSignDoc(_))), "{err:?}");
    assert!(h.approvals.seen().is_empty());

    h.approvals.push(|req| match req {
        ApprovalRequest::SignAmino { mut sign_doc, .. } => {
            sign_doc.chain_id = "osmosis-1".into();
            Ok(ApprovalResponse::Amino(sign_doc))
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let request = AminoSignRequest {
        chain_id: "cosmoshub-4".into(),
        signer: COSMOS_ADDR.into(),
        sign_doc: send_doc("cosmoshub-4", COSMOS_ADDR),
        options: AminoSignOptions::default(),
    };
    let err = h
        .svc
        .request_sign_amino(&Env::internal(), request)
        .await
        .err()
        .context("chain id swapped during approval")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::InvalidSignDoc(_))), "{err:?}");
    assert_eq!(end_events(&h.drain(), EVENT_REQUEST_SIGN_END), 2);
    Ok(())
}

#[tokio::test]
async fn ethereum_tx_is_signed_with_approved_fees_and_broadcast() -> eyre::Result<()> {
    let mut h = harness().await?;
    h.approvals.push(|req| match req {
        ApprovalRequest::SignEthereum { fee_hints, .. } => {
            assert_eq!(fee_hints.estimated_gas_price.as_deref(), Some("0x3b9aca00"));
            assert_eq!(fee_hints.estimated_gas_limit, "0x5208");
            Ok(ApprovalResponse::Ethereum(EthereumApproval {
                gas_price: Some("0x77359400".into()),
                ..EthereumApproval::default()
            }))
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });

    let key = h.svc.get_key("eip155:1").await?;
    let out = h
        .svc
        .request_sign_ethereum(
            &Env::internal(),
            EthereumSignRequest {
                chain_id: "eip155:1".into(),
                signer: key.bech32_address.to_lowercase(),
                draft: EthereumTxDraft {
                    to: Some("0x000000000000000000000000000000000000dEaD".into()),
                    value: Some("0x1".into()),
                    ..EthereumTxDraft::default()
                },
            },
        )
        .await?;

    let broadcast = h.node.broadcast.lock().map(|b| b.clone()).unwrap_or_default();
    assert_eq!(broadcast, vec![out.raw_tx.clone()]);
    let raw = hex::decode(out.raw_tx.trim_start_matches("0x"))?;
    assert_eq!(out.tx_hash, alloy::primitives::keccak256(&raw).to_string());

    let calls = h.node.calls.lock().map(|c| c.clone()).unwrap_or_default();
    assert!(calls.contains(&"eth_getTransactionCount".to_owned()), "{calls:?}");
    assert_eq!(end_events(&h.drain(), EVENT_REQUEST_SIGN_ETHEREUM_END), 1);
    Ok(())
}

#[tokio::test]
async fn failed_gas_estimate_falls_back_to_configured_limit() -> eyre::Result<()> {
    let h = harness_with(FakeNode {
        fail_estimate: true,
        ..FakeNode::default()
    })
    .await?;
    h.approvals.push(|req| match req {
        ApprovalRequest::SignEthereum { fee_hints, .. } => {
            assert_eq!(
                fee_hints.estimated_gas_limit,
                evm::to_quantity(U256::from(FeeConfig::default().fallback_gas_limit))
            );
            Err(KeyringError::ApprovalRejected.into())
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let key = h.svc.get_key("evmos_9001-2").await?;
    let err = h
        .svc
        .request_sign_ethereum(
            &Env::internal(),
            EthereumSignRequest {
                chain_id: "evmos_9001-2".into(),
                signer: key.bech32_address,
                draft: EthereumTxDraft::default(),
            },
        )
        .await
        .err()
        .context("rejected")?;
    assert_eq!(err_kind(&err), Some(&KeyringError::ApprovalRejected));
    Ok(())
}

#[tokio::test]
async fn typed_data_signature_recovers_to_the_key() -> eyre::Result<()> {
    let h = harness().await?;
    let typed = json!({
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "chainId", "type": "uint256" }
            ],
            "Mail": [{ "name": "contents", "type": "string" }]
        },
        "primaryType": "Mail",
        "domain": { "name": "Ether Mail", "chainId": 1 },
        "message": { "contents": "Hello, Bob!" }
    });
    h.approvals.push(|_req| Ok(ApprovalResponse::Approved));

    let key = h.svc.get_key("eip155:1").await?;
    let sig = h
        .svc
        .request_sign_ethereum_typed_data(
            &Env::internal(),
            TypedDataSignRequest {
                chain_id: "eip155:1".into(),
                signer: Some(key.bech32_address.clone()),
                typed_data: typed.clone(),
                version: TypedDataVersion::V4,
            },
        )
        .await?;

    let digest = evm::typed_data_hash(&typed, TypedDataVersion::V4)?;
    let raw = hex::decode(sig.signature.trim_start_matches("0x"))?;
    let recovered = evm::signature_from_rsv(&raw)?.recover_address_from_prehash(&digest)?;
    assert_eq!(recovered.to_checksum(None), key.bech32_address);

    let err = h
        .svc
        .request_sign_ethereum_typed_data(
            &Env::internal(),
            TypedDataSignRequest {
                chain_id: "eip155:1".into(),
                signer: None,
                typed_data: typed,
                version: TypedDataVersion::V1,
            },
        )
        .await
        .err()
        .context("v1 refused")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::InvalidOption(_))), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn proxy_reencrypt_hands_the_plaintext_to_the_recipient() -> eyre::Result<()> {
    let h = harness().await?;
    let key = h.svc.get_key("cosmoshub-4").await?;
    let own_pub = hex::decode(&key.pub_key)?;
    let envelope = crypto::ecies_encrypt(&own_pub, b"viewing key")?;

    h.approvals.push(|req| match req {
        ApprovalRequest::ProxyDecrypt { fee_hints, .. } => {
            assert!(fee_hints.is_none(), "cosmos chains carry no fee hints");
            Ok(ApprovalResponse::Approved)
        }
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let plain = h
        .svc
        .request_proxy_decrypt(
            &Env::internal(),
            ProxyDecryptRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                envelope: envelope.clone(),
            },
        )
        .await?;
    assert_eq!(plain.as_slice(), b"viewing key");

    let recipient_secret = [0x11_u8; 32];
    let recipient = Key::from_private_key(&recipient_secret, KeyAlgo::Secp256k1)?;
    h.approvals.push(|_req| Ok(ApprovalResponse::Approved));
    let resealed = h
        .svc
        .request_proxy_reencrypt(
            &Env::internal(),
            ProxyReEncryptRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                envelope,
                recipient_pub_key: recipient.pub_key,
            },
        )
        .await?;
    let opened = crypto::ecies_decrypt(&recipient_secret, &resealed)?;
    assert_eq!(opened.as_slice(), b"viewing key");
    Ok(())
}

#[tokio::test]
async fn enable_prompts_for_unlock_only_when_locked() -> eyre::Result<()> {
    let h = harness().await?;
    assert_eq!(h.svc.enable(&Env::internal()).await?, KeyRingStatus::Unlocked);
    assert!(h.approvals.seen().is_empty());

    h.svc.lock().await;
    h.approvals.push(|_req| Ok(ApprovalResponse::Unlock { password: None }));
    assert_eq!(h.svc.enable(&Env::internal()).await?, KeyRingStatus::Locked);

    h.approvals.push(|_req| {
        Ok(ApprovalResponse::Unlock {
            password: Some(pw("p@ss")),
        })
    });
    assert_eq!(h.svc.enable(&Env::internal()).await?, KeyRingStatus::Unlocked);
    let routes: Vec<String> = h.approvals.seen().into_iter().map(|(r, _)| r).collect();
    assert_eq!(routes, vec!["/unlock".to_owned(), "/unlock".to_owned()]);
    Ok(())
}

#[tokio::test]
async fn signing_while_locked_fails_without_prompting() -> eyre::Result<()> {
    let h = harness().await?;
    h.svc.lock().await;
    let err = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: COSMOS_ADDR.into(),
                sign_doc: send_doc("cosmoshub-4", COSMOS_ADDR),
                options: AminoSignOptions::default(),
            },
        )
        .await
        .err()
        .context("locked")?;
    assert_eq!(err_kind(&err), Some(&KeyringError::Locked));
    assert!(h.approvals.seen().is_empty());
    Ok(())
}

#[tokio::test]
async fn coin_type_selection_notifies_pages_once() -> eyre::Result<()> {
    let mut h = harness().await?;
    assert!(!h.svc.is_key_store_coin_type_set("secret-4").await?);
    let selectables = h.svc.get_key_store_bip44_selectables("secret-4").await?;
    assert_eq!(selectables.len(), 2);

    assert!(h.svc.set_key_store_coin_type("secret-4", 118).await?);
    assert!(!h.svc.set_key_store_coin_type("secret-4", 118).await?);
    assert!(h.svc.is_key_store_coin_type_set("secret-4").await?);

    let changed = h
        .drain()
        .into_iter()
        .filter(|e| e.event == EVENT_KEYSTORE_CHANGED && e.audience == Audience::Webpage)
        .count();
    assert_eq!(changed, 1);

    let err = h
        .svc
        .set_key_store_coin_type("secret-4", 60)
        .await
        .err()
        .context("unoffered coin type")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::UnsupportedCoinType { .. })), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn unknown_chain_is_reported() -> eyre::Result<()> {
    let h = harness().await?;
    let err = h.svc.get_key("nope-1").await.err().context("unknown chain")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::UnknownChain(_))), "{err:?}");
    Ok(())
}

const DEVICE: FakeLedger = FakeLedger {
    cosmos: [0x11; 32],
    ethereum: Some([0x22; 32]),
};

#[tokio::test]
async fn ledger_signs_through_the_app_for_each_coin_type() -> eyre::Result<()> {
    let h = ledger_harness(DEVICE).await?;
    let eth_secret = DEVICE.ethereum.context("device has the ethereum app")?;

    let cosmos = h.svc.get_key("cosmoshub-4").await?;
    assert!(cosmos.is_nano_ledger);
    assert_eq!(
        hex::decode(&cosmos.pub_key)?,
        Key::from_private_key(&DEVICE.cosmos, KeyAlgo::Secp256k1)?.pub_key
    );
    let eth = h.svc.get_key("eip155:1").await?;
    assert!(eth.is_nano_ledger);
    assert_eq!(
        eth.bech32_address,
        Key::from_private_key(&eth_secret, KeyAlgo::Ethsecp256k1)?.hex_address()
    );

    // Cosmos app: amino over the canonical doc bytes.
    h.approvals.push(|req| match req {
        ApprovalRequest::SignAmino { sign_doc, .. } => Ok(ApprovalResponse::Amino(sign_doc)),
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let doc = send_doc("cosmoshub-4", &cosmos.bech32_address);
    let resp = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "cosmoshub-4".into(),
                signer: cosmos.bech32_address.clone(),
                sign_doc: doc.clone(),
                options: AminoSignOptions::default(),
            },
        )
        .await?;
    let sig = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &resp.signature.signature,
    )?;
    assert!(derive::verify_signature(
        &hex::decode(&cosmos.pub_key)?,
        KeyAlgo::Secp256k1,
        &amino::serialize_sign_doc(&doc)?,
        &sig
    ));

    // Ethereum app behind a bech32 chain: keccak digest, r || s kept.
    let evmos = h.svc.get_key("evmos_9001-2").await?;
    h.approvals.push(|req| match req {
        ApprovalRequest::SignAmino { sign_doc, .. } => Ok(ApprovalResponse::Amino(sign_doc)),
        other => Err(eyre::eyre!("unexpected prompt {other:?}")),
    });
    let doc = send_doc("evmos_9001-2", &evmos.bech32_address);
    let resp = h
        .svc
        .request_sign_amino(
            &Env::internal(),
            AminoSignRequest {
                chain_id: "evmos_9001-2".into(),
                signer: evmos.bech32_address.clone(),
                sign_doc: doc.clone(),
                options: AminoSignOptions::default(),
            },
        )
        .await?;
    let sig = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        &resp.signature.signature,
    )?;
    assert!(derive::verify_signature(
        &hex::decode(&evmos.pub_key)?,
        KeyAlgo::Ethsecp256k1,
        &amino::serialize_sign_doc(&doc)?,
        &sig
    ));

    // Ethereum app: recoverable signature over a typed-data digest.
    let typed = json!({
        "types": {
            "EIP712Domain": [{ "name": "name", "type": "string" }],
            "Mail": [{ "name": "contents", "type": "string" }]
        },
        "primaryType": "Mail",
        "domain": { "name": "Ether Mail" },
        "message": { "contents": "from the device" }
    });
    h.approvals.push(|_req| Ok(ApprovalResponse::Approved));
    let sig = h
        .svc
        .request_sign_ethereum_typed_data(
            &Env::internal(),
            TypedDataSignRequest {
                chain_id: "eip155:1".into(),
                signer: Some(eth.bech32_address.clone()),
                typed_data: typed.clone(),
                version: TypedDataVersion::V4,
            },
        )
        .await?;
    let digest = evm::typed_data_hash(&typed, TypedDataVersion::V4)?;
    let raw = hex::decode(sig.signature.trim_start_matches("0x"))?;
    let recovered = evm::signature_from_rsv(&raw)?.recover_address_from_prehash(&digest)?;
    assert_eq!(recovered.to_checksum(None), eth.bech32_address);
    Ok(())
}

#[tokio::test]
async fn ledger_without_the_ethereum_app_stays_cosmos_only() -> eyre::Result<()> {
    let h = ledger_harness(FakeLedger {
        cosmos: [0x11; 32],
        ethereum: None,
    })
    .await?;
    assert!(h.svc.get_key("cosmoshub-4").await?.is_nano_ledger);
    let err = h
        .svc
        .get_key("eip155:1")
        .await
        .err()
        .context("no ethereum key recorded")?;
    assert!(matches!(err_kind(&err), Some(KeyringError::DerivationFailure(_))), "{err:?}");
    Ok(())
}
