#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use custodian::{
    chains::cosmos::{
        adr36,
        amino::{PubKey, StdSignature},
    },
    collab::{ConfigChainRegistry, Env, NoLedger, TracingEvents},
    errors::KeyringError,
    keyring::{KeyRing, KeyRingStatus},
    keystore::Bip44HdPath,
    kv::FileKvStore,
    paths::CustodianPaths,
    rpc::HttpRpcTransport,
    service::{AminoSignOptions, AminoSignRequest, Collaborators, KeyRingService},
    store::ConfigStore,
};
use eyre::Context as _;
use serde_json::json;
use std::{process::ExitCode, sync::Arc};
use tracing_subscriber::prelude::*;

mod cli_output;

use cli_output::{NEW_PASSWORD_ENV, PASSWORD_ENV};

#[derive(Parser, Debug)]
#[command(name = "custodian", version, about = "Multi-chain wallet keyring")]
struct Cli {
    /// Report failures as JSON on stdout instead of text on stderr.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Approve signing prompts without asking (required for non-interactive shells).
    #[arg(long, global = true, default_value_t = false)]
    yes: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct PathArgs {
    #[arg(long, default_value_t = 0)]
    account: u32,
    #[arg(long, default_value_t = 0)]
    change: u32,
    #[arg(long, default_value_t = 0)]
    address_index: u32,
}

impl From<PathArgs> for Bip44HdPath {
    fn from(a: PathArgs) -> Self {
        Self {
            account: a.account,
            change: a.change,
            address_index: a.address_index,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print resolved config/data paths as JSON.
    Paths,

    /// Keyring status and the public view of every key store.
    Status,

    /// Create a mnemonic key store. The first one also sets the keyring password.
    ///
    /// A fresh phrase is generated and printed once unless `--mnemonic-stdin` is given.
    Create {
        #[arg(long, default_value = "default")]
        name: String,
        /// Read an existing phrase from stdin instead of generating one.
        #[arg(long, default_value_t = false)]
        mnemonic_stdin: bool,
        /// Length of a generated phrase.
        #[arg(long, default_value_t = 24)]
        words: usize,
        #[command(flatten)]
        path: PathArgs,
    },

    /// Import a raw secp256k1 private key (hex, read from stdin).
    ImportKey {
        #[arg(long, default_value = "imported")]
        name: String,
    },

    /// List key stores.
    List,

    /// Select the key store used for signing.
    Select { index: usize },

    Rename { index: usize, name: String },

    /// Reveal the mnemonic or private key of a key store.
    Show { index: usize },

    /// Delete a key store (asks for the password).
    Delete { index: usize },

    /// Decrypt every key store and print the secrets.
    Export,

    /// Re-seal every key store under a new password.
    ChangePassword,

    /// Account address and public key of the selected key store on a chain.
    Address {
        #[arg(long)]
        chain: String,
    },

    /// Show the coin types a chain accepts, or pin one with `--set`.
    CoinType {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        set: Option<u32>,
    },

    /// Sign arbitrary text as an ADR-36 document.
    SignArbitrary {
        #[arg(long)]
        chain: String,
        data: String,
    },

    /// Check an ADR-36 signature made by the selected key store.
    VerifyArbitrary {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        signer: String,
        /// Base64 compressed public key.
        #[arg(long)]
        pub_key: String,
        /// Base64 64-byte signature.
        #[arg(long)]
        signature: String,
        #[arg(long, default_value = custodian::chains::cosmos::amino::SECP256K1_PUB_KEY_TYPE)]
        pub_key_type: String,
        data: String,
    },
}

fn init_logging(paths: &CustodianPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("custodian.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn build_service(paths: &CustodianPaths, yes: bool) -> eyre::Result<KeyRingService> {
    let cfg = ConfigStore::new(paths).load_or_init_default()?;
    let kv = FileKvStore::open(&paths.kv_dir(), "keyring")?;
    let keyring = Arc::new(KeyRing::new(Arc::new(kv), Arc::new(NoLedger), cfg.kdf));
    let collab = Collaborators {
        chains: Arc::new(ConfigChainRegistry::new(cfg.chains.clone())),
        approvals: Arc::new(cli_output::TerminalApprovals { yes }),
        events: Arc::new(TracingEvents),
        rpc: Arc::new(HttpRpcTransport::new(&cfg.rpc)?),
    };
    Ok(KeyRingService::new(keyring, collab, cfg.fee, cfg.rpc.backoff()))
}

/// Restore and unlock, prompting for the password. Fails unless the ring ends up unlocked.
async fn unlocked(svc: &KeyRingService) -> eyre::Result<()> {
    match svc.enable(&Env::internal()).await? {
        KeyRingStatus::Unlocked => Ok(()),
        KeyRingStatus::NotLoaded | KeyRingStatus::Empty | KeyRingStatus::Locked => {
            Err(KeyringError::Locked.into())
        }
    }
}

async fn run(cli: Cli, paths: &CustodianPaths) -> eyre::Result<()> {
    let svc = build_service(paths, cli.yes)?;
    match cli.cmd {
        Command::Paths => cli_output::print_json(&json!({
            "config_dir": paths.config_dir,
            "data_dir": paths.data_dir,
            "log_file": paths.log_file,
        })),
        Command::Status => {
            let status = svc.restore().await?;
            let key_stores = svc.multi_key_store_info().await?;
            cli_output::print_json(&json!({ "status": status, "key_stores": key_stores }))
        }
        Command::Create {
            name,
            mnemonic_stdin,
            words,
            path,
        } => {
            let (mnemonic, generated) = if mnemonic_stdin {
                (cli_output::read_stdin_secret()?, false)
            } else {
                (custodian::derive::generate_mnemonic(words)?, true)
            };
            let snapshot = if svc.restore().await? == KeyRingStatus::Empty {
                let password = cli_output::read_new_password(PASSWORD_ENV)?;
                svc.create_mnemonic_key(&mnemonic, &password, &name, path.into())
                    .await?
            } else {
                unlocked(&svc).await?;
                svc.add_mnemonic_key(&mnemonic, &name, path.into()).await?
            };
            let mut out = json!({ "ok": true, "keyring": snapshot });
            if generated {
                out["mnemonic"] = json!(mnemonic.as_str());
            }
            cli_output::print_json(&out)
        }
        Command::ImportKey { name } => {
            let hex_key = cli_output::read_stdin_secret()?;
            let key = custodian::derive::parse_private_key_hex(&hex_key)?;
            let snapshot = if svc.restore().await? == KeyRingStatus::Empty {
                let password = cli_output::read_new_password(PASSWORD_ENV)?;
                svc.create_private_key(&key, &password, &name).await?
            } else {
                unlocked(&svc).await?;
                svc.add_private_key(&key, &name).await?
            };
            cli_output::print_json(&json!({ "ok": true, "keyring": snapshot }))
        }
        Command::List => {
            svc.restore().await?;
            cli_output::print_json(&svc.multi_key_store_info().await?)
        }
        Command::Select { index } => {
            svc.restore().await?;
            let snapshot = svc.change_key_store_from_multi_key_store(index).await?;
            cli_output::print_json(&json!({ "ok": true, "keyring": snapshot }))
        }
        Command::Rename { index, name } => {
            svc.restore().await?;
            let key_stores = svc.update_name_key_ring(index, &name).await?;
            cli_output::print_json(&json!({ "ok": true, "key_stores": key_stores }))
        }
        Command::Show { index } => {
            unlocked(&svc).await?;
            let password = cli_output::read_password(PASSWORD_ENV, "Password: ")?;
            let secret = svc.show_key_ring(index, &password).await?;
            cli_output::print_line(&secret)
        }
        Command::Delete { index } => {
            svc.restore().await?;
            if !cli_output::confirm(&format!("Delete key store {index}?"), cli.yes)? {
                return Err(KeyringError::ApprovalRejected.into());
            }
            let password = cli_output::read_password(PASSWORD_ENV, "Password: ")?;
            let outcome = svc.delete_key_ring(index, &password).await?;
            cli_output::print_json(&json!({ "ok": true, "result": outcome }))
        }
        Command::Export => {
            svc.restore().await?;
            let password = cli_output::read_password(PASSWORD_ENV, "Password: ")?;
            let exported: Vec<_> = svc
                .export_key_ring_datas(&password)
                .await?
                .iter()
                .map(|e| {
                    json!({
                        "index": e.index,
                        "kind": e.kind,
                        "meta": e.meta,
                        "bip44_hd_path": e.bip44_hd_path,
                        "coin_type_for_chain": e.coin_type_for_chain,
                        "secret": e.secret.as_str(),
                    })
                })
                .collect();
            cli_output::print_json(&exported)
        }
        Command::ChangePassword => {
            svc.restore().await?;
            let current = cli_output::read_password(PASSWORD_ENV, "Current password: ")?;
            let next = cli_output::read_new_password(NEW_PASSWORD_ENV)?;
            svc.change_password(&current, &next).await?;
            cli_output::print_json(&json!({ "ok": true }))
        }
        Command::Address { chain } => {
            unlocked(&svc).await?;
            cli_output::print_json(&svc.get_key(&chain).await?)
        }
        Command::CoinType { chain, set } => {
            unlocked(&svc).await?;
            if let Some(coin_type) = set {
                let changed = svc.set_key_store_coin_type(&chain, coin_type).await?;
                return cli_output::print_json(&json!({ "ok": true, "changed": changed }));
            }
            let selectables = svc.get_key_store_bip44_selectables(&chain).await?;
            let is_set = svc.is_key_store_coin_type_set(&chain).await?;
            cli_output::print_json(&json!({ "is_set": is_set, "selectables": selectables }))
        }
        Command::SignArbitrary { chain, data } => {
            unlocked(&svc).await?;
            let signer = svc.get_key(&chain).await?.bech32_address;
            let resp = svc
                .request_sign_amino(
                    &Env::internal(),
                    AminoSignRequest {
                        chain_id: chain,
                        sign_doc: adr36::make_sign_doc(&signer, data.as_bytes()),
                        signer,
                        options: AminoSignOptions {
                            is_adr36_with_string: true,
                        },
                    },
                )
                .await?;
            cli_output::print_json(&resp)
        }
        Command::VerifyArbitrary {
            chain,
            signer,
            pub_key,
            signature,
            pub_key_type,
            data,
        } => {
            unlocked(&svc).await?;
            let sig = StdSignature {
                pub_key: PubKey {
                    kind: pub_key_type,
                    value: pub_key,
                },
                signature,
            };
            let verdict = svc
                .verify_adr36_amino_sign_doc_detailed(&chain, &signer, data.as_bytes(), &sig)
                .await?;
            cli_output::print_json(&json!({ "verdict": verdict }))
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = CustodianPaths::discover()?;
    paths.ensure_private_dirs().context("create data dir")?;
    let log_guard = init_logging(&paths);

    let json = cli.json;
    let result = run(cli, &paths).await;
    drop(log_guard);
    if let Err(e) = result {
        cli_output::print_error(&e, json);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
