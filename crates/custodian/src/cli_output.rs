//! Terminal I/O for the CLI: prompts and notices on stderr, results on stdout.

use custodian::{
    collab::{ApprovalInteraction, ApprovalRequest, ApprovalResponse, Env, EthereumApproval},
    errors::{ErrorBody, KeyringError},
};
use eyre::Context as _;
use secrecy::SecretString;
use std::io::{BufRead as _, IsTerminal as _, Read as _, Write as _};

pub const PASSWORD_ENV: &str = "CUSTODIAN_PASSWORD";
pub const NEW_PASSWORD_ENV: &str = "CUSTODIAN_NEW_PASSWORD";

fn stderr_write(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    let _flush = stderr.flush();
}

pub fn stderr_writeln(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    if stderr.write_all(b"\n").is_err() {
        return;
    }
    let _flush = stderr.flush();
}

pub fn print_json<T: serde::Serialize>(v: &T) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(v).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

pub fn print_line(s: &str) -> eyre::Result<()> {
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

/// Print a failure either as `{"ok":false,"error":{..}}` on stdout or as text on stderr.
pub fn print_error(report: &eyre::Report, json: bool) {
    if json {
        let body = ErrorBody::from_report(report);
        if print_json(&serde_json::json!({ "ok": false, "error": body })).is_err() {
            stderr_writeln(&format!("error: {report:#}"));
        }
    } else {
        stderr_writeln(&format!("error: {report:#}"));
    }
}

/// Password from `env_var` when set (headless use), otherwise an interactive prompt.
pub fn read_password(env_var: &str, prompt: &str) -> eyre::Result<SecretString> {
    if let Ok(pw) = std::env::var(env_var) {
        return Ok(SecretString::from(pw));
    }
    if !std::io::stdin().is_terminal() {
        eyre::bail!("no terminal to prompt for a password; set {env_var}");
    }
    let pw = rpassword::prompt_password(prompt).context("read password")?;
    Ok(SecretString::from(pw))
}

/// New password, asked twice when interactive.
pub fn read_new_password(env_var: &str) -> eyre::Result<SecretString> {
    if let Ok(pw) = std::env::var(env_var) {
        return Ok(SecretString::from(pw));
    }
    let first = read_password(env_var, "New password: ")?;
    let again = rpassword::prompt_password("Repeat password: ").context("read password")?;
    if secrecy::ExposeSecret::expose_secret(&first) != again {
        eyre::bail!("passwords do not match");
    }
    Ok(first)
}

/// Everything on stdin, trimmed. Used for mnemonics and private keys so they never hit argv.
pub fn read_stdin_secret() -> eyre::Result<zeroize::Zeroizing<String>> {
    let mut s = zeroize::Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_to_string(&mut s)
        .context("read stdin")?;
    Ok(zeroize::Zeroizing::new(s.trim().to_owned()))
}

/// Ask a yes/no question on stderr, or bail if there is no terminal and `yes` was not given.
pub fn confirm(question: &str, yes: bool) -> eyre::Result<bool> {
    if yes {
        return Ok(true);
    }
    let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if !interactive {
        eyre::bail!("refusing to approve non-interactively; pass --yes");
    }
    stderr_write(&format!("{question} [y/N] "));
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read confirmation")?;
    let ans = line.trim().to_ascii_lowercase();
    Ok(ans == "y" || ans == "yes")
}

/// Answers approval prompts from the terminal. Signed documents are approved unedited.
#[derive(Debug, Clone, Copy)]
pub struct TerminalApprovals {
    pub yes: bool,
}

impl TerminalApprovals {
    fn answer(self, request: ApprovalRequest) -> eyre::Result<ApprovalResponse> {
        if matches!(request, ApprovalRequest::Unlock) {
            let password = read_password(PASSWORD_ENV, "Password: ")?;
            return Ok(ApprovalResponse::Unlock {
                password: Some(password),
            });
        }

        let shown = serde_json::to_string_pretty(&request).context("render approval request")?;
        stderr_writeln(&shown);
        if !confirm("Approve this request?", self.yes)? {
            return Err(KeyringError::ApprovalRejected.into());
        }
        Ok(match request {
            ApprovalRequest::SignAmino { sign_doc, .. } => ApprovalResponse::Amino(sign_doc),
            ApprovalRequest::SignDirect { sign_doc_bytes, .. } => {
                ApprovalResponse::Direct(sign_doc_bytes)
            }
            ApprovalRequest::SignEthereum { .. } => {
                ApprovalResponse::Ethereum(EthereumApproval::default())
            }
            ApprovalRequest::Unlock
            | ApprovalRequest::SignEthereumTypedData { .. }
            | ApprovalRequest::ProxyDecrypt { .. }
            | ApprovalRequest::ProxyReEncrypt { .. } => ApprovalResponse::Approved,
        })
    }
}

#[async_trait::async_trait]
impl ApprovalInteraction for TerminalApprovals {
    async fn wait_approve(
        &self,
        env: &Env,
        route: &str,
        kind: &str,
        request: ApprovalRequest,
    ) -> eyre::Result<ApprovalResponse> {
        tracing::debug!(origin = %env.origin, route, kind, "approval requested");
        let this = *self;
        tokio::task::spawn_blocking(move || this.answer(request))
            .await
            .context("approval prompt task")?
    }
}
