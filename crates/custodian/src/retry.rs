//! Endpoint fallback for JSON-RPC calls.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Passes over the endpoint list. One pass tries every endpoint once.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// Pause after pass `round` has failed everywhere: `base * 2^round`, capped, plus jitter.
    fn pause_after(&self, round: usize) -> Duration {
        let shift = u32::try_from(round).unwrap_or(u32::MAX);
        let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        let pause = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter_max_ms == 0 {
            return pause;
        }
        let jitter = rand::random::<u64>() % self.jitter_max_ms.saturating_add(1).max(1);
        pause.saturating_add(Duration::from_millis(jitter))
    }
}

/// Run `call` against each endpoint in order until one succeeds, for up to `cfg.rounds`
/// passes with a backoff pause between passes.
///
/// An error for which `is_final` holds is returned at once; no other endpoint is tried.
pub async fn try_all_with_backoff<E, T, Fut>(
    endpoints: &[E],
    cfg: &BackoffConfig,
    mut call: impl FnMut(&E) -> Fut + Send,
    is_final: impl Fn(&eyre::Report) -> bool + Send,
    method: &'static str,
) -> eyre::Result<T>
where
    E: Sync,
    Fut: std::future::Future<Output = eyre::Result<T>> + Send,
{
    if endpoints.is_empty() {
        eyre::bail!("{method}: no endpoints configured");
    }
    if cfg.rounds == 0 {
        eyre::bail!("{method}: backoff rounds must be at least 1");
    }

    let mut last = None;
    for round in 0..cfg.rounds {
        if round > 0 {
            tokio::time::sleep(cfg.pause_after(round - 1)).await;
        }
        for endpoint in endpoints {
            let err = match call(endpoint).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if is_final(&err) {
                return Err(err.wrap_err(method));
            }
            tracing::debug!(round, error = %format!("{err:#}"), "{method} failed on one endpoint");
            last = Some(err);
        }
    }
    Err(last
        .unwrap_or_else(|| eyre::eyre!("no attempt was made"))
        .wrap_err(method))
}
