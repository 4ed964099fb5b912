use crate::{config::CustodianConfig, keystore::crypto::KdfAlgorithm, paths::CustodianPaths};
use eyre::Context as _;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

fn parse_kdf_env(s: &str) -> Option<KdfAlgorithm> {
    match s.trim().to_lowercase().as_str() {
        "scrypt" => Some(KdfAlgorithm::Scrypt),
        "sha256" => Some(KdfAlgorithm::Sha256),
        "pbkdf2" => Some(KdfAlgorithm::Pbkdf2),
        "argon2" | "argon2id" => Some(KdfAlgorithm::Argon2id),
        _ => None,
    }
}

/// Apply environment variable overrides to the loaded config.
fn apply_env_overrides(cfg: &mut CustodianConfig) {
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if !t.is_empty() {
                setter(t);
            }
        }
    }

    apply_env("CUSTODIAN_KDF", |v| {
        if let Some(kdf) = parse_kdf_env(v) {
            cfg.kdf = kdf;
        } else {
            tracing::warn!(value = v, "ignoring unknown CUSTODIAN_KDF");
        }
    });
    apply_env("CUSTODIAN_FALLBACK_GAS_LIMIT", |v| {
        let parsed = v.strip_prefix("0x").map_or_else(
            || v.parse::<u64>().ok(),
            |h| u64::from_str_radix(h, 16).ok(),
        );
        if let Some(n) = parsed.filter(|n| *n > 0) {
            cfg.fee.fallback_gas_limit = n;
        }
    });
}

impl ConfigStore {
    pub fn new(paths: &CustodianPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<CustodianConfig> {
        let Some(s) = crate::fsutil::read_to_string_if_exists(&self.path)? else {
            // Env overrides stay session-only.
            let mut cfg = CustodianConfig::default();
            self.save(&cfg)?;
            apply_env_overrides(&mut cfg);
            return Ok(cfg);
        };

        let mut cfg: CustodianConfig = toml::from_str(&s).context("parse config.toml")?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &CustodianConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_string_atomic_restrictive(&self.path, &s)
            .context("write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_load_writes_defaults() -> eyre::Result<()> {
        let cfg_dir = tempfile::tempdir()?;
        let data_dir = tempfile::tempdir()?;
        let paths = CustodianPaths::from_dirs(
            cfg_dir.path().to_path_buf(),
            data_dir.path().to_path_buf(),
        );
        let store = ConfigStore::new(&paths);
        let first = store.load_or_init_default()?;
        assert!(paths.config_file().exists());
        let second = store.load_or_init_default()?;
        assert_eq!(first.chains, second.chains);
        Ok(())
    }

    #[test]
    fn kdf_names_parse_case_insensitively() {
        assert_eq!(parse_kdf_env("SHA256"), Some(KdfAlgorithm::Sha256));
        assert_eq!(parse_kdf_env(" pbkdf2 "), Some(KdfAlgorithm::Pbkdf2));
        assert_eq!(parse_kdf_env("md5"), None);
    }
}
