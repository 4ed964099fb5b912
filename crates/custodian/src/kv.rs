//! Key/value persistence backing the key store collection.

use crate::errors::KeyringError;
use eyre::Context as _;
use fs2::FileExt as _;
use serde_json::{Map, Value};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> eyre::Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> eyre::Result<()>;
    fn remove(&self, key: &str) -> eyre::Result<()>;
}

/// One JSON document per namespace, rewritten atomically under an exclusive file lock.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: &Path, namespace: &str) -> eyre::Result<Self> {
        crate::fsutil::ensure_private_dir(dir)?;
        Ok(Self {
            path: dir.join(format!("{namespace}.json")),
            lock_path: dir.join(format!("{namespace}.lock")),
        })
    }

    fn read_all(&self) -> eyre::Result<Map<String, Value>> {
        let Some(s) = crate::fsutil::read_to_string_if_exists(&self.path)? else {
            return Ok(Map::new());
        };
        serde_json::from_str(&s).with_context(|| format!("parse {}", self.path.display()))
    }

    fn with_write_lock<T>(&self, f: impl FnOnce() -> eyre::Result<T>) -> eyre::Result<T> {
        let lock = crate::fsutil::open_lock_file(&self.lock_path)?;
        // Fail fast rather than blocking behind another process mid-write.
        match lock.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(KeyringError::KeystoreBusy.into());
            }
            Err(e) => return Err(eyre::Report::new(e).wrap_err("lock exclusive")),
        }
        let out = f();
        fs2::FileExt::unlock(&lock).context("unlock")?;
        out
    }

    fn update(&self, mutate: impl FnOnce(&mut Map<String, Value>)) -> eyre::Result<()> {
        self.with_write_lock(|| {
            let mut all = self.read_all()?;
            mutate(&mut all);
            crate::fsutil::write_json_atomic_restrictive(&self.path, &all)
                .with_context(|| format!("write {}", self.path.display()))
        })
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> eyre::Result<Option<Value>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> eyre::Result<()> {
        self.update(|all| {
            all.insert(key.to_owned(), value);
        })
    }

    fn remove(&self, key: &str) -> eyre::Result<()> {
        self.update(|all| {
            all.remove(key);
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    inner: Mutex<Map<String, Value>>,
}

impl MemoryKvStore {
    fn lock(&self) -> eyre::Result<std::sync::MutexGuard<'_, Map<String, Value>>> {
        self.inner
            .lock()
            .map_err(|e| eyre::eyre!("kv mutex poisoned: {e}"))
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> eyre::Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> eyre::Result<()> {
        self.lock()?.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> eyre::Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
}
