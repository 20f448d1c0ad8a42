//! File-backed secret store.
//!
//! Lazily generates and persists random secret values in a flat
//! `KEY=VALUE` file. All access for a single call (read, generate, write)
//! happens under one lock, so concurrent callers never observe a
//! half-written file or two different generated values for the same key.
//! The file is rewritten in full on every mutation, never appended.

use crate::error::{Result, StackdError};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Characters a generated secret value may contain. Safe to embed in env
/// files and shell-adjacent contexts without quoting.
const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._+";

/// Length of a generated secret value.
const VALUE_LEN: usize = 24;

/// Concurrency-safe key/value store backed by a flat env file.
pub struct SecretStore {
    path: PathBuf,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl SecretStore {
    /// Create a store over the given env file, seeded from OS entropy.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_rng(path, Box::new(StdRng::from_entropy()))
    }

    /// Create a store with an injected randomness source (deterministic in
    /// tests).
    pub fn with_rng(path: impl AsRef<Path>, rng: Box<dyn RngCore + Send>) -> Self {
        Self { path: path.as_ref().to_path_buf(), rng: Mutex::new(rng) }
    }

    /// Return the value for `key`, generating and persisting a new one on
    /// first reference.
    pub async fn get_or_create(&self, key: &str) -> Result<String> {
        if key.trim().is_empty() {
            return Err(StackdError::InvalidKey);
        }

        // The rng lock doubles as the store lock: the whole
        // read-generate-write cycle is serialized under it.
        let mut rng = self.rng.lock().await;

        let mut entries = self.read_entries().await?;
        if let Some(value) = lookup(&entries, key) {
            return Ok(value.to_string());
        }

        let value = generate(rng.as_mut());
        entries.push((key.to_string(), value.clone()));
        self.write_entries(&entries).await?;
        debug!(key, "Generated new secret value");
        Ok(value)
    }

    /// Remove an entry. Returns whether the key was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        if key.trim().is_empty() {
            return Err(StackdError::InvalidKey);
        }

        let _rng = self.rng.lock().await;

        let mut entries = self.read_entries().await?;
        let before = entries.len();
        entries.retain(|(k, _)| k != key);
        if entries.len() == before {
            return Ok(false);
        }
        self.write_entries(&entries).await?;
        Ok(true)
    }

    /// Read all entries in file order. A missing file reads as empty.
    async fn read_entries(&self) -> Result<Vec<(String, String)>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StackdError::IoError { path: self.path.clone(), source: e }),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            entries.push((key.to_string(), unquote(value.trim()).to_string()));
        }
        Ok(entries)
    }

    /// Rewrite the whole file from the given entries.
    async fn write_entries(&self, entries: &[(String, String)]) -> Result<()> {
        let mut content = String::new();
        for (key, value) in entries {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| StackdError::IoError { path: self.path.clone(), source: e })
    }
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

/// Strip one layer of matching single or double quotes. Quotes are never
/// added back on write.
fn unquote(value: &str) -> &str {
    if value.len() > 1
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

fn generate(rng: &mut (dyn RngCore + Send)) -> String {
    (0..VALUE_LEN).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}
