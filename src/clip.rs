//! Content-addressed prompt embedding cache.
//!
//! Prompts repeat heavily across a session, so each stage asks here before
//! touching the text encoder. A request with a cache path gets disk files
//! that survive restarts; an empty path falls back to a process-wide map.
//! No eviction: the set of prompts in one session is small.
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use crate::models::{ModelError, TextEncoder};
use crate::tensor::Embedding;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Encode(#[from] ModelError),
    #[error("Cache file '{path}' unusable: {source}")]
    Disk { path: PathBuf, source: io::Error },
    #[error("Cache file '{path}' is corrupt")]
    Corrupt { path: PathBuf },
}

/// FNV-1a, written out because cache keys must be stable across process
/// restarts and std's hasher does not promise that.
pub fn fingerprint(text: &str) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in text.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[derive(Debug, Default)]
pub struct ClipCache {
    /// Fallback disk directory for requests that name none.
    root: Option<PathBuf>,
    memory: Mutex<HashMap<String, Embedding>>,
}

impl ClipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the embedding for `(stage, prompt)`, encoding at most once per
    /// key. `cache` selects the disk directory; empty falls back to the
    /// configured root, or to process memory when there is none.
    pub fn encode(
        &self,
        stage: &str,
        prompt: &str,
        encoder: &dyn TextEncoder,
        cache: &str,
    ) -> Result<Embedding, CacheError> {
        let name = format!("{stage}-{:016x}.clip", fingerprint(prompt));
        let dir = if cache.is_empty() {
            self.root.as_deref()
        } else {
            Some(Path::new(cache))
        };
        let Some(dir) = dir else {
            {
                let memory = self.memory.lock().expect("clip cache poisoned");
                if let Some(hit) = memory.get(&name) {
                    return Ok(hit.clone());
                }
            }
            // encode outside the lock; a racing duplicate is harmless since
            // encoding is deterministic
            let encoded = encoder.encode(prompt)?;
            let mut memory = self.memory.lock().expect("clip cache poisoned");
            return Ok(memory.entry(name).or_insert(encoded).clone());
        };

        let path = dir.join(&name);
        match fs::read(&path) {
            Ok(bytes) => {
                return Embedding::from_bytes(&bytes).ok_or(CacheError::Corrupt { path });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(CacheError::Disk { path, source }),
        }
        let encoded = encoder.encode(prompt)?;
        fs::write(&path, encoded.to_bytes()).map_err(|source| CacheError::Disk {
            path: path.clone(),
            source,
        })?;
        debug!("cached embedding at '{}'", path.display());
        Ok(encoded)
    }
}
