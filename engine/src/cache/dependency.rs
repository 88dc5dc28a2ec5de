//! Content-addressed dependency cache
//!
//! Each entry lives in `<root>/<digest>/` with the installed tree under
//! `tree/` and its bookkeeping in `entry.json`. Entries are assembled in a
//! staging directory and renamed into place, so a reader never sees a
//! partially written tree.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::storage::settings::CacheSettings;
use crate::utils::hex;

const ENTRY_FILE: &str = "entry.json";
const TREE_DIR: &str = "tree";
const STAGING_PREFIX: &str = ".staging-";

/// Cache entry metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub digest: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Eviction bounds
#[derive(Debug, Clone)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl From<&CacheSettings> for CacheLimits {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            max_bytes: settings.max_bytes,
            max_age: Duration::from_secs(settings.max_age_secs),
        }
    }
}

/// Dependency trees keyed by manifest digest
pub struct DependencyCache {
    root: Dir,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl DependencyCache {
    /// Open the cache, dropping leftovers of interrupted writes
    pub async fn open(root: Dir) -> Result<Self, ShipyardError> {
        root.create().await?;

        let mut entries = HashMap::new();
        for path in root.list_dirs().await? {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let dir = Dir::new(&path);
            if name.starts_with(STAGING_PREFIX) {
                debug!("Removing stale cache staging directory {}", name);
                dir.delete().await?;
                continue;
            }
            match dir.file(ENTRY_FILE).read_json::<CacheEntry>().await {
                Ok(entry) if dir.subdir(TREE_DIR).exists().await => {
                    entries.insert(entry.digest.clone(), entry);
                }
                _ => {
                    warn!("Removing incomplete cache entry {}", name);
                    dir.delete().await?;
                }
            }
        }

        info!("Dependency cache opened with {} entries", entries.len());
        Ok(Self {
            root,
            entries: RwLock::new(entries),
        })
    }

    /// Look up an entry
    pub fn get(&self, digest: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by all entries
    pub fn total_bytes(&self) -> u64 {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.values().map(|e| e.size).sum()
    }

    /// Copy the cached tree for `digest` into `dest`.
    ///
    /// Returns `false` on a miss.
    pub async fn restore(&self, digest: &str, dest: &Path) -> Result<bool, ShipyardError> {
        if self.get(digest).is_none() {
            return Ok(false);
        }
        let entry_dir = self.root.subdir(digest);
        entry_dir.subdir(TREE_DIR).copy_to(dest).await?;

        let touched = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.get_mut(digest).map(|entry| {
                entry.last_used = Utc::now();
                entry.clone()
            })
        };
        if let Some(entry) = touched {
            // last_used only steers eviction
            if let Err(e) = entry_dir.file(ENTRY_FILE).write_json(&entry).await {
                debug!("Unable to record cache use of {}: {}", digest, e);
            }
        }
        Ok(true)
    }

    /// Store `source` under `digest`. A concurrent writer that finishes
    /// first wins; its tree is identical by construction.
    pub async fn put(&self, digest: &str, source: &Dir) -> Result<CacheEntry, ShipyardError> {
        if let Some(entry) = self.get(digest) {
            return Ok(entry);
        }

        let staging = self
            .root
            .subdir(&format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4().simple()));
        let result = self.stage_and_commit(digest, source, &staging).await;
        if result.is_err() {
            let _ = staging.delete().await;
        }
        result
    }

    async fn stage_and_commit(
        &self,
        digest: &str,
        source: &Dir,
        staging: &Dir,
    ) -> Result<CacheEntry, ShipyardError> {
        let size = source.copy_to(staging.subdir(TREE_DIR).path()).await?;
        let now = Utc::now();
        let entry = CacheEntry {
            digest: digest.to_string(),
            size,
            created_at: now,
            last_used: now,
        };
        staging.file(ENTRY_FILE).write_json(&entry).await?;

        let target = self.root.subdir(digest);
        if target.exists().await {
            staging.delete().await?;
            return self.adopt_existing(digest).await;
        }
        if let Err(e) = fs::rename(staging.path(), target.path()).await {
            if target.exists().await {
                staging.delete().await?;
                return self.adopt_existing(digest).await;
            }
            return Err(e.into());
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(digest.to_string(), entry.clone());
        debug!("Cached dependency tree {} ({} bytes)", digest, size);
        Ok(entry)
    }

    async fn adopt_existing(&self, digest: &str) -> Result<CacheEntry, ShipyardError> {
        let entry: CacheEntry = self
            .root
            .subdir(digest)
            .file(ENTRY_FILE)
            .read_json()
            .await?;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .entry(digest.to_string())
            .or_insert(entry)
            .clone())
    }

    /// Remove entries older than `max_age`, then least recently used entries
    /// until both the entry and byte limits hold. Returns evicted digests.
    pub async fn evict(&self, limits: &CacheLimits) -> Result<Vec<String>, ShipyardError> {
        let victims = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            select_victims(entries.values().cloned().collect(), limits, Utc::now())
        };

        for digest in &victims {
            {
                let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                entries.remove(digest);
            }
            self.root.subdir(digest).delete().await?;
        }

        if !victims.is_empty() {
            info!("Evicted {} dependency cache entries", victims.len());
        }
        Ok(victims)
    }
}

fn select_victims(mut entries: Vec<CacheEntry>, limits: &CacheLimits, now: DateTime<Utc>) -> Vec<String> {
    let max_age = chrono::Duration::from_std(limits.max_age).unwrap_or_else(|_| chrono::Duration::days(36500));
    entries.sort_by(|a, b| a.last_used.cmp(&b.last_used));

    let mut count = entries.len();
    let mut bytes: u64 = entries.iter().map(|e| e.size).sum();
    let mut victims = Vec::new();
    for entry in entries {
        let expired = now - entry.last_used > max_age;
        if expired || count > limits.max_entries || bytes > limits.max_bytes {
            count -= 1;
            bytes = bytes.saturating_sub(entry.size);
            victims.push(entry.digest);
        }
    }
    victims
}

/// Digest of the dependency manifests present in `dir`, taken in the given
/// order. Returns `None` when none of them exist.
pub async fn manifest_digest(dir: &Dir, names: &[String]) -> Result<Option<String>, ShipyardError> {
    let mut hasher = Sha256::new();
    let mut found = false;
    for name in names {
        let file = dir.file(name);
        if !file.exists().await {
            continue;
        }
        let contents = file.read_bytes().await?;
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
        found = true;
    }
    Ok(found.then(|| hex::encode(hasher.finalize())))
}
