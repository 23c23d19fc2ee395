//! Content-addressed, TTL-scoped store for generation results.
//!
//! Entries are keyed by a fingerprint of `(phase, normalized input)` and kept
//! in two layers: an in-process map and one JSON file per entry under
//! `<dir>/<phase>/<key>.json`. The files survive restarts, so a re-run skips
//! calls that were already paid for.
//!
//! The store never fails its callers. Unreadable, torn or expired entries are
//! deleted and reported as a miss; failed writes are logged and dropped.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::atomic_write::write_file_atomic;
use crate::canonicalization::{Canonicalizer, emit_jcs, payload_checksum};
use crate::types::Phase;

/// Statistics for cache performance tracking
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub corruptions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate cache hit ratio
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
    corruptions: AtomicU64,
    expirations: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// One stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub phase: Phase,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    /// Milliseconds; zero means the entry never expires.
    pub ttl_ms: u64,
    /// BLAKE3 of the JCS form of `value`; a mismatch marks a torn write.
    pub checksum: String,
}

impl CacheEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_ms == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }

    fn is_intact(&self, key: &str, phase: Phase) -> bool {
        self.key == key
            && self.phase == phase
            && payload_checksum(&self.value).is_ok_and(|sum| sum == self.checksum)
    }
}

/// What [`CacheStore::invalidate`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Every entry of one phase.
    Phase(Phase),
    /// Everything.
    All,
    /// Only expired or unreadable entries.
    Expired,
}

/// On-disk footprint, per phase.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub phase1_entries: u64,
    pub phase2_entries: u64,
    pub bytes: u64,
}

/// Concurrency-safe cache store. Share it behind an `Arc`.
#[derive(Debug)]
pub struct CacheStore {
    dir: Utf8PathBuf,
    memory: Mutex<HashMap<String, CacheEntry>>,
    stats: AtomicStats,
    canonicalizer: Canonicalizer,
}

impl CacheStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let dir = dir.into();
        crate::paths::ensure_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {dir}"))?;
        debug!(cache_dir = %dir, "opened cache store");

        Ok(Self {
            dir,
            memory: Mutex::new(HashMap::new()),
            stats: AtomicStats::default(),
            canonicalizer: Canonicalizer::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Deterministic key for `(phase, input)`.
    #[must_use]
    pub fn key(&self, phase: Phase, input: &str) -> String {
        self.canonicalizer.fingerprint(phase, input)
    }

    fn entry_path(&self, phase: Phase, key: &str) -> Utf8PathBuf {
        self.dir.join(phase.as_str()).join(format!("{key}.json"))
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, phase: Phase, input: &str) -> Option<Value> {
        self.get_at(phase, input, Utc::now())
    }

    /// [`get`](Self::get) against an explicit clock.
    pub fn get_at(&self, phase: Phase, input: &str, now: DateTime<Utc>) -> Option<Value> {
        let key = self.key(phase, input);
        let path = self.entry_path(phase, &key);

        let remembered = self.memory().get(&key).cloned();
        if let Some(entry) = remembered {
            if entry.is_expired_at(now) {
                self.expire(&key, &path);
                return self.miss();
            }
            AtomicStats::bump(&self.stats.hits);
            return Some(entry.value);
        }

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.miss(),
            Err(e) => {
                warn!(path = %path, error = %e, "cache entry unreadable, discarding");
                self.discard_corrupt(&path);
                return self.miss();
            }
        };

        let entry = match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.is_intact(&key, phase) => entry,
            Ok(_) => {
                warn!(path = %path, "cache entry failed integrity check, discarding");
                self.discard_corrupt(&path);
                return self.miss();
            }
            Err(e) => {
                warn!(path = %path, error = %e, "cache entry malformed, discarding");
                self.discard_corrupt(&path);
                return self.miss();
            }
        };

        if entry.is_expired_at(now) {
            self.expire(&key, &path);
            return self.miss();
        }

        AtomicStats::bump(&self.stats.hits);
        let value = entry.value.clone();
        self.memory().insert(key, entry);
        Some(value)
    }

    /// Store `value`. Returns whether the entry reached disk.
    pub fn put(&self, phase: Phase, input: &str, value: &Value, ttl: Duration) -> bool {
        self.put_at(phase, input, value, ttl, Utc::now())
    }

    /// [`put`](Self::put) with an explicit creation time.
    pub fn put_at(
        &self,
        phase: Phase,
        input: &str,
        value: &Value,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) -> bool {
        let key = self.key(phase, input);
        let path = self.entry_path(phase, &key);

        let entry = match payload_checksum(value) {
            Ok(checksum) => CacheEntry {
                key: key.clone(),
                phase,
                value: value.clone(),
                created_at,
                ttl_ms: ttl_millis(ttl),
                checksum,
            },
            Err(e) => {
                warn!(error = %e, "cannot checksum value, not caching");
                return false;
            }
        };

        let written = emit_jcs(&entry).and_then(|json| write_file_atomic(&path, &json));
        self.memory().insert(key, entry);
        match written {
            Ok(_) => {
                AtomicStats::bump(&self.stats.writes);
                true
            }
            Err(e) => {
                warn!(path = %path, error = %e, "cache write failed, keeping entry in memory only");
                false
            }
        }
    }

    /// Remove entries. Returns how many were removed from disk.
    pub fn invalidate(&self, scope: Invalidation) -> usize {
        self.invalidate_at(scope, Utc::now())
    }

    pub fn invalidate_at(&self, scope: Invalidation, now: DateTime<Utc>) -> usize {
        let removed = match scope {
            Invalidation::Phase(phase) => {
                self.memory().retain(|_, e| e.phase != phase);
                self.remove_matching(phase, |_| true)
            }
            Invalidation::All => {
                self.memory().clear();
                Phase::all()
                    .into_iter()
                    .map(|phase| self.remove_matching(phase, |_| true))
                    .sum()
            }
            Invalidation::Expired => {
                self.memory().retain(|_, e| !e.is_expired_at(now));
                Phase::all()
                    .into_iter()
                    .map(|phase| {
                        self.remove_matching(phase, |raw| {
                            serde_json::from_str::<CacheEntry>(raw)
                                .map(|e| e.is_expired_at(now))
                                .unwrap_or(true)
                        })
                    })
                    .sum()
            }
        };
        self.stats
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(?scope, removed, "cache invalidated");
        removed
    }

    /// Count entries and bytes on disk.
    pub fn disk_usage(&self) -> Result<DiskUsage> {
        let mut usage = DiskUsage::default();
        for phase in Phase::all() {
            let dir = self.dir.join(phase.as_str());
            if !dir.exists() {
                continue;
            }
            for item in fs::read_dir(&dir).with_context(|| format!("Failed to list {dir}"))? {
                let item = item?;
                if !is_entry_file(&item.path()) {
                    continue;
                }
                usage.bytes += item.metadata()?.len();
                match phase {
                    Phase::Analyze => usage.phase1_entries += 1,
                    Phase::Enhance => usage.phase2_entries += 1,
                }
            }
        }
        Ok(usage)
    }

    fn remove_matching(&self, phase: Phase, should_remove: impl Fn(&str) -> bool) -> usize {
        let dir = self.dir.join(phase.as_str());
        let Ok(items) = fs::read_dir(&dir) else {
            return 0;
        };
        let mut removed = 0;
        for item in items.flatten() {
            let path = item.path();
            if !is_entry_file(&path) {
                continue;
            }
            let raw = fs::read_to_string(&path).unwrap_or_default();
            if should_remove(&raw) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    fn miss(&self) -> Option<Value> {
        AtomicStats::bump(&self.stats.misses);
        None
    }

    fn expire(&self, key: &str, path: &Utf8Path) {
        self.memory().remove(key);
        let _ = fs::remove_file(path);
        AtomicStats::bump(&self.stats.expirations);
        debug!(path = %path, "cache entry expired");
    }

    fn discard_corrupt(&self, path: &Utf8Path) {
        let _ = fs::remove_file(path);
        AtomicStats::bump(&self.stats.corruptions);
    }
}

/// Whole milliseconds, rounded up so a non-zero TTL never reads as "never expires".
fn ttl_millis(ttl: Duration) -> u64 {
    let ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 && !ttl.is_zero() { 1 } else { ms }
}

fn is_entry_file(path: &std::path::Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        let stats = self.stats.snapshot();
        if stats != CacheStats::default() {
            debug!(
                hits = stats.hits,
                misses = stats.misses,
                writes = stats.writes,
                corruptions = stats.corruptions,
                expirations = stats.expirations,
                hit_ratio = stats.hit_ratio(),
                "cache store closed"
            );
        }
    }
}
