//! Content cache: URL → article body, URL + content hash → summary.
//!
//! Lookups never distinguish "absent" from "expired". Writes are last-write-wins;
//! entries are only removed by `clear()`.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::CacheEntry;

/// Article bodies rarely change within a day.
pub const BODY_TTL: Duration = Duration::from_secs(24 * 3600);
/// Summaries are keyed by content hash, so a week is safe.
pub const SUMMARY_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub fn body_key(url: &str) -> String {
    format!("body:{url}")
}

pub fn summary_key(url: &str, content_hash: &str) -> String {
    format!("summary:{url}#{content_hash}")
}

pub trait ContentCache: Send + Sync {
    /// `None` when the key is absent or older than `max_age`.
    fn get(&self, key: &str, max_age: Duration) -> Option<String>;
    fn put(&self, key: &str, value: &str);
    fn clear(&self);
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn is_fresh(entry: &CacheEntry, now: DateTime<Utc>, max_age: Duration) -> bool {
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return true;
    };
    now.signed_duration_since(entry.stored_at) <= max_age
}

/// Process-local cache.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Clock,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Use an explicit clock (tests).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Stored entry regardless of age.
    pub fn raw_entry(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentCache for MemoryCache {
    fn get(&self, key: &str, max_age: Duration) -> Option<String> {
        let now = (self.clock)();
        let map = self.entries.read().ok()?;
        map.get(key)
            .filter(|e| is_fresh(e, now, max_age))
            .map(|e| e.payload.clone())
    }

    fn put(&self, key: &str, value: &str) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload: value.to_string(),
            stored_at: (self.clock)(),
        };
        if let Ok(mut map) = self.entries.write() {
            map.insert(key.to_string(), entry);
        }
    }

    fn clear(&self) {
        if let Ok(mut map) = self.entries.write() {
            map.clear();
        }
    }
}

/// One JSON file per key under `dir`. Survives restarts; best-effort on I/O errors.
pub struct FileCache {
    dir: PathBuf,
    clock: Clock,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(Utc::now))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Clock) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "cache dir not created");
        }
        Self { dir, clock }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        cache_path(&self.dir, &file_key(key))
    }
}

fn file_key(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let mut file = fs::File::open(path).ok()?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).ok()?;
    serde_json::from_str(&buf).ok()
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique per write, so concurrent writers of one key never share a temp file.
fn tmp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()))
}

fn write_entry(path: &Path, entry: &CacheEntry) -> io::Result<()> {
    let tmp = tmp_path(path);
    let json = serde_json::to_vec(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    fs::rename(tmp, path)?;
    Ok(())
}

impl ContentCache for FileCache {
    fn get(&self, key: &str, max_age: Duration) -> Option<String> {
        let entry = read_entry(&self.path_for(key))?;
        // Guard against hash collisions.
        if entry.key != key {
            return None;
        }
        is_fresh(&entry, (self.clock)(), max_age).then_some(entry.payload)
    }

    fn put(&self, key: &str, value: &str) {
        let entry = CacheEntry {
            key: key.to_string(),
            payload: value.to_string(),
            stored_at: (self.clock)(),
        };
        if let Err(e) = write_entry(&self.path_for(key), &entry) {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    fn clear(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for e in entries.flatten() {
            let path = e.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                let _ = fs::remove_file(path);
            }
        }
    }
}
