use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::CacheError;

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS responses (
    cache_key TEXT PRIMARY KEY,
    type_tag TEXT NOT NULL,
    payload TEXT NOT NULL
);
";

/// The tag must be unique per type: two types sharing a tag share entries.
pub trait Cacheable: Serialize + DeserializeOwned {
    const TYPE_TAG: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_request<R: Cacheable>(request: &R) -> Result<Self, serde_json::Error> {
        let canonical = serde_jcs::to_string(request)?;
        let mut hasher = Sha256::new();
        hasher.update(R::TYPE_TAG.as_bytes());
        hasher.update(b"|");
        hasher.update(canonical.as_bytes());
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub type_tag: String,
    pub payload: String,
}

impl CachedPayload {
    pub fn encode<T: Cacheable>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_tag: T::TYPE_TAG.to_string(),
            payload: serde_json::to_string(value)?,
        })
    }

    /// Returns `None` when the stored tag belongs to a different type.
    pub fn decode<T: Cacheable>(&self) -> Option<Result<T, serde_json::Error>> {
        (self.type_tag == T::TYPE_TAG).then(|| serde_json::from_str(&self.payload))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub trait Cache: Send + Sync {
    fn lookup(&self, key: &CacheKey) -> Result<Option<CachedPayload>, CacheError>;
    fn store(&self, key: &CacheKey, payload: &CachedPayload) -> Result<(), CacheError>;

    fn record_lookup(&self, _hit: bool) {}

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

pub trait CacheExt: Cache {
    /// Anything that prevents caching falls back to calling `compute`.
    fn get_or_call<Req, Resp, E, F>(&self, request: &Req, compute: F) -> Result<Resp, E>
    where
        Req: Cacheable,
        Resp: Cacheable,
        F: FnOnce(&Req) -> Result<Resp, E>,
    {
        let key = match CacheKey::for_request(request) {
            Ok(key) => key,
            Err(err) => {
                debug!(request_type = Req::TYPE_TAG, error = %err, "Request is not cacheable");
                return compute(request);
            }
        };

        match self.lookup(&key) {
            Ok(Some(entry)) => match entry.decode::<Resp>() {
                Some(Ok(response)) => {
                    self.record_lookup(true);
                    return Ok(response);
                }
                Some(Err(err)) => {
                    warn!(key = key.as_str(), error = %err, "Discarding undecodable cache entry");
                }
                None => debug!(
                    key = key.as_str(),
                    stored = entry.type_tag.as_str(),
                    expected = Resp::TYPE_TAG,
                    "Cache entry holds a different response type"
                ),
            },
            Ok(None) => {}
            Err(err) => warn!(key = key.as_str(), error = %err, "Cache lookup failed"),
        }
        self.record_lookup(false);

        let response = compute(request)?;
        match CachedPayload::encode(&response) {
            Ok(payload) => {
                if let Err(err) = self.store(&key, &payload) {
                    warn!(key = key.as_str(), error = %err, "Cache write failed");
                }
            }
            Err(err) => {
                debug!(response_type = Resp::TYPE_TAG, error = %err, "Response is not cacheable");
            }
        }
        Ok(response)
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl Cache for NoCache {
    fn lookup(&self, _key: &CacheKey) -> Result<Option<CachedPayload>, CacheError> {
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _payload: &CachedPayload) -> Result<(), CacheError> {
        Ok(())
    }
}

pub struct SqliteCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SqliteCache {
    /// Opens (or creates) `<dir>/<identifier>.sqlite`.
    pub fn open(dir: &Path, identifier: &str) -> Result<Self, CacheError> {
        fs::create_dir_all(dir)?;
        let path = cache_file_path(dir, identifier);
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CACHE_SCHEMA)?;
        debug!(path = %path.display(), "Opened response cache");
        Ok(Self::from_connection(conn, Some(path)))
    }

    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Mutex::new(conn),
            path,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Removes every entry, returning how many were deleted.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(conn.execute("DELETE FROM responses", [])?)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Cache for SqliteCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<CachedPayload>, CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        let entry = conn
            .query_row(
                "SELECT type_tag, payload FROM responses WHERE cache_key = ?1",
                params![key.as_str()],
                |row| {
                    Ok(CachedPayload {
                        type_tag: row.get(0)?,
                        payload: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
        }
    }

    fn store(&self, key: &CacheKey, payload: &CachedPayload) -> Result<(), CacheError> {
        let conn = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO responses (cache_key, type_tag, payload) VALUES (?1, ?2, ?3)",
            params![key.as_str(), payload.type_tag, payload.payload],
        )?;
        Ok(())
    }
}

impl Drop for SqliteCache {
    fn drop(&mut self) {
        debug!(
            path = ?self.path,
            hits = self.hits(),
            misses = self.misses(),
            "Closing response cache"
        );
    }
}

pub fn open_scoped(
    cache_dir: Option<&Path>,
    scope: &str,
    identifier: &str,
) -> Result<Arc<dyn Cache>, CacheError> {
    match cache_dir {
        Some(dir) => Ok(Arc::new(SqliteCache::open(&dir.join(scope), identifier)?)),
        None => Ok(Arc::new(NoCache)),
    }
}

pub fn cache_file_path(dir: &Path, identifier: &str) -> PathBuf {
    dir.join(format!("{}.sqlite", file_stem(identifier)))
}

/// Identifiers made only of `[A-Za-z0-9._-]` are used as they are. Anything
/// else is cleaned and suffixed with a digest of the raw identifier, so two
/// identifiers never share a file.
fn file_stem(identifier: &str) -> String {
    let cleaned: String = identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let degenerate = cleaned.is_empty() || cleaned.chars().all(|c| c == '.');
    if cleaned == identifier && !degenerate {
        return cleaned;
    }
    let digest = format!("{:x}", Sha256::digest(identifier.as_bytes()));
    let base = if degenerate { "cache" } else { cleaned.as_str() };
    format!("{base}-{}", &digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_keep_their_name() {
        assert_eq!(file_stem("gpt-4o.mini_2"), "gpt-4o.mini_2");
    }

    #[test]
    fn cleaned_identifiers_never_collide() {
        let slash = file_stem("kw/x");
        assert!(slash.starts_with("kw_x-"), "{slash}");
        assert_ne!(slash, file_stem("kw_x"));
        assert_ne!(file_stem("kw x"), slash);
        assert!(file_stem("..").starts_with("cache-"));
        assert_ne!(file_stem(""), file_stem(".."));
        assert_eq!(file_stem(&slash), slash);
    }

    #[test]
    fn mismatched_tag_decodes_to_none() {
        #[derive(Serialize, serde::Deserialize)]
        struct A {
            value: u32,
        }
        impl Cacheable for A {
            const TYPE_TAG: &'static str = "test.A";
        }
        #[derive(Serialize, serde::Deserialize)]
        struct B {
            value: u32,
        }
        impl Cacheable for B {
            const TYPE_TAG: &'static str = "test.B";
        }

        let payload = CachedPayload::encode(&A { value: 3 }).unwrap();
        assert!(payload.decode::<B>().is_none());
        assert_eq!(payload.decode::<A>().unwrap().unwrap().value, 3);
    }
}
