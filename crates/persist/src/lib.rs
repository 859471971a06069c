//! relctl persistence: SQLite ledger of applied release revisions.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Revisions kept per release key; older rows are rotated out.
pub const DEFAULT_HISTORY: usize = 10;

/// A resource applied on behalf of a release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// One successful apply of a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub key: String,
    pub revision: u32,
    /// `metadata.uid` of the release that produced this revision.
    pub uid: String,
    /// Digest of the desired spec that was applied.
    pub digest: String,
    pub ts: i64,
    pub resources: Vec<ResourceRef>,
    pub manifests: String,
}

/// Resources an in-progress apply may have touched. Written before the first
/// apply and cleared when the revision is recorded, so a failed or interrupted
/// apply still leaves its resources discoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApply {
    pub key: String,
    pub uid: String,
    pub ts: i64,
    pub resources: Vec<ResourceRef>,
}

impl PendingApply {
    /// Resources of `self` followed by those of `other` not already listed.
    fn merged(mut self, other: PendingApply) -> PendingApply {
        for r in other.resources {
            if !self.resources.contains(&r) {
                self.resources.push(r);
            }
        }
        PendingApply { uid: other.uid, ts: other.ts, ..self }
    }
}

pub trait Ledger: Send + Sync {
    /// Store `rev` and clear any pending apply for its key.
    fn record(&self, rev: Revision) -> Result<()>;
    /// Note resources about to be applied. Merges with an earlier pending
    /// apply of the same key; the newest uid wins.
    fn begin(&self, pending: PendingApply) -> Result<()>;
    fn pending(&self, key: &str) -> Result<Option<PendingApply>>;
    fn latest(&self, key: &str) -> Result<Option<Revision>>;
    fn revision(&self, key: &str, revision: u32) -> Result<Option<Revision>>;
    /// All keys with a recorded revision or a pending apply, sorted.
    fn keys(&self) -> Result<Vec<String>>;
    /// Drop every revision and the pending apply of `key`; returns the number
    /// of rows removed.
    fn remove(&self, key: &str) -> Result<usize>;
}

/// SQLite-backed ledger. Simple, synchronous; calls are short.
pub struct SqliteLedger {
    db: Mutex<rusqlite::Connection>,
    history: usize,
}

impl SqliteLedger {
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_history(path, DEFAULT_HISTORY)
    }

    pub fn open_with_history(path: &str, history: usize) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS revisions (
                key       TEXT NOT NULL,
                revision  INTEGER NOT NULL,
                uid       TEXT NOT NULL,
                digest    TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                resources TEXT NOT NULL,
                manifests BLOB NOT NULL,
                PRIMARY KEY (key, revision)
            )",
            [],
        )
        .context("creating revisions table")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS pending (
                key       TEXT PRIMARY KEY,
                uid       TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                resources TEXT NOT NULL
            )",
            [],
        )
        .context("creating pending table")?;
        let me = Self { db: Mutex::new(db), history: history.max(1) };
        histogram!("relctl_ledger_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn row_to_revision(key: &str, row: &rusqlite::Row<'_>) -> Result<Revision> {
        let revision: u32 = row.get(0)?;
        let uid: String = row.get(1)?;
        let digest: String = row.get(2)?;
        let ts: i64 = row.get(3)?;
        let resources: String = row.get(4)?;
        let manifests: Vec<u8> = row.get(5)?;
        Ok(Revision {
            key: key.to_string(),
            revision,
            uid,
            digest,
            ts,
            resources: serde_json::from_str(&resources).context("decoding resource refs")?,
            manifests: maybe_decompress(&manifests),
        })
    }

    fn query_one(&self, key: &str, sql: &str, revision: Option<u32>) -> Result<Option<Revision>> {
        let db = self.conn();
        let mut stmt = db.prepare(sql)?;
        let mut rows = match revision {
            Some(r) => stmt.query((key, r))?,
            None => stmt.query([key])?,
        };
        let found = match rows.next()? {
            Some(row) => Some(Self::row_to_revision(key, row)?),
            None => None,
        };
        Ok(found)
    }
}

impl Ledger for SqliteLedger {
    fn record(&self, rev: Revision) -> Result<()> {
        let started = std::time::Instant::now();
        let resources = serde_json::to_string(&rev.resources).context("encoding resource refs")?;
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM pending WHERE key = ?1", [&rev.key])?;
        tx.execute(
            "INSERT OR REPLACE INTO revisions(key, revision, uid, digest, ts, resources, manifests)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (&rev.key, rev.revision, &rev.uid, &rev.digest, rev.ts, &resources, maybe_compress(&rev.manifests)),
        )?;
        // Keep the latest N revisions per key
        tx.execute(
            "DELETE FROM revisions
             WHERE key = ?1
               AND revision NOT IN (
                   SELECT revision FROM revisions WHERE key = ?1 ORDER BY revision DESC LIMIT ?2
               )",
            (&rev.key, self.history as i64),
        )?;
        tx.commit()?;
        histogram!("relctl_ledger_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("relctl_ledger_put_total", 1u64);
        debug!(key = %rev.key, revision = rev.revision, "ledger revision recorded");
        Ok(())
    }

    fn begin(&self, pending: PendingApply) -> Result<()> {
        let merged = match self.pending(&pending.key)? {
            Some(prev) => prev.merged(pending),
            None => pending,
        };
        let resources = serde_json::to_string(&merged.resources).context("encoding resource refs")?;
        self.conn().execute(
            "INSERT OR REPLACE INTO pending(key, uid, ts, resources) VALUES (?1, ?2, ?3, ?4)",
            (&merged.key, &merged.uid, merged.ts, &resources),
        )?;
        debug!(key = %merged.key, resources = merged.resources.len(), "pending apply noted");
        Ok(())
    }

    fn pending(&self, key: &str) -> Result<Option<PendingApply>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT uid, ts, resources FROM pending WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let Some(row) = rows.next()? else { return Ok(None) };
        let resources: String = row.get(2)?;
        let found = PendingApply {
            key: key.to_string(),
            uid: row.get(0)?,
            ts: row.get(1)?,
            resources: serde_json::from_str(&resources).context("decoding resource refs")?,
        };
        Ok(Some(found))
    }

    fn latest(&self, key: &str) -> Result<Option<Revision>> {
        self.query_one(
            key,
            "SELECT revision, uid, digest, ts, resources, manifests FROM revisions
             WHERE key = ?1 ORDER BY revision DESC LIMIT 1",
            None,
        )
    }

    fn revision(&self, key: &str, revision: u32) -> Result<Option<Revision>> {
        self.query_one(
            key,
            "SELECT revision, uid, digest, ts, resources, manifests FROM revisions
             WHERE key = ?1 AND revision = ?2",
            Some(revision),
        )
    }

    fn keys(&self) -> Result<Vec<String>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT key FROM revisions UNION SELECT key FROM pending ORDER BY key")?;
        let mut rows = stmt.query([])?;
        let mut out: Vec<String> = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row.get(0)?);
        }
        Ok(out)
    }

    fn remove(&self, key: &str) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let n = tx.execute("DELETE FROM revisions WHERE key = ?1", [key])?
            + tx.execute("DELETE FROM pending WHERE key = ?1", [key])?;
        tx.commit()?;
        counter!("relctl_ledger_remove_total", 1u64);
        Ok(n)
    }
}

/// In-memory ledger with the same rotation rules; no persistence.
pub struct MemoryLedger {
    revs: Mutex<BTreeMap<String, BTreeMap<u32, Revision>>>,
    pending: Mutex<BTreeMap<String, PendingApply>>,
    history: usize,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self { revs: Mutex::new(BTreeMap::new()), pending: Mutex::new(BTreeMap::new()), history: DEFAULT_HISTORY }
    }
}

impl MemoryLedger {
    pub fn new() -> Self { Self::default() }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, BTreeMap<u32, Revision>>> {
        self.revs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn pending_map(&self) -> MutexGuard<'_, BTreeMap<String, PendingApply>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Ledger for MemoryLedger {
    fn record(&self, rev: Revision) -> Result<()> {
        self.pending_map().remove(&rev.key);
        let mut map = self.map();
        let entry = map.entry(rev.key.clone()).or_default();
        entry.insert(rev.revision, rev);
        while entry.len() > self.history {
            entry.pop_first();
        }
        Ok(())
    }

    fn begin(&self, pending: PendingApply) -> Result<()> {
        let mut map = self.pending_map();
        let merged = match map.remove(&pending.key) {
            Some(prev) => prev.merged(pending),
            None => pending,
        };
        map.insert(merged.key.clone(), merged);
        Ok(())
    }

    fn pending(&self, key: &str) -> Result<Option<PendingApply>> { Ok(self.pending_map().get(key).cloned()) }

    fn latest(&self, key: &str) -> Result<Option<Revision>> {
        Ok(self.map().get(key).and_then(|e| e.values().next_back().cloned()))
    }

    fn revision(&self, key: &str, revision: u32) -> Result<Option<Revision>> {
        Ok(self.map().get(key).and_then(|e| e.get(&revision).cloned()))
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.map().keys().cloned().collect();
        keys.extend(self.pending_map().keys().cloned());
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn remove(&self, key: &str) -> Result<usize> {
        let revs = self.map().remove(key).map(|e| e.len()).unwrap_or(0);
        Ok(revs + usize::from(self.pending_map().remove(key).is_some()))
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".relctl");
        let _ = std::fs::create_dir_all(&p);
        p.push("ledger.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "relctl-ledger.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("RELCTL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
