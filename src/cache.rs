//! Persistent response cache over a key-value store.
//!
//! A run reads the whole map for its storage key once, mutates it in memory
//! and writes it back after every completed call. The stored shape is
//! `{prompt: ResponseObject | [ResponseObject, ...]}`; one element per
//! distinct (model, chat history, settings) identity of that prompt.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::gateway::Message;
use crate::response::ResponseObject;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("serialization error: {0}")]
    Serde(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cache serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// =============================================================================
// Key-value stores
// =============================================================================

/// Synchronous string-keyed JSON store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// SQLite-backed store: one row per key, values stored as JSON text.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS kv_store (\
               key TEXT PRIMARY KEY,\
               value TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("PROMPTGRID_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".promptgrid_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory lock for hosts that share one database across processes.
    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    /// Write every row as one JSON line, most recently updated first.
    pub fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, StoreError> {
        use std::io::Write;

        let path = path.as_ref().to_path_buf();
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, created_at, updated_at FROM kv_store ORDER BY updated_at DESC, key",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0;
            while let Some(row) = rows.next()? {
                let raw: String = row.get(1)?;
                let record = StoreExportRow {
                    key: row.get(0)?,
                    value: serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string()))?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                };
                let line =
                    serde_json::to_string(&record).map_err(|e| StoreError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
                written += 1;
            }
            file.flush()?;
            Ok(written)
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT value FROM kv_store WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            raw.map(|raw| serde_json::from_str(&raw).map_err(|e| StoreError::Serde(e.to_string())))
                .transpose()
        })
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value).map_err(|e| StoreError::Serde(e.to_string()))?;
        self.with_conn(|conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO kv_store (key, value, created_at, updated_at)\
                 VALUES (?1, ?2, ?3, ?4)\
                 ON CONFLICT(key) DO UPDATE SET \
                    value = excluded.value,\
                    updated_at = excluded.updated_at",
                params![key, raw, now, now],
            )?;
            Ok(())
        })
    }
}

#[derive(Debug, Serialize)]
pub struct StoreExportRow {
    pub key: String,
    pub value: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

// =============================================================================
// Cache map
// =============================================================================

/// In-memory view of one storage key: prompt text to the response objects
/// recorded for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMap {
    entries: BTreeMap<String, Vec<ResponseObject>>,
}

impl CacheMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of response objects across all prompts.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prompts(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, objs)| !objs.is_empty())
            .map(|(p, _)| p.as_str())
    }

    pub fn get(&self, prompt: &str) -> &[ResponseObject] {
        self.entries.get(prompt).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn get_or_default(&mut self, prompt: &str) -> &mut Vec<ResponseObject> {
        self.entries.entry(prompt.to_string()).or_default()
    }

    /// The object recorded for this (prompt, model, chat history, settings)
    /// identity.
    pub fn find(
        &self,
        prompt: &str,
        llm: &str,
        chat_history: Option<&[Message]>,
        settings_vars: &BTreeMap<String, String>,
    ) -> Option<&ResponseObject> {
        self.get(prompt)
            .iter()
            .find(|obj| obj.matches(llm, chat_history, settings_vars))
    }

    /// Replace the object with the same identity, or append a new one.
    pub fn upsert(&mut self, obj: ResponseObject) {
        let settings = obj.settings_vars();
        let slot = self.get_or_default(&obj.prompt);
        match slot
            .iter_mut()
            .find(|existing| existing.matches(&obj.llm, obj.chat_history.as_deref(), &settings))
        {
            Some(existing) => *existing = obj,
            None => slot.push(obj),
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut root = serde_json::Map::new();
        for (prompt, objs) in &self.entries {
            let value = match objs.as_slice() {
                [] => continue,
                [single] => serde_json::to_value(single)?,
                many => serde_json::to_value(many)?,
            };
            root.insert(prompt.clone(), value);
        }
        Ok(Value::Object(root))
    }
}

// =============================================================================
// Response cache
// =============================================================================

/// A store plus the key one run reads and writes. Without a key nothing is
/// loaded and nothing is persisted.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    storage_key: Option<String>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>, storage_key: Option<String>) -> Self {
        Self { store, storage_key }
    }

    /// Cache over a fresh [`MemoryStore`].
    pub fn in_memory(storage_key: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Some(storage_key.into()))
    }

    pub fn storage_key(&self) -> Option<&str> {
        self.storage_key.as_deref()
    }

    /// Load and heal the map stored under the storage key.
    pub fn load(&self) -> CacheMap {
        let Some(key) = self.storage_key.as_deref() else {
            return CacheMap::new();
        };
        match self.store.get(key) {
            Ok(Some(root)) => heal(key, root),
            Ok(None) => CacheMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, storage_key = key, "cache read failed; starting empty");
                CacheMap::new()
            }
        }
    }

    /// Overwrite the stored map. No-op without a storage key.
    pub fn store(&self, map: &CacheMap) -> Result<(), CacheError> {
        let Some(key) = self.storage_key.as_deref() else {
            return Ok(());
        };
        let value = map.to_value()?;
        self.store.set(key, &value)?;
        Ok(())
    }
}

fn heal(storage_key: &str, root: Value) -> CacheMap {
    let Value::Object(root) = root else {
        tracing::warn!(storage_key, "cached root is not an object; ignoring it");
        return CacheMap::new();
    };

    let mut map = CacheMap::new();
    for (prompt, entry) in root {
        let items = match entry {
            Value::Array(items) => items,
            obj @ Value::Object(_) => vec![obj],
            _ => {
                tracing::warn!(storage_key, prompt = %prompt, "dropping malformed cache entry");
                continue;
            }
        };

        let slot = map.get_or_default(&prompt);
        for (index, mut item) in items.into_iter().enumerate() {
            if let Value::Object(fields) = &mut item {
                let has_uid = fields
                    .get("uid")
                    .and_then(Value::as_str)
                    .is_some_and(|uid| !uid.is_empty());
                if !has_uid {
                    let uid = healed_uid(storage_key, &prompt, index);
                    fields.insert("uid".to_string(), Value::String(uid));
                }
            }
            match serde_json::from_value::<ResponseObject>(item) {
                Ok(obj) => slot.push(obj),
                Err(e) => {
                    tracing::warn!(error = %e, storage_key, prompt = %prompt, index, "dropping malformed cached response");
                }
            }
        }
    }
    map
}

fn healed_uid(storage_key: &str, prompt: &str, index: usize) -> String {
    let index = index.to_string();
    hash_fields(&[storage_key, prompt, &index])
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
