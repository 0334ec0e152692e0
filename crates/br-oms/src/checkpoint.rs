//! Snapshot persistence.
//!
//! A [`CheckpointSink`] stores JSON records in named collections. Records are
//! addressed by an equality filter: a JSON object whose every field must be
//! present and equal in the record (`{"id": "..."}`, `{"status": "ACTIVE"}`).
//!
//! - [`MemoryCheckpoint`] keeps everything in process (tests, dry runs).
//! - [`LmdbCheckpoint`] keeps one LMDB entry per record, keyed by
//!   collection and record id.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use async_trait::async_trait;
use br_core::error::RelayError;
use heed::types::Str;
use heed::{Database, Env, EnvOpenOptions};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

/// Upsert/load contract for snapshot storage.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Replace the record matching `filter`, or insert `record`. Id-keyed
    /// sinks resolve the match through the `id` field.
    async fn upsert(&self, collection: &str, record: &Value, filter: &Value) -> Result<(), RelayError>;

    /// All records matching `filter`. [`MemoryCheckpoint`] keeps insertion
    /// order, [`LmdbCheckpoint`] returns them in id order.
    async fn load(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RelayError>;
}

/// Whether `record` satisfies an equality `filter`. `null` and `{}` match
/// everything.
pub fn matches_filter(record: &Value, filter: &Value) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(fields) => fields.iter().all(|(k, v)| record.get(k) == Some(v)),
        _ => false,
    }
}

fn upsert_into(records: &mut Vec<Value>, record: &Value, filter: &Value) {
    match records.iter_mut().find(|r| matches_filter(r, filter)) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    collections: Mutex<AHashMap<String, Vec<Value>>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpoint {
    async fn upsert(&self, collection: &str, record: &Value, filter: &Value) -> Result<(), RelayError> {
        let mut collections = self.collections.lock().await;
        upsert_into(collections.entry(collection.to_string()).or_default(), record, filter);
        Ok(())
    }

    async fn load(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RelayError> {
        let collections = self.collections.lock().await;
        Ok(collections
            .get(collection)
            .map(|records| records.iter().filter(|r| matches_filter(r, filter)).cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// LMDB
// ---------------------------------------------------------------------------

/// Map size reserved for the environment (1 GiB). LMDB only claims disk
/// space for pages actually written.
pub const MAP_SIZE_BYTES: usize = 1 << 30;
const RECORDS_DB: &str = "checkpoints";

/// LMDB-backed sink. Every record is stored under `<collection>/<id>`, so an
/// upsert writes one entry no matter how many records the collection holds.
///
/// Records are keyed by their string `id`: the filter's `id` when it has
/// one, otherwise the record's own.
#[derive(Clone)]
pub struct LmdbCheckpoint {
    path: PathBuf,
    env: Env,
    records: Database<Str, Str>,
}

impl LmdbCheckpoint {
    /// Open (or create) the environment in directory `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)
            .map_err(|e| RelayError::Checkpoint(format!("create {}: {e}", path.display())))?;

        // SAFETY: the environment is opened once per directory and the
        // files are not modified behind LMDB's back.
        let env = unsafe { EnvOpenOptions::new().map_size(MAP_SIZE_BYTES).max_dbs(4).open(&path) }
            .map_err(|e| lmdb_err("open environment", e))?;

        let mut wtxn = env.write_txn().map_err(|e| lmdb_err("begin schema transaction", e))?;
        let records = env
            .create_database(&mut wtxn, Some(RECORDS_DB))
            .map_err(|e| lmdb_err("open records database", e))?;
        wtxn.commit().map_err(|e| lmdb_err("commit schema", e))?;

        debug!("[checkpoint] opened {}", path.display());
        Ok(Self { path, env, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn record_key(collection: &str, record: &Value, filter: &Value) -> Result<String, RelayError> {
    let id = filter
        .get("id")
        .or_else(|| record.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Checkpoint(format!("{collection}: records need a string id")))?;
    Ok(format!("{collection}/{id}"))
}

fn lmdb_err(action: &str, err: heed::Error) -> RelayError {
    RelayError::Checkpoint(format!("lmdb: failed to {action}: {err}"))
}

fn join_err(err: tokio::task::JoinError) -> RelayError {
    RelayError::Checkpoint(format!("lmdb task: {err}"))
}

#[async_trait]
impl CheckpointSink for LmdbCheckpoint {
    async fn upsert(&self, collection: &str, record: &Value, filter: &Value) -> Result<(), RelayError> {
        let key = record_key(collection, record, filter)?;
        let body =
            serde_json::to_string(record).map_err(|e| RelayError::Checkpoint(format!("serialize: {e}")))?;
        let (env, db) = (self.env.clone(), self.records);

        tokio::task::spawn_blocking(move || -> heed::Result<()> {
            let mut wtxn = env.write_txn()?;
            db.put(&mut wtxn, &key, &body)?;
            wtxn.commit()
        })
        .await
        .map_err(join_err)?
        .map_err(|e| lmdb_err("upsert", e))
    }

    async fn load(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, RelayError> {
        let prefix = format!("{collection}/");
        let (env, db) = (self.env.clone(), self.records);

        let bodies = tokio::task::spawn_blocking(move || -> heed::Result<Vec<String>> {
            let rtxn = env.read_txn()?;
            let mut bodies = Vec::new();
            for entry in db.prefix_iter(&rtxn, &prefix)? {
                let (_, body) = entry?;
                bodies.push(body.to_owned());
            }
            Ok(bodies)
        })
        .await
        .map_err(join_err)?
        .map_err(|e| lmdb_err("load", e))?;

        let mut records = Vec::with_capacity(bodies.len());
        for body in bodies {
            let record: Value = serde_json::from_str(&body)
                .map_err(|e| RelayError::Checkpoint(format!("{collection}: corrupt record: {e}")))?;
            if matches_filter(&record, filter) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
