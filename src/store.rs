//! Durable scheduler state keyed by strategy identifier.
//!
//! Every backend stores one [`SchedulerState`] per strategy id and follows a
//! read-modify-atomic-write discipline: a save either fully replaces the
//! previous record or leaves it untouched. Any record that cannot be read
//! back is reported as [`BacktestError::CorruptState`].

use crate::error::{BacktestError, Result};
use crate::scheduler::SchedulerState;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Persistence backend for scheduler state.
pub trait StateStore: Send + Sync {
    /// Load the state for `strategy_id`, `None` if nothing was saved.
    fn load(&self, strategy_id: &str) -> Result<Option<SchedulerState>>;

    /// Replace the stored state for `state.strategy_id`.
    fn save(&self, state: &SchedulerState) -> Result<()>;

    fn delete(&self, strategy_id: &str) -> Result<()>;
}

fn corrupt(strategy_id: &str, reason: impl ToString) -> BacktestError {
    BacktestError::CorruptState {
        strategy_id: strategy_id.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a serialized record and check it belongs to `strategy_id`.
fn decode(strategy_id: &str, raw: &str) -> Result<SchedulerState> {
    let state: SchedulerState = serde_json::from_str(raw).map_err(|e| corrupt(strategy_id, e))?;
    state.check(strategy_id)?;
    Ok(state)
}

/// In-process store holding serialized records.
///
/// Records are kept as JSON text so that the same decode path (and the same
/// corruption handling) applies as for the durable backends.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text for an id, bypassing serialization.
    pub fn put_raw(&self, strategy_id: impl Into<String>, raw: impl Into<String>) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strategy_id.into(), raw.into());
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, strategy_id: &str) -> Result<Option<SchedulerState>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(strategy_id).map(|raw| decode(strategy_id, raw)).transpose()
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        self.put_raw(state.strategy_id.clone(), raw);
        Ok(())
    }

    fn delete(&self, strategy_id: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(strategy_id);
        Ok(())
    }
}

/// One JSON document per strategy id inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    dir: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Opened JSON state store at {}", dir.display());
        Ok(Self { dir })
    }

    /// File path for a strategy id. Bytes outside `[A-Za-z0-9_-]` are
    /// percent-encoded so distinct ids never share a file.
    pub fn path_for(&self, strategy_id: &str) -> PathBuf {
        let mut name = String::with_capacity(strategy_id.len());
        for b in strategy_id.bytes() {
            if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
                name.push(char::from(b));
            } else {
                name.push_str(&format!("%{:02X}", b));
            }
        }
        self.dir.join(format!("{}.json", name))
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self, strategy_id: &str) -> Result<Option<SchedulerState>> {
        let path = self.path_for(strategy_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|e| corrupt(strategy_id, e))?;
        decode(strategy_id, &raw).map(Some)
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        let path = self.path_for(&state.strategy_id);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(state)?;

        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;

        debug!("Saved scheduler state for {} to {}", state.strategy_id, path.display());
        Ok(())
    }

    fn delete(&self, strategy_id: &str) -> Result<()> {
        let path = self.path_for(strategy_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// SQLite-backed store, one row per strategy id.
pub struct SqliteStateStore {
    db_path: String,
}

impl SqliteStateStore {
    /// Create or open a store at the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().display().to_string();
        let conn = Connection::open(&db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS scheduler_state (
                strategy_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        info!("Opened scheduler state store at {}", db_path);
        Ok(Self { db_path })
    }

    fn connect(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    /// All strategy ids with a stored record, sorted.
    pub fn strategy_ids(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT strategy_id FROM scheduler_state ORDER BY strategy_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

impl StateStore for SqliteStateStore {
    fn load(&self, strategy_id: &str) -> Result<Option<SchedulerState>> {
        let conn = self.connect()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT state_json FROM scheduler_state WHERE strategy_id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| corrupt(strategy_id, e))?;

        raw.map(|r| decode(strategy_id, &r)).transpose()
    }

    fn save(&self, state: &SchedulerState) -> Result<()> {
        let raw = serde_json::to_string(state)?;
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO scheduler_state (strategy_id, state_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![state.strategy_id, raw, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        debug!("Saved scheduler state for {}", state.strategy_id);
        Ok(())
    }

    fn delete(&self, strategy_id: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM scheduler_state WHERE strategy_id = ?1",
            params![strategy_id],
        )?;
        Ok(())
    }
}
