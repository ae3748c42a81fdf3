//! Durable store: three entity tables with fetch/insert/delete/save primitives.
//!
//! Reads always see pending (unsaved) changes, so duplicates inserted earlier in the same
//! unflushed batch are visible to the pruning pass. `save` commits everything pending.

use crate::color::PieceColor;
use crate::progress::{Account, LevelProgress, UnlockSelection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row<T> {
    pub row_id: u64,
    pub value: T,
}

/// All persisted rows. This is also the on-disk JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tables {
    pub levels: Vec<Row<LevelProgress>>,
    pub accounts: Vec<Row<Account>>,
    pub unlocks: Vec<Row<UnlockSelection>>,
    next_row_id: u64,
}

/// A persisted entity type and how its rows are keyed.
pub trait Entity: Clone + Debug {
    type Key: Eq + Hash + Clone + Debug;
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
    fn updated_at(&self) -> DateTime<Utc>;
    fn rows(tables: &Tables) -> &Vec<Row<Self>>;
    fn rows_mut(tables: &mut Tables) -> &mut Vec<Row<Self>>;
}

impl Entity for LevelProgress {
    type Key = u32;
    const KIND: &'static str = "level";

    fn key(&self) -> u32 {
        self.level_number
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn rows(tables: &Tables) -> &Vec<Row<Self>> {
        &tables.levels
    }
    fn rows_mut(tables: &mut Tables) -> &mut Vec<Row<Self>> {
        &mut tables.levels
    }
}

impl Entity for Account {
    type Key = String;
    const KIND: &'static str = "account";

    fn key(&self) -> String {
        self.id.clone()
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn rows(tables: &Tables) -> &Vec<Row<Self>> {
        &tables.accounts
    }
    fn rows_mut(tables: &mut Tables) -> &mut Vec<Row<Self>> {
        &mut tables.accounts
    }
}

impl Entity for UnlockSelection {
    type Key = PieceColor;
    const KIND: &'static str = "unlock";

    fn key(&self) -> PieceColor {
        self.color
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn rows(tables: &Tables) -> &Vec<Row<Self>> {
        &tables.unlocks
    }
    fn rows_mut(tables: &mut Tables) -> &mut Vec<Row<Self>> {
        &mut tables.unlocks
    }
}

/// Most authoritative first: latest `updated_at`, then latest row id.
fn rank<E: Entity>(row: &Row<E>) -> (DateTime<Utc>, u64) {
    (row.value.updated_at(), row.row_id)
}

impl Tables {
    pub fn fetch<E: Entity>(&self, pred: impl Fn(&E) -> bool) -> Vec<&Row<E>> {
        E::rows(self).iter().filter(|r| pred(&r.value)).collect()
    }

    /// Most authoritative row for `key`.
    pub fn fetch_one<E: Entity>(&self, key: &E::Key) -> Option<&E> {
        self.fetch::<E>(|v| &v.key() == key)
            .into_iter()
            .max_by_key(|r| rank(r))
            .map(|r| &r.value)
    }

    pub fn all<E: Entity>(&self) -> Vec<E> {
        E::rows(self).iter().map(|r| r.value.clone()).collect()
    }

    pub fn insert<E: Entity>(&mut self, value: E) -> u64 {
        self.next_row_id += 1;
        let row_id = self.next_row_id;
        E::rows_mut(self).push(Row { row_id, value });
        row_id
    }

    pub fn delete<E: Entity>(&mut self, row_id: u64) -> bool {
        let rows = E::rows_mut(self);
        let before = rows.len();
        rows.retain(|r| r.row_id != row_id);
        rows.len() != before
    }

    /// Re-fetch the row for this key and overwrite it, or insert if absent.
    pub fn upsert<E: Entity>(&mut self, value: E) {
        let key = value.key();
        let existing = self
            .fetch::<E>(|v| v.key() == key)
            .into_iter()
            .max_by_key(|r| rank(r))
            .map(|r| r.row_id);
        match existing {
            Some(row_id) => {
                if let Some(row) = E::rows_mut(self).iter_mut().find(|r| r.row_id == row_id) {
                    row.value = value;
                }
            }
            None => {
                self.insert(value);
            }
        }
    }

    /// Delete every row but the most authoritative one per key. Returns rows deleted.
    pub fn prune<E: Entity>(&mut self) -> usize {
        let mut keep: HashMap<E::Key, (DateTime<Utc>, u64)> = HashMap::new();
        for row in E::rows(self) {
            let r = rank(row);
            keep.entry(row.value.key())
                .and_modify(|best| *best = (*best).max(r))
                .or_insert(r);
        }
        let losers: Vec<u64> = E::rows(self)
            .iter()
            .filter(|row| keep.get(&row.value.key()).is_some_and(|best| best.1 != row.row_id))
            .map(|row| row.row_id)
            .collect();
        let deleted = losers.iter().filter(|&&id| self.delete::<E>(id)).count();
        if deleted > 0 {
            log::info!("pruned {deleted} duplicate {} row(s)", E::KIND);
        }
        deleted
    }

    pub fn clear(&mut self) {
        self.levels.clear();
        self.accounts.clear();
        self.unlocks.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub levels: usize,
    pub accounts: usize,
    pub unlocks: usize,
}

impl PruneReport {
    pub const fn total(&self) -> usize {
        self.levels + self.accounts + self.unlocks
    }
}

/// Backing store owned by the persistence worker.
pub trait Store: Send {
    /// Current tables, including pending changes.
    fn tables(&self) -> &Tables;
    fn tables_mut(&mut self) -> &mut Tables;
    /// Commit pending changes.
    fn save(&mut self) -> Result<(), StoreError>;
}

/// Upsert one entity and commit. Each entity write is its own fetch-modify-save cycle.
pub fn write_entity<S: Store + ?Sized, E: Entity>(store: &mut S, value: E) -> Result<(), StoreError> {
    store.tables_mut().upsert(value);
    store.save()
}

/// Prune duplicates in all three tables; saves only if something was deleted.
pub fn prune_duplicates<S: Store + ?Sized>(store: &mut S) -> Result<PruneReport, StoreError> {
    let tables = store.tables_mut();
    let report = PruneReport {
        levels: tables.prune::<LevelProgress>(),
        accounts: tables.prune::<Account>(),
        unlocks: tables.prune::<UnlockSelection>(),
    };
    if report.total() > 0 {
        store.save()?;
    }
    Ok(report)
}

/// Save file on disk. Commits write a sibling temp file and rename it over the original.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    tables: Tables,
}

impl JsonStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match fs::read_to_string(&path) {
            Ok(s) if s.trim().is_empty() => Tables::default(),
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        log::info!(
            "opened save {} ({} level, {} account, {} unlock rows)",
            path.display(),
            tables.levels.len(),
            tables.accounts.len(),
            tables.unlocks.len()
        );
        Ok(Self { path, tables })
    }
}

impl Store for JsonStore {
    fn tables(&self) -> &Tables {
        &self.tables
    }

    fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }

    fn save(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&self.tables)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
#[cfg_attr(not(test), allow(dead_code))]
struct Committed {
    tables: Tables,
    saves: usize,
    fail_saves: bool,
}

/// In-memory store, used when the save file is unusable. Committed state is shared with any [`MemoryProbe`] taken from it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Tables,
    committed: Arc<Mutex<Committed>>,
}

/// Read-only view of what a [`MemoryStore`] has committed, usable from another thread.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MemoryProbe(Arc<Mutex<Committed>>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from pre-existing committed tables.
    #[cfg(test)]
    pub fn with_tables(tables: Tables) -> Self {
        let store = Self::default();
        store.committed.lock().unwrap_or_else(PoisonError::into_inner).tables = tables.clone();
        Self { tables, ..store }
    }

    #[cfg(test)]
    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe(Arc::clone(&self.committed))
    }
}

#[cfg(test)]
impl MemoryProbe {
    pub fn tables(&self) -> Tables {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).tables.clone()
    }

    pub fn saves(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).saves
    }

    /// Make every following save fail, as a full disk would.
    pub fn set_failing(&self, failing: bool) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).fail_saves = failing;
    }
}

impl Store for MemoryStore {
    fn tables(&self) -> &Tables {
        &self.tables
    }

    fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }

    fn save(&mut self) -> Result<(), StoreError> {
        let mut committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        if committed.fail_saves {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        committed.tables = self.tables.clone();
        committed.saves += 1;
        Ok(())
    }
}
