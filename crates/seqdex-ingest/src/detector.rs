//! Detection of identifiers already seen during a job
//!
//! Identifiers are kept in a hash set until it grows past `max_in_memory` or
//! its estimated footprint leaves less than 10% of the memory budget free.
//! At that point the set is written to a scratch SQLite file in a single
//! transaction and cleared. Membership checks consult both the set and the
//! scratch store.
//!
//! If the scratch store cannot be written the detector logs a warning and
//! carries on with the in-memory set alone.

use crate::error::DetectorError;
use crate::memory::{string_footprint, MemoryBudget};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Limits for the in-memory part of the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Identifiers held in memory before spilling to disk
    pub max_in_memory: usize,
    pub memory_budget: MemoryBudget,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_in_memory: 5_000_000,
            memory_budget: MemoryBudget::from_megabytes(512),
        }
    }
}

/// Result of adding an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    New,
    Duplicate,
}

#[derive(Default)]
struct DetectorState {
    memory: HashSet<String>,
    memory_bytes: u64,
    store: Option<Connection>,
    degraded: bool,
    since_sample: usize,
    used: bool,
    time_in_add: Duration,
    spills: u64,
}

/// Hybrid memory/disk set of identifiers seen so far
pub struct UniqueIdDetector {
    store_path: PathBuf,
    config: DetectorConfig,
    state: Mutex<DetectorState>,
}

impl UniqueIdDetector {
    /// Create the detector and its scratch store at `store_path`
    ///
    /// Any previous store at that path is discarded.
    pub fn open(store_path: impl Into<PathBuf>, config: DetectorConfig) -> Result<Self, DetectorError> {
        let store_path = store_path.into();
        remove_store(&store_path)?;
        let store = open_store(&store_path)?;

        debug!(
            store = %store_path.display(),
            max_in_memory = config.max_in_memory,
            "Opened unique identifier detector"
        );

        Ok(Self {
            store_path,
            config,
            state: Mutex::new(DetectorState {
                store: Some(store),
                ..DetectorState::default()
            }),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// Record `id`, reporting whether it had been seen before
    pub fn add(&self, id: &str) -> Membership {
        let started = Instant::now();
        let max = self.config.max_in_memory;
        let mut state = self.lock();
        state.used = true;
        if state.store.is_none() && !state.degraded {
            match open_store(&self.store_path) {
                Ok(store) => {
                    debug!(store = %self.store_path.display(), "Reattached identifier store");
                    state.store = Some(store);
                }
                Err(e) => degrade(&mut state, &self.store_path, &e),
            }
        }

        let mut duplicate = false;
        if state.memory.len() <= max || state.degraded {
            if state.memory.insert(id.to_string()) {
                state.memory_bytes += string_footprint(id);
            } else {
                duplicate = true;
            }
        }

        if !duplicate {
            let lookup = state.store.as_ref().map(|store| store_contains(store, id));
            match lookup {
                Some(Ok(found)) => duplicate = found,
                Some(Err(e)) => degrade(&mut state, &self.store_path, &e),
                None => {}
            }
        }

        state.since_sample += 1;
        if state.since_sample >= (max / 10).max(1) {
            state.since_sample = 0;
            if self.config.memory_budget.is_low(state.memory_bytes) {
                debug!(
                    in_memory = state.memory.len(),
                    bytes = state.memory_bytes,
                    "Identifier set near its memory budget"
                );
                spill(&mut state, &self.store_path);
            }
        }

        if state.memory.len() > max {
            spill(&mut state, &self.store_path);
        }

        state.time_in_add += started.elapsed();
        if duplicate {
            Membership::Duplicate
        } else {
            Membership::New
        }
    }

    /// Write the in-memory set to the scratch store now
    pub fn flush(&self) {
        let mut state = self.lock();
        spill(&mut state, &self.store_path);
    }

    /// Flush and release the scratch store handle
    ///
    /// Identifiers stay known: the next [`add`](Self::add) or
    /// [`reopen`](Self::reopen) reattaches the store.
    pub fn close(&self) {
        let mut state = self.lock();
        spill(&mut state, &self.store_path);
        if state.store.take().is_some() {
            debug!(store = %self.store_path.display(), "Closed identifier store");
        }
    }

    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.store.is_none() && !state.degraded
    }

    /// Reattach the scratch store after [`close`](Self::close)
    pub fn reopen(&self) -> Result<(), DetectorError> {
        let mut state = self.lock();
        if state.store.is_none() && !state.degraded {
            state.store = Some(open_store(&self.store_path)?);
        }
        Ok(())
    }

    /// Forget every identifier and start from an empty store
    pub fn reset(&self) -> Result<(), DetectorError> {
        let mut state = self.lock();
        state.store = None;
        remove_store(&self.store_path)?;
        *state = DetectorState {
            store: Some(open_store(&self.store_path)?),
            ..DetectorState::default()
        };
        Ok(())
    }

    /// Close the store and delete its file
    pub fn destroy(&self) -> Result<(), DetectorError> {
        let mut state = self.lock();
        state.store = None;
        state.memory.clear();
        state.memory_bytes = 0;
        remove_store(&self.store_path)?;
        info!(
            spills = state.spills,
            time_in_add_ms = state.time_in_add.as_millis() as u64,
            "Unique identifier detector torn down"
        );
        Ok(())
    }

    /// True once at least one identifier has been added
    pub fn was_used(&self) -> bool {
        self.lock().used
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    /// Cumulative time spent inside [`add`](Self::add)
    pub fn time_in_add(&self) -> Duration {
        self.lock().time_in_add
    }

    pub fn in_memory_len(&self) -> usize {
        self.lock().memory.len()
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_store(path: &Path) -> Result<Connection, DetectorError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA synchronous = OFF;
         CREATE TABLE IF NOT EXISTS seen_ids (id TEXT PRIMARY KEY) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn remove_store(path: &Path) -> Result<(), DetectorError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn store_contains(store: &Connection, id: &str) -> rusqlite::Result<bool> {
    store
        .prepare_cached("SELECT 1 FROM seen_ids WHERE id = ?1")?
        .query_row(params![id], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
}

fn write_batch(store: &mut Connection, ids: &HashSet<String>) -> rusqlite::Result<()> {
    let tx = store.transaction()?;
    {
        let mut insert = tx.prepare_cached("INSERT OR IGNORE INTO seen_ids (id) VALUES (?1)")?;
        for id in ids {
            insert.execute(params![id])?;
        }
    }
    tx.commit()
}

/// Move the in-memory set to the scratch store
fn spill(state: &mut DetectorState, store_path: &Path) {
    if state.memory.is_empty() {
        return;
    }
    let Some(store) = state.store.as_mut() else {
        return;
    };

    match write_batch(store, &state.memory) {
        Ok(()) => {
            debug!(ids = state.memory.len(), "Spilled identifiers to disk");
            state.memory.clear();
            state.memory_bytes = 0;
            state.spills += 1;
        }
        Err(e) => degrade(state, store_path, &e),
    }
}

fn degrade(state: &mut DetectorState, store_path: &Path, error: &dyn std::fmt::Display) {
    warn!(
        store = %store_path.display(),
        error = %error,
        "Identifier store failed, continuing with in-memory detection only"
    );
    state.store = None;
    state.degraded = true;
}
