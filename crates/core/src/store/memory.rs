//! In-memory store for tests and dry runs
//!
//! Tables hold text values only. Transform procedures are declared with
//! [`MemoryProcedure`] instead of SQL, and every truncate and procedure insert
//! is recorded as a [`MemoryEvent`] so callers can inspect write ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    LOAD_TIMESTAMP_COLUMN, LoadClock, RUN_ID_COLUMN, Row, Store, StoreError, StoreResult,
    StoreTransaction,
};
use crate::config::pipeline::{EXPECTED_FIELDS, RuntimeConfig, bool_field, text_field};
use crate::config::{LoadMethod, PipelineConfig};
use crate::ledger::RunLedgerEntry;

/// Behaviour of a registered procedure
#[derive(Debug, Clone)]
pub enum MemoryProcedure {
    /// Truncate the requested tables, then copy the run's staged rows into
    /// `destination`, stamping `load_timestamp` when the destination has it
    CopyStaged {
        staging: String,
        destination: String,
    },
    /// Always fail with the given message
    Fail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEventKind {
    Truncate,
    Insert,
}

/// One write performed by a procedure
#[derive(Debug, Clone)]
pub struct MemoryEvent {
    pub kind: MemoryEventKind,
    pub table: String,
    pub run_id: String,
    pub at: Instant,
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl MemoryTable {
    fn position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }

    fn require(&self, table: &str, column: &str) -> StoreResult<usize> {
        self.position(column)
            .ok_or_else(|| StoreError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
    }
}

#[derive(Debug)]
struct State {
    tables: HashMap<String, MemoryTable>,
    config_columns: Vec<String>,
    configs: Vec<Row>,
    ledger: Vec<RunLedgerEntry>,
    procedures: HashMap<String, MemoryProcedure>,
    quality_failures: HashMap<String, u64>,
    events: Vec<MemoryEvent>,
    procedure_latency: Duration,
    insert_latency: Duration,
    fail_ledger_writes: bool,
}

impl State {
    fn table(&self, name: &str) -> StoreResult<&MemoryTable> {
        self.tables
            .get(&name.to_lowercase())
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut MemoryTable> {
        self.tables
            .get_mut(&name.to_lowercase())
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn config_index(&self, import_name: &str) -> Option<usize> {
        self.configs.iter().position(|row| {
            text_field(row, "import_name").is_some_and(|n| n.eq_ignore_ascii_case(import_name))
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Store backed by process memory.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                tables: HashMap::new(),
                config_columns: EXPECTED_FIELDS.iter().map(|f| f.to_string()).collect(),
                configs: Vec::new(),
                ledger: Vec::new(),
                procedures: HashMap::new(),
                quality_failures: HashMap::new(),
                events: Vec::new(),
                procedure_latency: Duration::ZERO,
                insert_latency: Duration::ZERO,
                fail_ledger_writes: false,
            })),
        }
    }

    /// Create (or replace) an empty table
    pub fn create_table(&self, name: &str, columns: &[&str]) {
        lock(&self.state).tables.insert(
            name.to_lowercase(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Add a configuration row
    pub fn add_config(&self, config: &PipelineConfig) -> StoreResult<()> {
        let row = match serde_json::to_value(config) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(StoreError::Database("config is not an object".to_string())),
            Err(e) => return Err(StoreError::Database(e.to_string())),
        };
        self.add_config_row(row);
        Ok(())
    }

    /// Add a raw configuration row, bypassing validation
    pub fn add_config_row(&self, row: Row) {
        lock(&self.state).configs.push(row);
    }

    /// Restrict the columns the configuration table reports
    pub fn set_config_columns(&self, columns: &[&str]) {
        lock(&self.state).config_columns = columns.iter().map(|c| c.to_string()).collect();
    }

    pub fn register_procedure(&self, name: &str, procedure: MemoryProcedure) {
        lock(&self.state)
            .procedures
            .insert(name.to_lowercase(), procedure);
    }

    /// Report `count` failed blocking quality rules for every run into `table`
    pub fn set_quality_failures(&self, table: &str, count: u64) {
        lock(&self.state)
            .quality_failures
            .insert(table.to_lowercase(), count);
    }

    /// Pause between a procedure's truncate and its insert
    pub fn set_procedure_latency(&self, latency: Duration) {
        lock(&self.state).procedure_latency = latency;
    }

    /// Delay every bulk insert
    pub fn set_insert_latency(&self, latency: Duration) {
        lock(&self.state).insert_latency = latency;
    }

    pub fn fail_ledger_writes(&self, fail: bool) {
        lock(&self.state).fail_ledger_writes = fail;
    }

    /// Rows of a table as column-keyed maps
    pub fn rows(&self, table: &str) -> StoreResult<Vec<Row>> {
        let state = lock(&self.state);
        let t = state.table(table)?;
        Ok(t.rows
            .iter()
            .map(|values| {
                t.columns
                    .iter()
                    .zip(values)
                    .map(|(c, v)| (c.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    pub fn row_count(&self, table: &str) -> StoreResult<usize> {
        Ok(lock(&self.state).table(table)?.rows.len())
    }

    pub fn ledger(&self) -> Vec<RunLedgerEntry> {
        lock(&self.state).ledger.clone()
    }

    pub fn events(&self) -> Vec<MemoryEvent> {
        lock(&self.state).events.clone()
    }

    /// The stored configuration row of an import
    pub fn config(&self, import_name: &str) -> Option<Row> {
        let state = lock(&self.state);
        state
            .config_index(import_name)
            .map(|i| state.configs[i].clone())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn config_columns(&self) -> StoreResult<Vec<String>> {
        Ok(lock(&self.state).config_columns.clone())
    }

    async fn active_config_rows(&self, columns: &[String]) -> StoreResult<Vec<Row>> {
        let state = lock(&self.state);
        let wanted: Vec<&String> = columns
            .iter()
            .filter(|c| {
                state
                    .config_columns
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(c))
            })
            .collect();

        Ok(state
            .configs
            .iter()
            .filter(|row| bool_field(row, "is_active").unwrap_or(false))
            .map(|row| {
                wanted
                    .iter()
                    .filter_map(|c| {
                        row.iter()
                            .find(|(k, _)| k.eq_ignore_ascii_case(c))
                            .map(|(k, v)| (k.clone(), v.clone()))
                    })
                    .collect()
            })
            .collect())
    }

    async fn config_row(&self, import_name: &str) -> StoreResult<Option<Row>> {
        Ok(self.config(import_name))
    }

    async fn active_dependents(&self, import_name: &str) -> StoreResult<Vec<String>> {
        let state = lock(&self.state);
        Ok(state
            .configs
            .iter()
            .filter(|row| bool_field(row, "is_active").unwrap_or(false))
            .filter(|row| {
                RuntimeConfig::from_row(row)
                    .upstream_imports
                    .iter()
                    .any(|u| u.eq_ignore_ascii_case(import_name))
            })
            .filter_map(|row| text_field(row, "import_name"))
            .collect())
    }

    async fn update_column_mapping(&self, import_name: &str, mapping: &str) -> StoreResult<u64> {
        let mut state = lock(&self.state);
        match state.config_index(import_name) {
            Some(i) => {
                state.configs[i].insert(
                    "column_mapping".to_string(),
                    Value::String(mapping.to_string()),
                );
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn table_columns(&self, table: &str) -> StoreResult<Vec<String>> {
        Ok(lock(&self.state).table(table)?.columns.clone())
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> StoreResult<u64> {
        let latency = lock(&self.state).insert_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = lock(&self.state);
        let t = state.table_mut(table)?;
        let positions = columns
            .iter()
            .map(|c| t.require(table, c))
            .collect::<StoreResult<Vec<_>>>()?;

        let width = t.columns.len();
        for values in rows {
            let mut stored = vec![None; width];
            for (pos, value) in positions.iter().zip(values) {
                stored[*pos] = value.clone();
            }
            t.rows.push(stored);
        }
        Ok(rows.len() as u64)
    }

    async fn latest_load(&self, table: &str) -> StoreResult<LoadClock> {
        let state = lock(&self.state);
        let t = state.table(table)?;
        let pos = t.require(table, LOAD_TIMESTAMP_COLUMN)?;

        let last_load = t
            .rows
            .iter()
            .filter_map(|r| r[pos].as_deref())
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
            .fold(None, |max: Option<f64>, ts| Some(max.map_or(ts, |m| m.max(ts))));

        Ok(LoadClock {
            last_load,
            db_now: Utc::now().timestamp_millis() as f64 / 1000.0,
        })
    }

    async fn delete_staged_duplicates(
        &self,
        staging_table: &str,
        destination_table: &str,
        keys: &[String],
        run_id: &str,
    ) -> StoreResult<u64> {
        let mut state = lock(&self.state);
        let dest = state.table(destination_table)?;
        let dest_keys = keys
            .iter()
            .map(|k| dest.require(destination_table, k))
            .collect::<StoreResult<Vec<_>>>()?;
        let existing: Vec<Vec<Option<String>>> = dest
            .rows
            .iter()
            .map(|r| dest_keys.iter().map(|&p| r[p].clone()).collect())
            .collect();

        let staging = state.table_mut(staging_table)?;
        let run_pos = staging.require(staging_table, RUN_ID_COLUMN)?;
        let stage_keys = keys
            .iter()
            .map(|k| staging.require(staging_table, k))
            .collect::<StoreResult<Vec<_>>>()?;

        let before = staging.rows.len();
        staging.rows.retain(|r| {
            if r[run_pos].as_deref() != Some(run_id) {
                return true;
            }
            let key: Vec<Option<String>> = stage_keys.iter().map(|&p| r[p].clone()).collect();
            // NULL never equals NULL
            !(key.iter().all(Option::is_some) && existing.contains(&key))
        });
        Ok((before - staging.rows.len()) as u64)
    }

    async fn delete_staged_run(&self, staging_table: &str, run_id: &str) -> StoreResult<u64> {
        let mut state = lock(&self.state);
        let staging = state.table_mut(staging_table)?;
        let run_pos = staging.require(staging_table, RUN_ID_COLUMN)?;
        let before = staging.rows.len();
        staging
            .rows
            .retain(|r| r[run_pos].as_deref() != Some(run_id));
        Ok((before - staging.rows.len()) as u64)
    }

    async fn quality_failures(&self, _run_id: &str, table: &str) -> StoreResult<u64> {
        Ok(lock(&self.state)
            .quality_failures
            .get(&table.to_lowercase())
            .copied()
            .unwrap_or(0))
    }

    async fn insert_ledger_entry(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        let mut state = lock(&self.state);
        if state.fail_ledger_writes {
            return Err(StoreError::Database("ledger table unavailable".to_string()));
        }
        state.ledger.push(entry.clone());
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            table_images: HashMap::new(),
            config_image: None,
            finished: false,
        }))
    }
}

/// Writes apply immediately; pre-images of touched tables are restored on
/// rollback or when dropped unfinished.
struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    table_images: HashMap<String, MemoryTable>,
    config_image: Option<Vec<Row>>,
    finished: bool,
}

impl MemoryTransaction {
    fn remember_table(&mut self, state: &State, name: &str) -> StoreResult<()> {
        let key = name.to_lowercase();
        if !self.table_images.contains_key(&key) {
            let image = state.table(name)?.clone();
            self.table_images.insert(key, image);
        }
        Ok(())
    }

    fn restore(&mut self) {
        let mut state = lock(&self.state);
        for (name, image) in self.table_images.drain() {
            state.tables.insert(name, image);
        }
        if let Some(configs) = self.config_image.take() {
            state.configs = configs;
        }
    }

    fn truncate(&mut self, tables: Option<&str>, run_id: &str) -> StoreResult<()> {
        let Some(tables) = tables else {
            return Ok(());
        };
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared);
        for table in crate::config::legacy::split_names(tables) {
            self.remember_table(&state, &table)?;
            state.table_mut(&table)?.rows.clear();
            state.events.push(MemoryEvent {
                kind: MemoryEventKind::Truncate,
                table: table.to_lowercase(),
                run_id: run_id.to_string(),
                at: Instant::now(),
            });
        }
        Ok(())
    }

    fn copy_staged(&mut self, staging: &str, destination: &str, run_id: &str) -> StoreResult<u64> {
        let shared = Arc::clone(&self.state);
        let mut state = lock(&shared);
        self.remember_table(&state, destination)?;

        let source = state.table(staging)?;
        let run_pos = source.require(staging, RUN_ID_COLUMN)?;
        let staged: Vec<Vec<Option<String>>> = source
            .rows
            .iter()
            .filter(|r| r[run_pos].as_deref() == Some(run_id))
            .cloned()
            .collect();
        let source_columns = source.columns.clone();

        let dest = state.table_mut(destination)?;
        let stamp_pos = dest.position(LOAD_TIMESTAMP_COLUMN);
        let column_map: Vec<Option<usize>> = dest
            .columns
            .iter()
            .map(|c| {
                source_columns
                    .iter()
                    .position(|s| s.eq_ignore_ascii_case(c))
            })
            .collect();
        let now = Utc::now().to_rfc3339();

        for row in &staged {
            let mut stored: Vec<Option<String>> = column_map
                .iter()
                .map(|src| src.and_then(|p| row[p].clone()))
                .collect();
            if let Some(p) = stamp_pos {
                stored[p] = Some(now.clone());
            }
            dest.rows.push(stored);
        }

        state.events.push(MemoryEvent {
            kind: MemoryEventKind::Insert,
            table: destination.to_lowercase(),
            run_id: run_id.to_string(),
            at: Instant::now(),
        });
        Ok(staged.len() as u64)
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn call_procedure(
        &mut self,
        procedure: &str,
        run_id: &str,
        tables_to_truncate: Option<&str>,
    ) -> StoreResult<u64> {
        let (registered, latency) = {
            let state = lock(&self.state);
            (
                state.procedures.get(&procedure.to_lowercase()).cloned(),
                state.procedure_latency,
            )
        };

        match registered {
            None => Err(StoreError::ProcedureNotFound(procedure.to_string())),
            Some(MemoryProcedure::Fail(message)) => Err(StoreError::Database(message)),
            Some(MemoryProcedure::CopyStaged {
                staging,
                destination,
            }) => {
                self.truncate(tables_to_truncate, run_id)?;
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                self.copy_staged(&staging, &destination, run_id)
            }
        }
    }

    async fn set_import_state(
        &mut self,
        import_name: &str,
        active: bool,
        load_method: Option<&LoadMethod>,
    ) -> StoreResult<u64> {
        let mut state = lock(&self.state);
        let Some(i) = state.config_index(import_name) else {
            return Ok(0);
        };
        if self.config_image.is_none() {
            self.config_image = Some(state.configs.clone());
        }
        let row = &mut state.configs[i];
        row.insert("is_active".to_string(), Value::Bool(active));
        if let Some(method) = load_method {
            row.insert(
                "load_method".to_string(),
                Value::String(method.as_str().to_string()),
            );
        }
        Ok(1)
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.restore();
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}
