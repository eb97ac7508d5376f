//! PostgreSQL store over a `deadpool-postgres` pool
//!
//! Table and procedure names come from validated configuration and are
//! composed into SQL text; every value is bound as a parameter.

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;

use super::schema::{DEFAULT_CONFIG_TABLE, DEFAULT_LEDGER_TABLE, EngineSchema};
use super::{
    LOAD_TIMESTAMP_COLUMN, LoadClock, RUN_ID_COLUMN, Row, Store, StoreError, StoreResult,
    StoreTransaction,
};
use crate::config::LoadMethod;
use crate::config::pipeline::{RuntimeConfig, text_field, validate_column, validate_identifier};
use crate::ledger::RunLedgerEntry;

/// PostgreSQL implementation of [`Store`]
pub struct PgStore {
    pool: Pool,
    config_table: String,
    ledger_table: String,
}

impl PgStore {
    /// Create a pool for the given connection string.
    ///
    /// No connection is opened until the first query.
    pub fn connect(url: &str, pool_size: usize) -> StoreResult<Self> {
        let pool = create_pool(url, pool_size).map_err(StoreError::Pool)?;
        Ok(Self {
            pool,
            config_table: DEFAULT_CONFIG_TABLE.to_string(),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        })
    }

    /// Use non-default configuration and ledger table names
    pub fn with_tables(mut self, config_table: &str, ledger_table: &str) -> StoreResult<Self> {
        self.config_table = identifier(config_table)?;
        self.ledger_table = identifier(ledger_table)?;
        Ok(self)
    }

    /// Create the configuration, ledger and quality tables
    pub async fn init_schema(&self) -> StoreResult<()> {
        let ddl = EngineSchema::create_tables_postgres(&self.config_table, &self.ledger_table);
        self.client()
            .await?
            .batch_execute(&ddl)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn client(&self) -> StoreResult<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(format!("pool get failed: {e}")))
    }

    async fn columns_of(&self, client: &Object, table: &str) -> StoreResult<Vec<String>> {
        let table = identifier(table)?;
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) => (Some(schema.to_string()), name.to_string()),
            None => (None, table.clone()),
        };

        let rows = client
            .query(
                "SELECT column_name::text FROM information_schema.columns
                 WHERE table_schema::text = COALESCE($1::text, current_schema()::text)
                   AND lower(table_name::text) = lower($2::text)
                 ORDER BY ordinal_position",
                &[&schema, &name],
            )
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if rows.is_empty() {
            return Err(StoreError::TableNotFound(table));
        }
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn json_rows(&self, sql: &str, import_name: Option<&str>) -> StoreResult<Vec<Row>> {
        let client = self.client().await?;
        let rows = match import_name {
            Some(name) => client.query(sql, &[&name]).await,
            None => client.query(sql, &[]).await,
        }
        .map_err(|e| map_error(&self.config_table, e))?;

        let mut parsed = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.get(0);
            match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => parsed.push(map),
                Ok(_) => {}
                Err(e) => return Err(StoreError::Database(e.to_string())),
            }
        }
        Ok(parsed)
    }

    fn active_filter() -> &'static str {
        "CAST(is_active AS text) IN ('1', 'true', 't')"
    }
}

#[async_trait]
impl Store for PgStore {
    async fn config_columns(&self) -> StoreResult<Vec<String>> {
        let client = self.client().await?;
        self.columns_of(&client, &self.config_table).await
    }

    async fn active_config_rows(&self, columns: &[String]) -> StoreResult<Vec<Row>> {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
        };
        let sql = format!(
            "SELECT row_to_json(t)::text FROM (SELECT {projection} FROM {} WHERE {}) t",
            self.config_table,
            Self::active_filter()
        );
        self.json_rows(&sql, None).await
    }

    async fn config_row(&self, import_name: &str) -> StoreResult<Option<Row>> {
        let sql = format!(
            "SELECT row_to_json(c)::text FROM {} c WHERE lower(c.import_name) = lower($1) LIMIT 1",
            self.config_table
        );
        Ok(self
            .json_rows(&sql, Some(import_name))
            .await?
            .into_iter()
            .next())
    }

    async fn active_dependents(&self, import_name: &str) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT row_to_json(c)::text FROM {} c WHERE {}",
            self.config_table,
            Self::active_filter()
        );
        let rows = self.json_rows(&sql, None).await?;
        Ok(rows
            .iter()
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
        let sql = format!(
            "UPDATE {} SET column_mapping = $1 WHERE lower(import_name) = lower($2)",
            self.config_table
        );
        self.client()
            .await?
            .execute(&sql, &[&mapping, &import_name])
            .await
            .map_err(|e| map_error(&self.config_table, e))
    }

    async fn table_columns(&self, table: &str) -> StoreResult<Vec<String>> {
        let client = self.client().await?;
        self.columns_of(&client, table).await
    }

    async fn insert_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Option<String>>],
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = identifier(table)?;

        // Values travel as one JSON document; the server casts each field to
        // the column's declared type.
        let records: Vec<Value> = rows
            .iter()
            .map(|values| {
                Value::Object(
                    columns
                        .iter()
                        .zip(values)
                        .map(|(c, v)| (c.clone(), v.clone().map(Value::String).unwrap_or(Value::Null)))
                        .collect(),
                )
            })
            .collect();
        let payload = Value::Array(records).to_string();

        let column_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {table} ({column_list}) \
             SELECT {column_list} FROM json_populate_recordset(NULL::{table}, $1::text::json)"
        );

        self.client()
            .await?
            .execute(&sql, &[&payload])
            .await
            .map_err(|e| map_error(&table, e))
    }

    async fn latest_load(&self, table: &str) -> StoreResult<LoadClock> {
        let table = identifier(table)?;
        // A `timestamp` column is cast to `timestamptz` in the session's
        // time zone by the subtraction; epoch of the bare column would read
        // it as UTC.
        let sql = format!(
            "SELECT EXTRACT(EPOCH FROM now() - MAX({LOAD_TIMESTAMP_COLUMN}))::float8, \
             EXTRACT(EPOCH FROM now())::float8 FROM {table}"
        );
        let row = self
            .client()
            .await?
            .query_one(&sql, &[])
            .await
            .map_err(|e| match map_error(&table, e) {
                StoreError::ColumnNotFound { table, .. } => StoreError::ColumnNotFound {
                    table,
                    column: LOAD_TIMESTAMP_COLUMN.to_string(),
                },
                other => other,
            })?;

        Ok(LoadClock::from_elapsed(
            row.get::<_, Option<f64>>(0),
            row.get::<_, f64>(1),
        ))
    }

    async fn delete_staged_duplicates(
        &self,
        staging_table: &str,
        destination_table: &str,
        keys: &[String],
        run_id: &str,
    ) -> StoreResult<u64> {
        let staging = identifier(staging_table)?;
        let destination = identifier(destination_table)?;
        let mut conditions = vec![format!("s.{RUN_ID_COLUMN} = $1")];
        for key in keys {
            let key = validate_column(key).ok_or_else(|| StoreError::InvalidIdentifier(key.clone()))?;
            let key = quote(&key);
            conditions.push(format!("s.{key} = d.{key}"));
        }

        let sql = format!(
            "DELETE FROM {staging} s USING {destination} d WHERE {}",
            conditions.join(" AND ")
        );
        self.client()
            .await?
            .execute(&sql, &[&run_id])
            .await
            .map_err(|e| map_error(&staging, e))
    }

    async fn delete_staged_run(&self, staging_table: &str, run_id: &str) -> StoreResult<u64> {
        let staging = identifier(staging_table)?;
        let sql = format!("DELETE FROM {staging} WHERE {RUN_ID_COLUMN} = $1");
        self.client()
            .await?
            .execute(&sql, &[&run_id])
            .await
            .map_err(|e| map_error(&staging, e))
    }

    async fn quality_failures(&self, run_id: &str, table: &str) -> StoreResult<u64> {
        let client = self.client().await?;

        let routine = client
            .query_opt(
                "SELECT prokind::text FROM pg_proc WHERE proname = 'execute_data_quality_checks' LIMIT 1",
                &[],
            )
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let Some(routine) = routine else {
            tracing::debug!(run_id, "No data quality routine installed");
            return Ok(0);
        };

        let call = if routine.get::<_, String>(0) == "p" {
            "CALL execute_data_quality_checks($1::text, $2::text)"
        } else {
            "SELECT execute_data_quality_checks($1::text, $2::text)"
        };
        client
            .execute(call, &[&run_id, &table])
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let counted = client
            .query_one(
                "SELECT COUNT(*) FROM data_quality_run_logs l
                 JOIN data_quality_rules r ON l.rule_id = r.rule_id
                 WHERE l.run_id = $1 AND l.status = 'FAIL' AND r.severity = 'FAIL'",
                &[&run_id],
            )
            .await;
        match counted {
            Ok(row) => Ok(row.get::<_, i64>(0).max(0) as u64),
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => Ok(0),
            Err(e) => Err(StoreError::Database(e.to_string())),
        }
    }

    async fn insert_ledger_entry(&self, entry: &RunLedgerEntry) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {} (run_id, pipeline_name, import_name, asset_name, status, \
             start_time, end_time, rows_processed, message, error_details, resolution_steps) \
             VALUES ($1, $2, $3, $4, $5, $6::text::timestamptz, $7::text::timestamptz, $8, $9, $10, $11)",
            self.ledger_table
        );
        let status = entry.status.to_string();
        let start = entry.start_time.to_rfc3339();
        let end = entry.end_time.to_rfc3339();
        let rows = entry.rows_processed as i64;

        self.client()
            .await?
            .execute(
                &sql,
                &[
                    &entry.run_id,
                    &entry.pipeline_name,
                    &entry.import_name,
                    &entry.asset_name,
                    &status,
                    &start,
                    &end,
                    &rows,
                    &entry.message,
                    &entry.error_details,
                    &entry.resolution_steps,
                ],
            )
            .await
            .map(|_| ())
            .map_err(|e| map_error(&self.ledger_table, e))
    }

    async fn begin(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
            config_table: self.config_table.clone(),
        }))
    }
}

/// A transaction pinned to one pooled connection
struct PgTransaction {
    client: Option<Object>,
    config_table: String,
}

impl PgTransaction {
    fn client(&self) -> StoreResult<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| StoreError::Transaction("transaction already finished".to_string()))
    }

    async fn finish(&mut self, statement: &str) -> StoreResult<()> {
        let client = self
            .client
            .take()
            .ok_or_else(|| StoreError::Transaction("transaction already finished".to_string()))?;
        match client.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Connection state is unknown; keep it out of the pool
                drop(Object::take(client));
                Err(StoreError::Transaction(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn call_procedure(
        &mut self,
        procedure: &str,
        run_id: &str,
        tables_to_truncate: Option<&str>,
    ) -> StoreResult<u64> {
        let procedure = identifier(procedure)?;
        let sql = format!(
            "SELECT * FROM {procedure}(run_id => $1::text, tables_to_truncate => $2::text)"
        );
        let rows = self
            .client()?
            .query(&sql, &[&run_id, &tables_to_truncate])
            .await
            .map_err(|e| {
                if e.code() == Some(&SqlState::UNDEFINED_FUNCTION) {
                    StoreError::ProcedureNotFound(procedure.clone())
                } else {
                    map_error(&procedure, e)
                }
            })?;

        let affected = rows
            .first()
            .and_then(|row| {
                row.try_get::<_, i64>(0)
                    .ok()
                    .or_else(|| row.try_get::<_, i32>(0).ok().map(i64::from))
            })
            .unwrap_or(0);
        Ok(affected.max(0) as u64)
    }

    async fn set_import_state(
        &mut self,
        import_name: &str,
        active: bool,
        load_method: Option<&LoadMethod>,
    ) -> StoreResult<u64> {
        let sql = format!(
            "UPDATE {} SET is_active = $1, load_method = COALESCE($2::text, load_method) \
             WHERE lower(import_name) = lower($3)",
            self.config_table
        );
        let method = load_method.map(LoadMethod::as_str);
        self.client()?
            .execute(&sql, &[&active, &method, &import_name])
            .await
            .map_err(|e| map_error(&self.config_table, e))
    }

    async fn commit(mut self: Box<Self>) -> StoreResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(mut self: Box<Self>) -> StoreResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // Closing the connection makes the server roll back
            tracing::warn!("Transaction dropped without commit, discarding connection");
            drop(Object::take(client));
        }
    }
}

/// Build a lazily connecting pool of at most `pool_size` connections
pub(crate) fn create_pool(url: &str, pool_size: usize) -> Result<Pool, String> {
    let pg_config: tokio_postgres::Config = url
        .parse()
        .map_err(|e| format!("invalid connection string: {e}"))?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = Manager::from_config(pg_config, NoTls, mgr_config);

    Pool::builder(mgr)
        .max_size(pool_size)
        .build()
        .map_err(|e| format!("pool creation failed: {e}"))
}

fn identifier(raw: &str) -> StoreResult<String> {
    validate_identifier(raw).ok_or_else(|| StoreError::InvalidIdentifier(raw.to_string()))
}

fn quote(column: &str) -> String {
    format!("\"{}\"", column.replace('"', "\"\""))
}

fn map_error(table: &str, e: tokio_postgres::Error) -> StoreError {
    match e.code() {
        Some(code) if *code == SqlState::UNDEFINED_TABLE => {
            StoreError::TableNotFound(table.to_string())
        }
        Some(code) if *code == SqlState::UNDEFINED_COLUMN => StoreError::ColumnNotFound {
            table: table.to_string(),
            column: e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string()),
        },
        _ => StoreError::Database(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("Order ID"), "\"Order ID\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_identifier_rejects_injection() {
        assert!(identifier("orders; DROP TABLE x").is_err());
        assert_eq!(identifier("[dbo].[orders]").unwrap(), "dbo.orders");
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        assert!(PgStore::connect("postgresql://etl@localhost:notaport/warehouse", 4).is_err());
    }
}
