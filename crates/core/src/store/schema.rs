//! Database schema definitions for the engine's own tables

/// Default name of the pipeline configuration table
pub const DEFAULT_CONFIG_TABLE: &str = "elt_pipeline_configs";

/// Default name of the run ledger table
pub const DEFAULT_LEDGER_TABLE: &str = "etl_pipeline_run_logs";

/// Schema for the configuration, ledger and data-quality tables
pub struct EngineSchema;

impl EngineSchema {
    /// DDL for all engine tables (PostgreSQL syntax)
    pub fn create_tables_postgres(config_table: &str, ledger_table: &str) -> String {
        format!(
            r#"
-- Pipeline configuration, one row per import
CREATE TABLE IF NOT EXISTS {config_table} (
    import_name VARCHAR PRIMARY KEY,
    pipeline_name VARCHAR NOT NULL,
    file_pattern VARCHAR NOT NULL,
    file_type VARCHAR NOT NULL,
    staging_table VARCHAR NOT NULL,
    destination_table VARCHAR NOT NULL,
    transform_procedure VARCHAR NOT NULL,
    load_method VARCHAR DEFAULT 'append',
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    monitored_directory VARCHAR,
    column_mapping TEXT,
    parser_function VARCHAR,
    scraper_config TEXT,
    deduplication_key VARCHAR,
    on_success_deactivate_self_and_activate_import VARCHAR,
    depends_on VARCHAR
);

-- Append-only run ledger
CREATE TABLE IF NOT EXISTS {ledger_table} (
    id BIGSERIAL PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    pipeline_name VARCHAR NOT NULL,
    import_name VARCHAR NOT NULL,
    asset_name VARCHAR NOT NULL,
    status VARCHAR NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ NOT NULL,
    rows_processed BIGINT NOT NULL DEFAULT 0,
    message TEXT,
    error_details TEXT,
    resolution_steps TEXT
);

-- Data quality rules and their per-run results
CREATE TABLE IF NOT EXISTS data_quality_rules (
    rule_id SERIAL PRIMARY KEY,
    rule_name VARCHAR NOT NULL,
    target_table VARCHAR NOT NULL,
    severity VARCHAR NOT NULL DEFAULT 'WARN',
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS data_quality_run_logs (
    id BIGSERIAL PRIMARY KEY,
    run_id VARCHAR NOT NULL,
    rule_id INTEGER NOT NULL REFERENCES data_quality_rules(rule_id),
    status VARCHAR NOT NULL,
    failing_row_count BIGINT DEFAULT 0,
    checked_at TIMESTAMPTZ DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_{ledger_table}_import ON {ledger_table}(import_name);
CREATE INDEX IF NOT EXISTS idx_dq_run_logs_run ON data_quality_run_logs(run_id);
"#
        )
    }

    /// Example staging table layout for an import
    pub fn staging_table_example(staging_table: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {staging_table} (\n    \
             -- source columns as TEXT or typed columns\n    \
             run_id VARCHAR NOT NULL\n);\n\
             CREATE INDEX IF NOT EXISTS idx_{}_run_id ON {staging_table}(run_id);\n",
            staging_table.replace('.', "_")
        )
    }
}
