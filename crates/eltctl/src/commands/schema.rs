//! `eltctl schema`: print or apply the engine's table DDL

use elt_core::store::schema::EngineSchema;

use crate::context::Context;
use crate::error::CliError;

/// Handle the `schema` command
pub async fn handle_schema(ctx: &Context, apply: bool, staging_table: Option<&str>) -> Result<(), CliError> {
    let db = &ctx.settings.database;
    if apply {
        return apply_schema(ctx).await;
    }

    print!(
        "{}",
        EngineSchema::create_tables_postgres(&db.config_table, &db.ledger_table)
    );
    if let Some(table) = staging_table {
        println!();
        println!("{}", EngineSchema::staging_table_example(table));
    }
    Ok(())
}

#[cfg(feature = "postgres-backend")]
async fn apply_schema(ctx: &Context) -> Result<(), CliError> {
    let db = &ctx.settings.database;
    let Some(url) = db.url.as_deref() else {
        return Err(CliError::DatabaseRequired);
    };
    let store = elt_core::PgStore::connect(url, 1)?.with_tables(&db.config_table, &db.ledger_table)?;
    store.init_schema().await?;
    eprintln!(
        "Created tables {}, {}, data_quality_rules and data_quality_run_logs",
        db.config_table, db.ledger_table
    );
    Ok(())
}

#[cfg(not(feature = "postgres-backend"))]
async fn apply_schema(_ctx: &Context) -> Result<(), CliError> {
    Err(CliError::DatabaseRequired)
}
