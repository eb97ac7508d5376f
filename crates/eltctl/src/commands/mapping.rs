//! `eltctl mapping`: suggest a column mapping for a source file

use std::path::PathBuf;

use elt_core::config::{generate_column_mapping, parse_column_mapping};
use elt_core::loader::{ParserRegistry, read_headers};
use elt_core::store::Store;
use serde::Serialize;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{Table, emit};

/// Arguments for the `mapping` command
pub struct MappingArgs {
    /// Source file whose header row is read
    pub file: PathBuf,
    /// Target columns, comma-separated
    pub columns: Option<String>,
    /// Read the target columns from this staging table
    pub table: Option<String>,
    /// Store the generated mapping on this import's configuration row
    pub save: Option<String>,
}

#[derive(Serialize)]
struct MappingOutput {
    source_columns: Vec<String>,
    table_columns: Vec<String>,
    column_mapping: String,
}

/// Handle the `mapping` command.
///
/// Pairs the n-th source header with the n-th target column; review the
/// result before storing it as the import's `column_mapping`.
pub async fn handle_mapping(ctx: &Context, args: &MappingArgs) -> Result<(), CliError> {
    let table_columns = target_columns(ctx, args).await?;
    let parser = ParserRegistry::with_defaults().for_path(&args.file)?;
    let source_columns = read_headers(parser, &args.file).await?;

    let column_mapping = generate_column_mapping(&source_columns, &table_columns);
    if let Some(import_name) = &args.save {
        let backend = ctx.backend()?;
        let updated = backend
            .store
            .update_column_mapping(import_name, &column_mapping)
            .await?;
        if updated == 0 {
            return Err(CliError::UnknownImport(import_name.clone()));
        }
        tracing::info!(import = %import_name, "Saved column mapping");
    }
    let output = MappingOutput {
        source_columns,
        table_columns,
        column_mapping,
    };
    emit(ctx.format, &output, || {
        let mut table = Table::new(&["source", "target"]);
        for (source, target) in parse_column_mapping(&output.column_mapping).iter() {
            table.add_row(vec![source.to_string(), target.to_string()]);
        }
        format!("{}\ncolumn_mapping = \"{}\"\n", table.render(), output.column_mapping)
    })
}

async fn target_columns(ctx: &Context, args: &MappingArgs) -> Result<Vec<String>, CliError> {
    match (&args.columns, &args.table) {
        (Some(columns), None) => Ok(split_columns(columns)),
        (None, Some(table)) => {
            let backend = ctx.backend()?;
            Ok(backend.store.table_columns(table).await?)
        }
        _ => Err(CliError::InvalidArgument(
            "give exactly one of --columns or --table".to_string(),
        )),
    }
}

fn split_columns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use elt_core::EngineSettings;
    use std::io::Write;

    #[test]
    fn test_split_columns() {
        assert_eq!(
            split_columns(" order_id, amount ,,run_id"),
            vec!["order_id", "amount", "run_id"]
        );
    }

    #[tokio::test]
    async fn test_both_sources_rejected() {
        let ctx = Context {
            settings: EngineSettings::new(),
            configs_path: None,
            format: OutputFormat::Json,
        };
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "Order No,Total").unwrap();

        let args = MappingArgs {
            file: file.path().to_path_buf(),
            columns: Some("order_id".to_string()),
            table: Some("stg_orders".to_string()),
            save: None,
        };
        assert!(matches!(
            handle_mapping(&ctx, &args).await,
            Err(CliError::InvalidArgument(_))
        ));
    }
}
