//! eltctl: operator CLI for the config-driven ELT engine.
//!
//! Reads pipeline configurations from an export file or the configuration
//! table, shows the resulting graph, evaluates file sensors and runs extract
//! and transform units by hand.

mod commands;
mod context;
mod error;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::mapping::MappingArgs;
use commands::run::ImportArgs;
use commands::sensor::SensorArgs;
use context::Context;
use error::CliError;
use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "eltctl")]
#[command(author, version, about = "Config-driven ELT orchestration", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./eltctl.toml when present)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Pipeline configuration export (TOML, YAML or JSON) instead of the database
    #[arg(short, long, global = true)]
    configs: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    format: OutputFormat,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show units, dependencies, jobs and sensors
    Graph,

    /// Load and validate every active configuration
    Validate,

    /// File sensors
    Sensor {
        #[command(subcommand)]
        command: SensorCommand,
    },

    /// Load the newest (or given) source file into staging
    Extract(ImportCommand),

    /// Move a run's staged rows into the destination
    Transform(ImportCommand),

    /// Extract then transform one import
    Run(ImportCommand),

    /// Run every unit of a graph job in dependency order
    Job {
        /// Job name as shown by `eltctl graph`
        name: String,
    },

    /// Suggest a positional column mapping for a source file
    Mapping {
        /// Source file
        file: PathBuf,
        /// Target columns, comma-separated
        #[arg(long)]
        columns: Option<String>,
        /// Read target columns from this table
        #[arg(long)]
        table: Option<String>,
        /// Save the mapping on this import's configuration row
        #[arg(long, value_name = "IMPORT")]
        save: Option<String>,
    },

    /// Print (or apply) the DDL of the engine's tables
    Schema {
        /// Create the tables in the configured database
        #[arg(long)]
        apply: bool,
        /// Also print an example layout for this staging table
        #[arg(long)]
        staging_table: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum SensorCommand {
    /// Evaluate the sensor once and persist its cursor
    Tick(SensorCommandArgs),
    /// Poll on the sensor interval until Ctrl-C
    Watch(SensorCommandArgs),
}

#[derive(clap::Args, Debug)]
struct SensorCommandArgs {
    /// Import whose monitored directory is watched
    import_name: String,
    /// Cursor file (overrides sensor.cursor_file)
    #[arg(long)]
    cursor_file: Option<PathBuf>,
    /// Run the import for every trigger
    #[arg(long)]
    execute: bool,
}

#[derive(clap::Args, Debug)]
struct ImportCommand {
    /// Import name
    import_name: String,
    /// Source file to load instead of the newest pattern match
    #[arg(long)]
    file: Option<PathBuf>,
    /// Run id; required for `transform`
    #[arg(long)]
    run_id: Option<String>,
}

impl From<ImportCommand> for ImportArgs {
    fn from(cmd: ImportCommand) -> Self {
        Self {
            import_name: cmd.import_name,
            file: cmd.file,
            run_id: cmd.run_id,
        }
    }
}

impl From<SensorCommandArgs> for SensorArgs {
    fn from(cmd: SensorCommandArgs) -> Self {
        Self {
            import_name: cmd.import_name,
            cursor_file: cmd.cursor_file,
            execute: cmd.execute,
        }
    }
}

fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to install the log subscriber")
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let ctx = Context::load(cli.settings.as_deref(), cli.configs, cli.format)?;

    match cli.command {
        Commands::Graph => commands::graph::handle_graph(&ctx).await,
        Commands::Validate => commands::graph::handle_validate(&ctx).await,
        Commands::Sensor { command } => match command {
            SensorCommand::Tick(args) => {
                commands::sensor::handle_tick(&ctx, &args.into()).await
            }
            SensorCommand::Watch(args) => {
                commands::sensor::handle_watch(&ctx, &args.into()).await
            }
        },
        Commands::Extract(cmd) => commands::run::handle_extract(&ctx, &cmd.into()).await,
        Commands::Transform(cmd) => commands::run::handle_transform(&ctx, &cmd.into()).await,
        Commands::Run(cmd) => commands::run::handle_run(&ctx, &cmd.into()).await,
        Commands::Job { name } => commands::run::handle_job(&ctx, &name).await,
        Commands::Mapping {
            file,
            columns,
            table,
            save,
        } => {
            let args = MappingArgs {
                file,
                columns,
                table,
                save,
            };
            commands::mapping::handle_mapping(&ctx, &args).await
        }
        Commands::Schema {
            apply,
            staging_table,
        } => commands::schema::handle_schema(&ctx, apply, staging_table.as_deref()).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("Warning: {e:#}");
    }

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_transform_with_run_id() {
        let cli = Cli::parse_from([
            "eltctl",
            "--configs",
            "pipelines.toml",
            "transform",
            "sales",
            "--run-id",
            "abc",
        ]);
        match cli.command {
            Commands::Transform(cmd) => {
                assert_eq!(cmd.import_name, "sales");
                assert_eq!(cmd.run_id.as_deref(), Some("abc"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.configs, Some(PathBuf::from("pipelines.toml")));
    }

    #[test]
    fn test_sensor_tick_flags() {
        let cli = Cli::parse_from(["eltctl", "sensor", "tick", "sales", "--execute", "--format", "json"]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Sensor {
                command: SensorCommand::Tick(SensorCommandArgs { execute: true, .. })
            }
        ));
    }
}
