//! `eltctl extract`, `eltctl transform`, `eltctl run` and `eltctl job`

use std::path::PathBuf;
use std::sync::Arc;

use elt_core::graph::{self, import_job_name};
use elt_core::loader::{BulkLoader, LoadProgress};
use elt_core::runner::{JobRunner, UnitOutcome};
use elt_core::sensor::TriggerRequest;
use elt_core::{PipelineConfig, new_run_id};

use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, Table, emit, truncate};

/// Arguments for the single-import commands
pub struct ImportArgs {
    pub import_name: String,
    /// Load this file instead of the newest match in the monitored directory
    pub file: Option<PathBuf>,
    /// Reuse a run id, e.g. to retry a failed transform
    pub run_id: Option<String>,
}

impl ImportArgs {
    fn run_id(&self) -> String {
        self.run_id.clone().unwrap_or_else(new_run_id)
    }

    fn trigger(&self, config: &PipelineConfig) -> Option<TriggerRequest> {
        self.file.as_ref().map(|path| TriggerRequest {
            run_key: format!("manual:{}", path.display()),
            import_name: config.import_name.clone(),
            job_name: import_job_name(&config.import_name),
            source_file_path: path.clone(),
        })
    }
}

fn job_runner(ctx: &Context, config: Option<&PipelineConfig>) -> Result<JobRunner, CliError> {
    let backend = ctx.backend()?;
    let runner = JobRunner::from_settings(
        Arc::clone(&backend.store),
        backend.locks,
        &ctx.settings,
    );

    // Spinner only for interactive table output of a single import
    match (ctx.format, config) {
        (OutputFormat::Table, Some(config)) => {
            let loader = BulkLoader::from_settings(backend.store, &ctx.settings.loader)
                .with_progress(Arc::new(LoadProgress::new(&config.staging_table)));
            Ok(runner.with_loader(loader))
        }
        _ => Ok(runner),
    }
}

/// Handle the `extract` command
pub async fn handle_extract(ctx: &Context, args: &ImportArgs) -> Result<(), CliError> {
    let config = ctx.config_for(&args.import_name).await?;
    let runner = job_runner(ctx, Some(&config))?;
    let run_id = args.run_id();

    let report = runner
        .extract_runner()
        .run(&config, &run_id, args.trigger(&config).as_ref())
        .await?;
    emit(ctx.format, &report, || {
        format!("[{}] {} (run {run_id})\n", report.status, report.message)
    })
}

/// Handle the `transform` command
pub async fn handle_transform(ctx: &Context, args: &ImportArgs) -> Result<(), CliError> {
    let config = ctx.config_for(&args.import_name).await?;
    let runner = job_runner(ctx, None)?;
    let Some(run_id) = args.run_id.clone() else {
        return Err(CliError::InvalidArgument(
            "transform needs --run-id of the extract run whose staged rows to move".to_string(),
        ));
    };

    let report = runner.transform_runner().run(&config, &run_id).await?;
    emit(ctx.format, &report, || {
        let mut out = format!(
            "[{}] {} rows affected (run {run_id})\nDecision: {} - {}\n",
            report.status, report.rows_affected, report.decision.rule, report.decision.reason
        );
        if report.duplicates_removed > 0 {
            out.push_str(&format!(
                "Removed {} duplicate staged rows\n",
                report.duplicates_removed
            ));
        }
        if let Some(switch) = &report.auto_switch {
            out.push_str(&format!(
                "Auto-switch: deactivated {}, activated {}{}\n",
                switch.deactivated,
                switch.activated,
                if switch.successor_found { "" } else { " (NOT FOUND)" }
            ));
        }
        out
    })
}

/// Handle the `run` command: extract then transform one import
pub async fn handle_run(ctx: &Context, args: &ImportArgs) -> Result<(), CliError> {
    let config = ctx.config_for(&args.import_name).await?;
    let runner = job_runner(ctx, Some(&config))?;
    let run_id = args.run_id();

    let report = runner
        .run_import(&config, &run_id, args.trigger(&config).as_ref())
        .await?;
    emit(ctx.format, &report, || {
        format!(
            "Run {run_id}\n  extract:   [{}] {}\n  transform: [{}] {} rows affected ({})\n",
            report.extract.status,
            report.extract.message,
            report.transform.status,
            report.transform.rows_affected,
            report.transform.decision.reason
        )
    })
}

/// Handle the `job` command: every unit of a graph job in order
pub async fn handle_job(ctx: &Context, job_name: &str) -> Result<(), CliError> {
    let configs = ctx.active_configs().await?;
    let graph = graph::build(&configs)?;
    let runner = job_runner(ctx, None)?;
    let run_id = new_run_id();

    let outcomes = runner.run_job(&graph, job_name, &configs, &run_id).await?;
    emit(ctx.format, &outcomes, || {
        format!("Job {job_name} (run {run_id})\n{}", job_table(&outcomes).render())
    })
}

fn job_table(outcomes: &[UnitOutcome]) -> Table {
    let mut table = Table::new(&["unit", "import", "status", "rows", "details"]);
    for outcome in outcomes {
        let row = match outcome {
            UnitOutcome::Extract(r) => vec![
                "extract".to_string(),
                r.import_name.clone(),
                r.status.to_string(),
                r.rows_loaded.to_string(),
                truncate(&r.message, 60),
            ],
            UnitOutcome::Transform(r) => vec![
                "transform".to_string(),
                r.import_name.clone(),
                r.status.to_string(),
                r.rows_affected.to_string(),
                truncate(&format!("{}: {}", r.decision.rule, r.decision.reason), 60),
            ],
        };
        table.add_row(row);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use elt_core::ledger::RunStatus;
    use elt_core::runner::{ExtractReport, TransformReport};
    use elt_core::{DecisionRule, LoadDecision};

    #[test]
    fn test_manual_trigger_uses_import_job() {
        let config = PipelineConfig::builder("sales").build().unwrap();
        let args = ImportArgs {
            import_name: "sales".to_string(),
            file: Some(PathBuf::from("/in/sales_1.csv")),
            run_id: Some("run-7".to_string()),
        };

        let trigger = args.trigger(&config).unwrap();
        assert_eq!(trigger.job_name, "sales_job");
        assert_eq!(trigger.source_file_path, PathBuf::from("/in/sales_1.csv"));
        assert_eq!(args.run_id(), "run-7");
    }

    #[test]
    fn test_job_table_names_the_import() {
        let outcomes = vec![
            UnitOutcome::Extract(ExtractReport {
                import_name: "sales".to_string(),
                status: RunStatus::Success,
                rows_loaded: 12,
                staging_table: "stg_sales".to_string(),
                source_file: None,
                message: "Loaded".to_string(),
            }),
            UnitOutcome::Transform(TransformReport {
                import_name: "sales".to_string(),
                status: RunStatus::Success,
                decision: LoadDecision {
                    should_truncate: false,
                    skip: false,
                    rule: DecisionRule::ConfiguredAppend,
                    reason: "append configured".to_string(),
                },
                rows_affected: 12,
                duplicates_removed: 0,
                auto_switch: None,
                notified: false,
            }),
        ];

        let rendered = job_table(&outcomes).render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("unit"));
        assert!(lines[2].starts_with("extract    sales"));
        assert!(lines[3].starts_with("transform  sales"));
        assert!(!rendered.contains("stg_sales"));
    }

    #[test]
    fn test_generated_run_ids_differ() {
        let args = ImportArgs {
            import_name: "sales".to_string(),
            file: None,
            run_id: None,
        };
        assert_ne!(args.run_id(), args.run_id());
    }
}
