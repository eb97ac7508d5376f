//! `eltctl sensor tick` and `eltctl sensor watch`

use std::path::PathBuf;

use elt_core::runner::JobRunner;
use elt_core::sensor::{CursorStore, FileSensor, TriggerRequest};
use elt_core::{PipelineConfig, new_run_id};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{OutputFormat, Table, emit};

/// Arguments shared by the sensor subcommands
pub struct SensorArgs {
    pub import_name: String,
    /// Overrides `sensor.cursor_file` from the settings
    pub cursor_file: Option<PathBuf>,
    /// Run the import for every trigger
    pub execute: bool,
}

#[derive(Serialize)]
struct TickOutput<'a> {
    sensor: &'a str,
    cursor: f64,
    skip_reason: Option<&'a str>,
    triggers: &'a [TriggerRequest],
}

fn sensor_for(ctx: &Context, config: &PipelineConfig) -> Result<FileSensor, CliError> {
    Ok(FileSensor::for_config(config)?.with_interval(ctx.settings.sensor_interval()))
}

fn cursor_store(ctx: &Context, args: &SensorArgs) -> Result<CursorStore, CliError> {
    let path = args
        .cursor_file
        .clone()
        .unwrap_or_else(|| ctx.settings.sensor.cursor_file.clone());
    Ok(CursorStore::load(&path)?)
}

fn job_runner(ctx: &Context) -> Result<JobRunner, CliError> {
    let backend = ctx.backend()?;
    Ok(JobRunner::from_settings(
        backend.store,
        backend.locks,
        &ctx.settings,
    ))
}

/// Handle `sensor tick`: evaluate once and persist the cursor
pub async fn handle_tick(ctx: &Context, args: &SensorArgs) -> Result<(), CliError> {
    let config = ctx.config_for(&args.import_name).await?;
    let sensor = sensor_for(ctx, &config)?;
    let runner = if args.execute { Some(job_runner(ctx)?) } else { None };
    let mut cursors = cursor_store(ctx, args)?;

    let tick = sensor.tick_and_commit(&mut cursors, |_| {})?;
    let output = TickOutput {
        sensor: sensor.name(),
        cursor: tick.cursor,
        skip_reason: tick.skip_reason.as_deref(),
        triggers: &tick.triggers,
    };
    emit(ctx.format, &output, || {
        if let Some(reason) = output.skip_reason {
            return format!("Skipped: {reason}\n");
        }
        let mut table = Table::new(&["run key", "file"]);
        for trigger in output.triggers {
            table.add_row(vec![
                trigger.run_key.clone(),
                trigger.source_file_path.display().to_string(),
            ]);
        }
        format!(
            "{}\n{} trigger(s), cursor now {}\n",
            table.render(),
            output.triggers.len(),
            output.cursor
        )
    })?;

    if let Some(runner) = runner {
        for trigger in &tick.triggers {
            run_trigger(&runner, &config, trigger, ctx.format).await;
        }
    }
    Ok(())
}

/// Handle `sensor watch`: poll until Ctrl-C
pub async fn handle_watch(ctx: &Context, args: &SensorArgs) -> Result<(), CliError> {
    let config = ctx.config_for(&args.import_name).await?;
    let sensor = sensor_for(ctx, &config)?;
    let runner = if args.execute { Some(job_runner(ctx)?) } else { None };
    let mut cursors = cursor_store(ctx, args)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<TriggerRequest>();
    let format = ctx.format;
    let worker = tokio::spawn(async move {
        while let Some(trigger) = rx.recv().await {
            match &runner {
                Some(runner) => run_trigger(runner, &config, &trigger, format).await,
                None => println!("{}\t{}", trigger.run_key, trigger.source_file_path.display()),
            }
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    sensor
        .run(
            &mut cursors,
            |trigger| {
                if tx.send(trigger.clone()).is_err() {
                    tracing::warn!(run_key = %trigger.run_key, "Trigger worker stopped; dropping trigger");
                }
            },
            shutdown,
        )
        .await;

    drop(tx);
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "Trigger worker ended abnormally");
    }
    Ok(())
}

/// Run one triggered import; failures are already in the ledger, so they
/// are reported and polling goes on
async fn run_trigger(
    runner: &JobRunner,
    config: &PipelineConfig,
    trigger: &TriggerRequest,
    format: OutputFormat,
) {
    let run_id = new_run_id();
    tracing::info!(run_key = %trigger.run_key, run_id = %run_id, "Running triggered import");
    match runner.run_import(config, &run_id, Some(trigger)).await {
        Ok(report) => {
            let printed = emit(format, &report, || {
                format!(
                    "{}: extract {} ({} rows), transform {} ({} rows)\n",
                    report.import_name,
                    report.extract.status,
                    report.extract.rows_loaded,
                    report.transform.status,
                    report.transform.rows_affected
                )
            });
            if let Err(e) = printed {
                tracing::warn!(error = %e, "Cannot print run report");
            }
        }
        Err(e) => eprintln!("Run {run_id} failed: {}", e.user_message()),
    }
}
