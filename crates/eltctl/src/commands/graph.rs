//! `eltctl graph` and `eltctl validate`

use elt_core::graph::{self, EdgeKind, PipelineGraph};
use elt_core::PipelineConfig;
use serde::Serialize;

use crate::context::Context;
use crate::error::CliError;
use crate::output::{Table, emit};

/// Handle the `graph` command
pub async fn handle_graph(ctx: &Context) -> Result<(), CliError> {
    let configs = ctx.active_configs().await?;
    let graph = graph::build(&configs)?;
    emit(ctx.format, &graph, || render_graph(&graph))
}

fn render_graph(graph: &PipelineGraph) -> String {
    let mut out = String::new();

    let mut units = Table::new(&["unit", "import", "group", "reads", "writes"]);
    for unit in &graph.extract_units {
        units.add_row(vec![
            unit.name.clone(),
            unit.import_name.clone(),
            unit.group.clone(),
            format!("*.{}", unit.file_type),
            unit.staging_table.clone(),
        ]);
    }
    for unit in &graph.transform_units {
        units.add_row(vec![
            unit.name.clone(),
            unit.import_name.clone(),
            unit.group.clone(),
            unit.procedure.clone(),
            unit.destination.clone(),
        ]);
    }
    out.push_str(&units.render());

    let dependencies: Vec<_> = graph
        .edges
        .iter()
        .filter(|e| e.kind == EdgeKind::Dependency)
        .collect();
    if !dependencies.is_empty() {
        out.push('\n');
        let mut edges = Table::new(&["upstream", "downstream"]);
        for edge in dependencies {
            edges.add_row(vec![edge.from.clone(), edge.to.clone()]);
        }
        out.push_str(&edges.render());
    }

    out.push('\n');
    let mut jobs = Table::new(&["job", "units", "concurrency key"]);
    for job in &graph.jobs {
        jobs.add_row(vec![
            job.name.clone(),
            job.units.len().to_string(),
            job.concurrency_key.clone(),
        ]);
    }
    out.push_str(&jobs.render());

    if !graph.sensors.is_empty() {
        out.push('\n');
        let mut sensors = Table::new(&["sensor", "directory", "pattern", "interval"]);
        for sensor in &graph.sensors {
            sensors.add_row(vec![
                sensor.name.clone(),
                sensor.directory.display().to_string(),
                sensor.file_pattern.clone(),
                format!("{}s", sensor.minimum_interval_secs),
            ]);
        }
        out.push_str(&sensors.render());
    }
    out
}

#[derive(Serialize)]
struct ValidationSummary<'a> {
    imports: Vec<ImportSummary<'a>>,
    units: usize,
    jobs: usize,
    sensors: usize,
}

#[derive(Serialize)]
struct ImportSummary<'a> {
    import_name: &'a str,
    pipeline: &'a str,
    load_method: &'a str,
    destination: &'a str,
    depends_on: Vec<String>,
}

/// Handle the `validate` command: load every active configuration and
/// build the graph, reporting the first problem
pub async fn handle_validate(ctx: &Context) -> Result<(), CliError> {
    let configs = ctx.active_configs().await?;
    let graph = graph::build(&configs)?;

    let summary = ValidationSummary {
        imports: configs.iter().map(import_summary).collect(),
        units: graph.unit_count(),
        jobs: graph.jobs.len(),
        sensors: graph.sensors.len(),
    };
    emit(ctx.format, &summary, || {
        let mut table = Table::new(&["import", "pipeline", "method", "destination", "depends on"]);
        for import in &summary.imports {
            table.add_row(vec![
                import.import_name.to_string(),
                import.pipeline.to_string(),
                import.load_method.to_string(),
                import.destination.to_string(),
                import.depends_on.join(", "),
            ]);
        }
        format!(
            "{}\nValidation successful: {} imports, {} units, {} jobs, {} sensors\n",
            table.render(),
            summary.imports.len(),
            summary.units,
            summary.jobs,
            summary.sensors
        )
    })
}

fn import_summary(config: &PipelineConfig) -> ImportSummary<'_> {
    ImportSummary {
        import_name: &config.import_name,
        pipeline: &config.pipeline_name,
        load_method: config.load_method.as_str(),
        destination: &config.destination_table,
        depends_on: config.upstream_imports(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_dependencies_and_sensors() {
        let configs = vec![
            PipelineConfig::builder("customers")
                .pipeline("CRM")
                .monitored_directory("/data/in")
                .build()
                .unwrap(),
            PipelineConfig::builder("orders")
                .pipeline("CRM")
                .depends_on("customers")
                .build()
                .unwrap(),
        ];
        let graph = graph::build(&configs).unwrap();
        let rendered = render_graph(&graph);

        assert!(rendered.contains("customers_extract_and_load_staging"));
        assert!(rendered.contains("upstream"));
        assert!(rendered.contains("sensor_customers"));
        assert!(rendered.contains("crm"));
    }
}
