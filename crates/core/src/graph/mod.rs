//! Pipeline graph assembly
//!
//! Turns configuration rows into scheduler-neutral unit descriptors: one
//! extract unit and one transform unit per import, the edges between them,
//! per-pipeline group jobs, per-import jobs and file sensors. Dependency
//! cycles are rejected using petgraph.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::Serialize;
use thiserror::Error;

use crate::config::PipelineConfig;

/// Default minimum seconds between sensor ticks
pub const SENSOR_MINIMUM_INTERVAL_SECS: u64 = 30;

/// Errors raised while assembling the graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two imports map to the same unit name after sanitization
    #[error("Imports '{first}' and '{second}' both produce unit name '{name}'")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    /// Transform dependencies form a cycle
    #[error("Dependency cycle involving import '{0}'")]
    Cycle(String),
}

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

impl GraphError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            GraphError::NameCollision { first, second, .. } => {
                format!(
                    "{self}\n\n\
                    Hint: Rename one of the imports; '{first}' and '{second}' differ only \
                    in characters outside [A-Za-z0-9_]."
                )
            }
            GraphError::Cycle(import) => {
                format!(
                    "{self}\n\n\
                    Hint: Check depends_on (and scraper_config) of '{import}' and its upstream imports."
                )
            }
        }
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Loads one import's source file into its staging table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractUnit {
    pub name: String,
    pub import_name: String,
    pub group: String,
    pub staging_table: String,
    pub file_type: String,
}

/// Moves one import's staged rows into its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformUnit {
    pub name: String,
    pub import_name: String,
    pub group: String,
    pub procedure: String,
    pub destination: String,
    pub lock_resource: String,
    /// Extract unit feeding this transform
    pub extract_unit: String,
    /// Transform units that must finish first
    pub upstream: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// An import's extract unit feeds its own transform
    Staging,
    /// An upstream import's transform precedes this transform
    Dependency,
}

/// Directed edge between two units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Every unit of one pipeline, for manual runs
    Group,
    /// One import's extract unit and everything downstream of it
    Import,
}

/// A runnable selection of units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpec {
    pub name: String,
    pub kind: JobKind,
    pub units: Vec<String>,
    /// Runs sharing this key are not run concurrently by the scheduler
    pub concurrency_key: String,
}

/// A file sensor watching one import's monitored directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorSpec {
    pub name: String,
    pub import_name: String,
    pub job_name: String,
    pub directory: std::path::PathBuf,
    pub file_pattern: String,
    pub minimum_interval_secs: u64,
}

/// Everything the scheduler needs to run the configured imports
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineGraph {
    pub extract_units: Vec<ExtractUnit>,
    pub transform_units: Vec<TransformUnit>,
    pub edges: Vec<UnitEdge>,
    /// Group name to unit names
    pub groups: BTreeMap<String, Vec<String>>,
    pub jobs: Vec<JobSpec>,
    pub sensors: Vec<SensorSpec>,
    order: Vec<String>,
}

impl PipelineGraph {
    /// Unit names in an order that respects every edge
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn transform_for(&self, import_name: &str) -> Option<&TransformUnit> {
        self.transform_units
            .iter()
            .find(|u| u.import_name.eq_ignore_ascii_case(import_name))
    }

    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn unit_count(&self) -> usize {
        self.extract_units.len() + self.transform_units.len()
    }
}

pub fn extract_unit_name(import_name: &str) -> String {
    format!("{}_extract_and_load_staging", sanitize_name(import_name))
}

pub fn transform_unit_name(import_name: &str) -> String {
    format!("{}_transform", sanitize_name(import_name))
}

pub fn import_job_name(import_name: &str) -> String {
    format!("{}_job", sanitize_name(import_name))
}

/// Build the unit pair for one configuration row.
///
/// The transform's `upstream` list is left empty; it is filled by [`build`]
/// once all imports are known.
pub fn build_units(config: &PipelineConfig) -> (ExtractUnit, TransformUnit) {
    let extract = ExtractUnit {
        name: extract_unit_name(&config.import_name),
        import_name: config.import_name.clone(),
        group: config.group_name(),
        staging_table: config.staging_table.clone(),
        file_type: config.file_type.clone(),
    };
    let transform = TransformUnit {
        name: transform_unit_name(&config.import_name),
        import_name: config.import_name.clone(),
        group: config.group_name(),
        procedure: config.transform_procedure.clone(),
        destination: config.primary_destination().to_string(),
        lock_resource: config.lock_resource(),
        extract_unit: extract.name.clone(),
        upstream: Vec::new(),
    };
    (extract, transform)
}

/// Assemble the graph for a set of configurations
pub fn build(configs: &[PipelineConfig]) -> GraphResult<PipelineGraph> {
    let mut graph = PipelineGraph::default();
    let mut owners: HashMap<String, &str> = HashMap::new();

    for config in configs {
        let (extract, transform) = build_units(config);
        for name in [&extract.name, &transform.name] {
            if let Some(first) = owners.insert(name.clone(), &config.import_name) {
                return Err(GraphError::NameCollision {
                    name: name.clone(),
                    first: first.to_string(),
                    second: config.import_name.clone(),
                });
            }
        }
        graph
            .groups
            .entry(config.group_name())
            .or_default()
            .extend([extract.name.clone(), transform.name.clone()]);
        graph.edges.push(UnitEdge {
            from: extract.name.clone(),
            to: transform.name.clone(),
            kind: EdgeKind::Staging,
        });
        graph.extract_units.push(extract);
        graph.transform_units.push(transform);
    }

    for (config, transform) in configs.iter().zip(graph.transform_units.iter_mut()) {
        for upstream in config.upstream_imports() {
            match configs
                .iter()
                .find(|c| c.import_name.eq_ignore_ascii_case(&upstream))
            {
                Some(found) => {
                    let from = transform_unit_name(&found.import_name);
                    graph.edges.push(UnitEdge {
                        from: from.clone(),
                        to: transform.name.clone(),
                        kind: EdgeKind::Dependency,
                    });
                    transform.upstream.push(from);
                }
                None => tracing::warn!(
                    import = %config.import_name,
                    upstream = %upstream,
                    "Upstream import not in graph (it may be inactive); dependency edge skipped"
                ),
            }
        }
    }

    let (dag, nodes) = unit_graph(&graph);
    graph.order = match toposort(&dag, None) {
        Ok(order) => order.into_iter().map(|i| dag[i].clone()).collect(),
        Err(cycle) => {
            let unit = &dag[cycle.node_id()];
            let import = graph
                .transform_units
                .iter()
                .find(|t| &t.name == unit)
                .map(|t| t.import_name.clone())
                .unwrap_or_else(|| unit.clone());
            return Err(GraphError::Cycle(import));
        }
    };

    for (group, units) in &graph.groups {
        graph.jobs.push(JobSpec {
            name: group.clone(),
            kind: JobKind::Group,
            units: units.clone(),
            concurrency_key: format!("lock_{group}"),
        });
    }
    for (config, extract) in configs.iter().zip(&graph.extract_units) {
        let mut units = Vec::new();
        let mut dfs = Dfs::new(&dag, nodes[&extract.name]);
        while let Some(node) = dfs.next(&dag) {
            units.push(dag[node].clone());
        }
        units.sort_by_key(|u| graph.order.iter().position(|o| o == u));
        graph.jobs.push(JobSpec {
            name: import_job_name(&config.import_name),
            kind: JobKind::Import,
            units,
            concurrency_key: format!("lock_{}", config.group_name()),
        });
    }

    graph.sensors = configs
        .iter()
        .filter_map(|config| {
            let directory = config.monitored_directory.clone()?;
            Some(SensorSpec {
                name: format!("sensor_{}", sanitize_name(&config.import_name)),
                import_name: config.import_name.clone(),
                job_name: import_job_name(&config.import_name),
                directory,
                file_pattern: config.file_pattern.clone(),
                minimum_interval_secs: SENSOR_MINIMUM_INTERVAL_SECS,
            })
        })
        .collect();

    tracing::info!(
        imports = configs.len(),
        edges = graph.edges.len(),
        jobs = graph.jobs.len(),
        sensors = graph.sensors.len(),
        "Pipeline graph built"
    );
    Ok(graph)
}

fn unit_graph(graph: &PipelineGraph) -> (DiGraph<String, EdgeKind>, HashMap<String, NodeIndex>) {
    let mut dag = DiGraph::new();
    let mut nodes = HashMap::new();
    let names = graph
        .extract_units
        .iter()
        .map(|u| &u.name)
        .chain(graph.transform_units.iter().map(|u| &u.name));
    for name in names {
        nodes.insert(name.clone(), dag.add_node(name.clone()));
    }
    for edge in &graph.edges {
        if let (Some(&from), Some(&to)) = (nodes.get(&edge.from), nodes.get(&edge.to)) {
            dag.add_edge(from, to, edge.kind);
        }
    }
    (dag, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(import: &str, pipeline: &str, depends_on: Option<&str>) -> PipelineConfig {
        let mut builder = PipelineConfig::builder(import)
            .pipeline(pipeline)
            .file_pattern("*.csv")
            .file_type("csv")
            .staging_table(&format!("stg_{}", sanitize_name(import)))
            .destination(&sanitize_name(import))
            .procedure(&format!("sp_{}", sanitize_name(import)));
        if let Some(deps) = depends_on {
            builder = builder.depends_on(deps);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("sales-daily v2"), "sales_daily_v2");
        assert_eq!(sanitize_name("ok_123"), "ok_123");
    }

    #[test]
    fn test_build_units_names() {
        let (extract, transform) = build_units(&config("sales.daily", "Sales ", None));
        assert_eq!(extract.name, "sales_daily_extract_and_load_staging");
        assert_eq!(transform.name, "sales_daily_transform");
        assert_eq!(transform.group, "sales");
        assert_eq!(transform.lock_resource, "lock_sales_daily");
    }

    #[test]
    fn test_dependency_edges_are_case_insensitive() {
        let graph = build(&[
            config("customers", "crm", None),
            config("orders", "crm", Some("CUSTOMERS, inactive_one")),
        ])
        .unwrap();

        assert!(graph.edges.contains(&UnitEdge {
            from: "customers_transform".to_string(),
            to: "orders_transform".to_string(),
            kind: EdgeKind::Dependency,
        }));
        assert_eq!(graph.edges.len(), 3);
        assert_eq!(
            graph.transform_for("orders").unwrap().upstream,
            vec!["customers_transform".to_string()]
        );

        let order = graph.execution_order();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("customers_transform") < pos("orders_transform"));
        assert!(pos("orders_extract_and_load_staging") < pos("orders_transform"));
    }

    #[test]
    fn test_jobs_and_groups() {
        let graph = build(&[
            config("customers", "CRM", None),
            config("orders", "crm", Some("customers")),
            config("stock", "warehouse", None),
        ])
        .unwrap();

        assert_eq!(graph.groups.len(), 2);
        assert_eq!(graph.groups["crm"].len(), 4);

        let group = graph.job("crm").unwrap();
        assert_eq!(group.kind, JobKind::Group);
        assert_eq!(group.concurrency_key, "lock_crm");

        let job = graph.job("customers_job").unwrap();
        assert_eq!(job.concurrency_key, "lock_crm");
        assert_eq!(
            job.units,
            vec![
                "customers_extract_and_load_staging".to_string(),
                "customers_transform".to_string(),
                "orders_transform".to_string(),
            ]
        );
    }

    #[test]
    fn test_sensors_only_for_monitored_imports() {
        let mut watched = config("invoices", "finance", None);
        watched.monitored_directory = Some("/data/in".into());
        let graph = build(&[watched, config("manual", "finance", None)]).unwrap();

        assert_eq!(graph.sensors.len(), 1);
        let sensor = &graph.sensors[0];
        assert_eq!(sensor.name, "sensor_invoices");
        assert_eq!(sensor.job_name, "invoices_job");
        assert_eq!(sensor.minimum_interval_secs, 30);
    }

    #[test]
    fn test_name_collision() {
        let err = build(&[config("a-b", "p", None), config("a_b", "p", None)]).unwrap_err();
        assert!(matches!(err, GraphError::NameCollision { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = build(&[
            config("a", "p", Some("b")),
            config("b", "p", Some("a")),
        ])
        .unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
        assert!(err.user_message().contains("Hint:"));
    }
}
