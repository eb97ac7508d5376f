//! Extract and transform unit bodies
//!
//! [`ExtractRunner`] and [`TransformRunner`] compose the loader, arbiter,
//! lock manager, executor and ledger into the two unit kinds the graph
//! describes. [`JobRunner`] executes a whole job from the graph in
//! dependency order.

pub mod error;
pub mod extract;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::graph::PipelineGraph;
use crate::loader::BulkLoader;
use crate::lock::LockManager;
use crate::sensor::TriggerRequest;
use crate::settings::EngineSettings;
use crate::store::Store;

pub use error::{RunError, RunResult};
pub use extract::{ExtractReport, ExtractRunner};
pub use transform::{TransformReport, TransformRunner};

/// Reports of one import run through both units
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub import_name: String,
    pub extract: ExtractReport,
    pub transform: TransformReport,
}

/// Runs imports and graph jobs
#[derive(Clone)]
pub struct JobRunner {
    extract: ExtractRunner,
    transform: TransformRunner,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Store>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            extract: ExtractRunner::new(Arc::clone(&store)),
            transform: TransformRunner::new(store, locks),
        }
    }

    /// Configure chunking, loader concurrency, parsers and the batch window
    /// from settings
    pub fn from_settings(
        store: Arc<dyn Store>,
        locks: Arc<dyn LockManager>,
        settings: &EngineSettings,
    ) -> Self {
        let loader = BulkLoader::from_settings(Arc::clone(&store), &settings.loader);
        Self {
            extract: ExtractRunner::new(Arc::clone(&store))
                .with_loader(loader)
                .with_chunk_size(settings.loader.chunk_size),
            transform: TransformRunner::new(store, locks)
                .with_batch_window(settings.batch_window()),
        }
    }

    pub fn with_loader(mut self, loader: BulkLoader) -> Self {
        self.extract = self.extract.with_loader(loader);
        self
    }

    pub fn extract_runner(&self) -> &ExtractRunner {
        &self.extract
    }

    pub fn transform_runner(&self) -> &TransformRunner {
        &self.transform
    }

    /// Extract then transform one import.
    ///
    /// The transform runs whenever the extract did not fail, including runs
    /// that found no source file.
    pub async fn run_import(
        &self,
        config: &PipelineConfig,
        run_id: &str,
        trigger: Option<&TriggerRequest>,
    ) -> RunResult<ImportReport> {
        let extract = self.extract.run(config, run_id, trigger).await?;
        let transform = self.transform.run(config, run_id).await?;
        Ok(ImportReport {
            import_name: config.import_name.clone(),
            extract,
            transform,
        })
    }

    /// Run every unit of a graph job in execution order, stopping at the
    /// first failure. All units share one run id.
    pub async fn run_job(
        &self,
        graph: &PipelineGraph,
        job_name: &str,
        configs: &[PipelineConfig],
        run_id: &str,
    ) -> RunResult<Vec<UnitOutcome>> {
        let job = graph
            .job(job_name)
            .ok_or_else(|| RunError::UnknownJob(job_name.to_string()))?;
        let by_import: HashMap<String, &PipelineConfig> = configs
            .iter()
            .map(|c| (c.import_name.to_lowercase(), c))
            .collect();

        tracing::info!(job = job_name, run_id, units = job.units.len(), "Starting job");
        let mut outcomes = Vec::new();
        for unit in graph.execution_order() {
            if !job.units.contains(unit) {
                continue;
            }
            if let Some(extract) = graph.extract_units.iter().find(|u| &u.name == unit) {
                let Some(config) = by_import.get(&extract.import_name.to_lowercase()) else {
                    continue;
                };
                let report = self.extract.run(config, run_id, None).await?;
                outcomes.push(UnitOutcome::Extract(report));
            } else if let Some(transform) = graph.transform_units.iter().find(|u| &u.name == unit) {
                let Some(config) = by_import.get(&transform.import_name.to_lowercase()) else {
                    continue;
                };
                let report = self.transform.run(config, run_id).await?;
                outcomes.push(UnitOutcome::Transform(report));
            }
        }
        tracing::info!(job = job_name, run_id, units = outcomes.len(), "Job finished");
        Ok(outcomes)
    }
}

/// Report of one unit within a job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum UnitOutcome {
    Extract(ExtractReport),
    Transform(TransformReport),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph;
    use crate::ledger::RunStatus;
    use crate::lock::InProcessLockManager;
    use crate::store::{MemoryProcedure, MemoryStore};
    use std::fs;
    use tempfile::TempDir;

    fn import(store: &MemoryStore, dir: &std::path::Path, name: &str, depends_on: Option<&str>) -> PipelineConfig {
        store.create_table(&format!("stg_{name}"), &["id", "run_id"]);
        store.create_table(name, &["id", "load_timestamp"]);
        store.register_procedure(
            &format!("sp_{name}"),
            MemoryProcedure::CopyStaged {
                staging: format!("stg_{name}"),
                destination: name.to_string(),
            },
        );
        let mut builder = PipelineConfig::builder(name)
            .pipeline("crm")
            .file_pattern(&format!("{name}_*.csv"))
            .staging_table(&format!("stg_{name}"))
            .destination(name)
            .procedure(&format!("sp_{name}"))
            .monitored_directory(dir);
        if let Some(deps) = depends_on {
            builder = builder.depends_on(deps);
        }
        let config = builder.build().unwrap();
        store.add_config(&config).unwrap();
        config
    }

    #[tokio::test]
    async fn test_run_import_loads_destination() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let config = import(&store, dir.path(), "customers", None);
        fs::write(dir.path().join("customers_1.csv"), "id\n1\n2\n").unwrap();

        let runner = JobRunner::new(Arc::new(store.clone()), Arc::new(InProcessLockManager::new()));
        let report = runner.run_import(&config, "run-1", None).await.unwrap();

        assert_eq!(report.extract.rows_loaded, 2);
        assert_eq!(report.transform.status, RunStatus::Success);
        assert_eq!(store.row_count("customers").unwrap(), 2);
        assert_eq!(store.row_count("stg_customers").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_job_respects_dependencies() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let configs = vec![
            import(&store, dir.path(), "orders", Some("customers")),
            import(&store, dir.path(), "customers", None),
        ];
        fs::write(dir.path().join("customers_1.csv"), "id\n1\n").unwrap();
        fs::write(dir.path().join("orders_1.csv"), "id\n7\n").unwrap();

        let graph = graph::build(&configs).unwrap();
        let runner = JobRunner::new(Arc::new(store.clone()), Arc::new(InProcessLockManager::new()));
        let outcomes = runner.run_job(&graph, "crm", &configs, "run-1").await.unwrap();
        assert_eq!(outcomes.len(), 4);

        let transforms: Vec<String> = store
            .ledger()
            .into_iter()
            .filter(|e| e.asset_name.ends_with("_transform"))
            .map(|e| e.import_name)
            .collect();
        assert_eq!(transforms, vec!["customers".to_string(), "orders".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = MemoryStore::new();
        let runner = JobRunner::new(Arc::new(store), Arc::new(InProcessLockManager::new()));
        let err = runner
            .run_job(&PipelineGraph::default(), "nope", &[], "r")
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownJob(_)));
    }
}
