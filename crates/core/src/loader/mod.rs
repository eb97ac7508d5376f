//! Chunked bulk loading of source files into staging tables
//!
//! A file is read in fixed-size chunks on the blocking pool. Each chunk is
//! reshaped to the table's columns, tagged with the run id and inserted by its
//! own task. At most `concurrency` inserts run at once; the reader waits for
//! one to finish before reading further, so at most `concurrency + 1` chunks
//! are held in memory. Committed chunks are not rolled back when a later chunk
//! fails: staged rows are cleaned up by run id instead.

pub mod chunk;
pub mod error;
pub mod parser;
pub mod progress;

use std::path::Path;
use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};

use crate::config::ColumnMapping;
use crate::settings::LoaderSettings;
use crate::store::{Store, StoreResult};

pub use chunk::{ChunkGauge, ChunkShape, is_bool_like};
pub use error::{LoadError, LoadResult};
pub use parser::{DelimitedParser, ParserRegistry, RecordReader, SourceParser, read_headers};
#[cfg(feature = "progress")]
pub use progress::LoadProgress;
pub use progress::ProgressSink;

/// Default rows per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Default number of chunk inserts in flight
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Outcome of one load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub chunks: usize,
    /// Most chunks held in memory at once
    pub peak_chunks_in_memory: usize,
}

/// Streams files into tables through a [`Store`]
#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn Store>,
    registry: ParserRegistry,
    concurrency: usize,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            registry: ParserRegistry::with_defaults(),
            concurrency: DEFAULT_CONCURRENCY,
            progress: None,
        }
    }

    /// Loader with the configured concurrency and allowed custom parsers
    pub fn from_settings(store: Arc<dyn Store>, settings: &LoaderSettings) -> Self {
        let mut registry = ParserRegistry::with_defaults();
        for name in &settings.allowed_parsers {
            registry.allow(name);
        }
        Self::new(store)
            .with_concurrency(settings.concurrency)
            .with_registry(registry)
    }

    /// Set the number of concurrent chunk inserts (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Load a file, picking the parser from its extension
    pub async fn load_chunked(
        &self,
        path: &Path,
        table: &str,
        run_id: &str,
        mapping: &ColumnMapping,
        chunk_size: usize,
    ) -> LoadResult<LoadReport> {
        let parser = self.registry.for_path(path)?;
        self.load_with_parser(parser, path, table, run_id, mapping, chunk_size)
            .await
    }

    /// Load a file with a given parser
    pub async fn load_with_parser(
        &self,
        parser: Arc<dyn SourceParser>,
        path: &Path,
        table: &str,
        run_id: &str,
        mapping: &ColumnMapping,
        chunk_size: usize,
    ) -> LoadResult<LoadReport> {
        let result = self
            .stream(parser, path, table, run_id, mapping, chunk_size.max(1))
            .await;

        if let Some(progress) = &self.progress {
            match &result {
                Ok(report) => progress.finished(report.rows_loaded, None),
                Err(e) => progress.finished(0, Some(&e.to_string())),
            }
        }
        result
    }

    async fn stream(
        &self,
        parser: Arc<dyn SourceParser>,
        path: &Path,
        table: &str,
        run_id: &str,
        mapping: &ColumnMapping,
        chunk_size: usize,
    ) -> LoadResult<LoadReport> {
        let table_columns = self.store.table_columns(table).await?;

        let owned_path = path.to_path_buf();
        let mut reader = tokio::task::spawn_blocking(move || parser.open(&owned_path))
            .await
            .map_err(worker_error)??;

        let shape = ChunkShape::new(table, reader.headers(), mapping, &table_columns)?;
        let columns = Arc::new(shape.columns().to_vec());
        tracing::info!(
            file = %path.display(),
            table,
            run_id,
            columns = columns.len(),
            chunk_size,
            "Starting chunked load"
        );

        let gauge = ChunkGauge::new();
        let mut uploads: JoinSet<StoreResult<u64>> = JoinSet::new();
        let mut report = LoadReport::default();

        loop {
            if uploads.len() >= self.concurrency {
                if let Some(joined) = uploads.join_next().await {
                    self.settle(joined, &mut report)
                        .inspect_err(|_| uploads.abort_all())?;
                }
            }

            let token = gauge.acquire();
            let (returned, records) = tokio::task::spawn_blocking(move || {
                let records = reader.read_chunk(chunk_size);
                (reader, records)
            })
            .await
            .map_err(worker_error)?;
            reader = returned;

            let records = match records {
                Ok(records) => records,
                Err(e) => {
                    uploads.abort_all();
                    return Err(e);
                }
            };
            if records.is_empty() {
                drop(token);
                break;
            }

            let rows = shape.apply(records, run_id);
            report.chunks += 1;
            tracing::debug!(table, chunk = report.chunks, rows = rows.len(), "Dispatching chunk");

            let store = Arc::clone(&self.store);
            let columns = Arc::clone(&columns);
            let table = table.to_string();
            uploads.spawn(async move {
                let _token = token;
                store.insert_rows(&table, &columns, &rows).await
            });
        }

        while let Some(joined) = uploads.join_next().await {
            self.settle(joined, &mut report)
                .inspect_err(|_| uploads.abort_all())?;
        }

        report.peak_chunks_in_memory = gauge.peak();
        tracing::info!(
            table,
            run_id,
            rows = report.rows_loaded,
            chunks = report.chunks,
            "Chunked load finished"
        );
        Ok(report)
    }

    fn settle(
        &self,
        joined: Result<StoreResult<u64>, JoinError>,
        report: &mut LoadReport,
    ) -> LoadResult<()> {
        let rows = joined.map_err(worker_error)??;
        report.rows_loaded += rows;
        if let Some(progress) = &self.progress {
            progress.chunk_loaded(rows, report.rows_loaded);
        }
        Ok(())
    }
}

fn worker_error(e: JoinError) -> LoadError {
    LoadError::Worker(e.to_string())
}
