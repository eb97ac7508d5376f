//! Source file parsers
//!
//! A parser turns a file into a header row plus chunks of text records. All
//! values stay strings; typing is the destination table's job.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{LoadError, LoadResult};

/// Opens source files of one format
pub trait SourceParser: Send + Sync {
    /// Parser name used in logs and for `parser_function` selection
    fn name(&self) -> &str;

    /// Open a file for chunked reading
    fn open(&self, path: &Path) -> LoadResult<Box<dyn RecordReader>>;
}

/// Sequential access to the records of one file
pub trait RecordReader: Send {
    fn headers(&self) -> &[String];

    /// Read up to `max_rows` records; an empty result means end of input.
    ///
    /// Every record has exactly one value per header.
    fn read_chunk(&mut self, max_rows: usize) -> LoadResult<Vec<Vec<String>>>;
}

/// Delimited text decoded as Latin-1
#[derive(Debug, Clone)]
pub struct DelimitedParser {
    name: String,
    delimiter: u8,
}

impl DelimitedParser {
    pub fn new(name: impl Into<String>, delimiter: u8) -> Self {
        Self {
            name: name.into(),
            delimiter,
        }
    }

    pub fn csv() -> Self {
        Self::new("csv", b',')
    }

    pub fn psv() -> Self {
        Self::new("psv", b'|')
    }

    pub fn tsv() -> Self {
        Self::new("tsv", b'\t')
    }
}

impl SourceParser for DelimitedParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: &Path) -> LoadResult<Box<dyn RecordReader>> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => LoadError::SourceAbsent(path.to_path_buf()),
            _ => LoadError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let header_record = reader
            .byte_headers()
            .map_err(|e| decode_error(path, e))?
            .clone();
        let headers = header_record
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let field = if i == 0 {
                    field.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(field)
                } else {
                    field
                };
                latin1(field).trim().to_string()
            })
            .collect();

        Ok(Box::new(DelimitedReader {
            path: path.to_path_buf(),
            reader,
            headers,
            record: csv::ByteRecord::new(),
        }))
    }
}

struct DelimitedReader {
    path: PathBuf,
    reader: csv::Reader<BufReader<File>>,
    headers: Vec<String>,
    record: csv::ByteRecord,
}

impl RecordReader for DelimitedReader {
    fn headers(&self) -> &[String] {
        &self.headers
    }

    fn read_chunk(&mut self, max_rows: usize) -> LoadResult<Vec<Vec<String>>> {
        let width = self.headers.len();
        let mut rows = Vec::with_capacity(max_rows.min(1024));

        while rows.len() < max_rows {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|e| decode_error(&self.path, e))?;
            if !more {
                break;
            }
            let mut values: Vec<String> = self.record.iter().take(width).map(latin1).collect();
            values.resize(width, String::new());
            rows.push(values);
        }

        Ok(rows)
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_error(path: &Path, e: csv::Error) -> LoadError {
    LoadError::Decode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Parsers by file type, plus named custom parsers behind an allow-list
#[derive(Clone, Default)]
pub struct ParserRegistry {
    by_type: HashMap<String, Arc<dyn SourceParser>>,
    custom: HashMap<String, Arc<dyn SourceParser>>,
    allowed: HashSet<String>,
}

impl ParserRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the delimited text parsers (`csv`, `psv`, `tsv`, `txt`)
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_type("csv", Arc::new(DelimitedParser::csv()));
        registry.register_type("psv", Arc::new(DelimitedParser::psv()));
        registry.register_type("tsv", Arc::new(DelimitedParser::tsv()));
        registry.register_type("txt", Arc::new(DelimitedParser::tsv()));
        registry
    }

    pub fn register_type(&mut self, file_type: &str, parser: Arc<dyn SourceParser>) {
        self.by_type.insert(normalize(file_type), parser);
    }

    /// Register a named parser; it stays unusable until allowed
    pub fn register_custom(&mut self, name: &str, parser: Arc<dyn SourceParser>) {
        self.custom.insert(name.trim().to_string(), parser);
    }

    /// Permit configurations to select a custom parser by name
    pub fn allow(&mut self, name: &str) {
        self.allowed.insert(name.trim().to_string());
    }

    /// Pick the parser for a configuration.
    ///
    /// A non-blank `parser_function` must be registered and allowed;
    /// otherwise the parser is chosen by `file_type`.
    pub fn resolve(
        &self,
        file_type: &str,
        parser_function: Option<&str>,
    ) -> LoadResult<Arc<dyn SourceParser>> {
        if let Some(name) = parser_function.map(str::trim).filter(|n| !n.is_empty()) {
            if !self.allowed.contains(name) {
                return Err(LoadError::ParserNotAllowed(name.to_string()));
            }
            return self
                .custom
                .get(name)
                .cloned()
                .ok_or_else(|| LoadError::ParserNotAllowed(name.to_string()));
        }

        self.by_type
            .get(&normalize(file_type))
            .cloned()
            .ok_or_else(|| LoadError::UnsupportedFileType(file_type.to_string()))
    }

    /// Pick the parser from a file's extension
    pub fn for_path(&self, path: &Path) -> LoadResult<Arc<dyn SourceParser>> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        self.resolve(extension, None)
    }
}

fn normalize(file_type: &str) -> String {
    file_type.trim().trim_start_matches('.').to_lowercase()
}

/// Read only the header row of a file
pub async fn read_headers(parser: Arc<dyn SourceParser>, path: &Path) -> LoadResult<Vec<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || parser.open(&path).map(|r| r.headers().to_vec()))
        .await
        .map_err(|e| LoadError::Worker(e.to_string()))?
}
