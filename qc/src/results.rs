//! Result extraction
//!
//! Reads the outcome records written by the dispatcher and pulls out the
//! parts downstream steps need: embedding vectors (chunked) and generated
//! query pairs. Failed records are reported by id so they can be re-run.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatcher::{JobResult, Outcome};
use crate::jobs::QueryResponse;

/// Rows per embedding chunk file unless told otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// One extracted embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub item_id: Value,
    pub embedding: Vec<f32>,
}

/// One extracted query pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRow {
    pub id: Value,
    pub reasoning: String,
    pub short_query: String,
    pub long_query: String,
}

/// What an extraction pass produced
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Extraction {
    /// Rows written
    pub written: usize,
    /// Files written, in order
    pub files: Vec<PathBuf>,
    /// Ids whose record was a failure or lacked the expected content
    pub failed_ids: Vec<Value>,
    /// Lines that were not outcome records at all
    pub malformed: usize,
}

/// Path of the `index`-th embedding chunk in `dir`
pub fn chunk_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("chunk_{}.jsonl", index))
}

/// Call `f` with each outcome record in a results file
///
/// Lines that do not decode into a record are counted and skipped.
fn for_each_record<F>(results: &Path, mut f: F) -> Result<usize>
where
    F: FnMut(JobResult) -> Result<()>,
{
    let file = File::open(results).context(format!("Failed to open results file {}", results.display()))?;
    let mut malformed = 0usize;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context("Failed to read results file")?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Value>(&line).ok().and_then(JobResult::from_record);
        match record {
            Some(record) => f(record)?,
            None => {
                warn!(line = line_no + 1, "Skipping line that is not an outcome record");
                malformed += 1;
            }
        }
    }
    Ok(malformed)
}

fn record_id(record: &JobResult, id_key: &str) -> Option<Value> {
    record.metadata.as_ref()?.get(id_key).cloned()
}

fn embedding_of(response: &Value) -> Option<Vec<f32>> {
    response
        .get("data")?
        .get(0)?
        .get("embedding")?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn query_of(response: &Value) -> Option<QueryResponse> {
    let content = response.get("choices")?.get(0)?.get("message")?.get("content")?.as_str()?;
    serde_json::from_str(content).ok()
}

struct ChunkWriter {
    dir: PathBuf,
    chunk_size: usize,
    rows: Vec<EmbeddingRow>,
    files: Vec<PathBuf>,
}

impl ChunkWriter {
    fn push(&mut self, row: EmbeddingRow) -> Result<()> {
        self.rows.push(row);
        if self.rows.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let path = chunk_path(&self.dir, self.files.len());
        debug!(?path, rows = self.rows.len(), "ChunkWriter::flush: called");
        crate::jobs::save_jsonl(&self.rows, &path)?;
        self.rows.clear();
        self.files.push(path);
        Ok(())
    }
}

/// Extract embeddings into `chunk_{i}.jsonl` files of at most `chunk_size` rows
pub fn extract_embeddings(results: &Path, id_key: &str, chunk_size: usize, out_dir: &Path) -> Result<Extraction> {
    debug!(?results, %id_key, %chunk_size, ?out_dir, "extract_embeddings: called");
    if chunk_size == 0 {
        return Err(eyre!("chunk size must be positive"));
    }
    std::fs::create_dir_all(out_dir).context(format!("Failed to create {}", out_dir.display()))?;

    let mut writer = ChunkWriter {
        dir: out_dir.to_path_buf(),
        chunk_size,
        rows: Vec::new(),
        files: Vec::new(),
    };
    let mut extraction = Extraction::default();

    let malformed = for_each_record(results, |record| {
        let Some(item_id) = record_id(&record, id_key) else {
            warn!(%id_key, "extract_embeddings: record has no id, skipping");
            extraction.malformed += 1;
            return Ok(());
        };
        let embedding = match &record.outcome {
            Outcome::Success(response) => embedding_of(response),
            Outcome::Failure(_) => None,
        };
        match embedding {
            Some(embedding) => {
                writer.push(EmbeddingRow { item_id, embedding })?;
                extraction.written += 1;
            }
            None => {
                warn!(%item_id, "extract_embeddings: no embedding in record");
                extraction.failed_ids.push(item_id);
            }
        }
        Ok(())
    })?;

    writer.flush()?;
    extraction.malformed += malformed;
    extraction.files = writer.files;

    info!(
        "Extracted {} embeddings into {} chunks ({} failed, {} malformed)",
        extraction.written,
        extraction.files.len(),
        extraction.failed_ids.len(),
        extraction.malformed
    );
    Ok(extraction)
}

/// Extract generated query pairs into a JSONL file
pub fn extract_queries(results: &Path, id_key: &str, out: &Path) -> Result<Extraction> {
    debug!(?results, %id_key, ?out, "extract_queries: called");
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(out).context(format!("Failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let mut extraction = Extraction::default();

    let malformed = for_each_record(results, |record| {
        let Some(id) = record_id(&record, id_key) else {
            warn!(%id_key, "extract_queries: record has no id, skipping");
            extraction.malformed += 1;
            return Ok(());
        };
        let query = match &record.outcome {
            Outcome::Success(response) => query_of(response),
            Outcome::Failure(_) => None,
        };
        match query {
            Some(QueryResponse {
                reasoning,
                short_query,
                long_query,
            }) => {
                let row = QueryRow {
                    id,
                    reasoning,
                    short_query,
                    long_query,
                };
                serde_json::to_writer(&mut writer, &row)?;
                writer.write_all(b"\n")?;
                extraction.written += 1;
            }
            None => {
                warn!(%id, "extract_queries: no parsable answer in record");
                extraction.failed_ids.push(id);
            }
        }
        Ok(())
    })?;
    writer.flush()?;

    extraction.malformed += malformed;
    extraction.files.push(out.to_path_buf());
    info!(
        "Extracted {} query pairs ({} failed, {} malformed)",
        extraction.written,
        extraction.failed_ids.len(),
        extraction.malformed
    );
    Ok(extraction)
}
