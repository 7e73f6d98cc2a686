//! Exact nearest-neighbor search over extracted embeddings

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::results::EmbeddingRow;

/// Neighbors requested per item, including the item itself
pub const DEFAULT_K: usize = 101;

/// One output line: an item and its most similar items, closest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRow {
    pub item_id: Value,
    pub similar_item_ids: Vec<Value>,
}

/// Brute-force index over squared L2 distance
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dim: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors
    pub fn len(&self) -> usize {
        self.data.len() / self.dim.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors; ids are assigned in insertion order starting at `len()`
    pub fn add<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> Result<()> {
        debug!(count = vectors.len(), dim = self.dim, "FlatL2Index::add: called");
        if let Some((i, bad)) = vectors.iter().enumerate().find(|(_, v)| v.as_ref().len() != self.dim) {
            return Err(eyre!(
                "Vector {} has dimension {}, index expects {}",
                i,
                bad.as_ref().len(),
                self.dim
            ));
        }
        self.data.reserve(vectors.len() * self.dim);
        for vector in vectors {
            self.data.extend_from_slice(vector.as_ref());
        }
        Ok(())
    }

    fn vector(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// The `k` nearest stored vectors for each query, closest first
    ///
    /// Ties are broken by insertion order. Fewer than `k` are returned when
    /// the index holds fewer vectors.
    pub fn search<V: AsRef<[f32]>>(&self, queries: &[V], k: usize) -> Result<Vec<Vec<usize>>> {
        debug!(queries = queries.len(), %k, "FlatL2Index::search: called");
        let n = self.len();
        let k = k.min(n);

        queries
            .iter()
            .map(|query| {
                let query = query.as_ref();
                if query.len() != self.dim {
                    return Err(eyre!("Query has dimension {}, index expects {}", query.len(), self.dim));
                }
                if k == 0 {
                    return Ok(Vec::new());
                }

                let mut scored: Vec<(f32, usize)> = (0..n).map(|i| (squared_l2(query, self.vector(i)), i)).collect();
                let by_distance = |a: &(f32, usize), b: &(f32, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
                if k < n {
                    scored.select_nth_unstable_by(k - 1, by_distance);
                    scored.truncate(k);
                }
                scored.sort_unstable_by(by_distance);
                Ok(scored.into_iter().map(|(_, i)| i).collect())
            })
            .collect()
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Find `chunk_{i}.jsonl` files in `dir`, ordered by `i`
pub fn chunk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    debug!(?dir, "chunk_files: called");
    let mut chunks: Vec<(usize, PathBuf)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.context(format!("Failed to list {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy();
        let index = name
            .strip_prefix("chunk_")
            .and_then(|rest| rest.strip_suffix(".jsonl"))
            .and_then(|i| i.parse::<usize>().ok());
        if let Some(index) = index {
            chunks.push((index, entry.into_path()));
        }
    }
    chunks.sort_by_key(|(index, _)| *index);
    Ok(chunks.into_iter().map(|(_, path)| path).collect())
}

/// Load every embedding chunk in `dir` in chunk order
pub fn load_chunks(dir: &Path) -> Result<Vec<EmbeddingRow>> {
    let files = chunk_files(dir)?;
    if files.is_empty() {
        return Err(eyre!("No chunk_*.jsonl files in {}", dir.display()));
    }

    let mut rows = Vec::new();
    for path in &files {
        let file = File::open(path).context(format!("Failed to open {}", path.display()))?;
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: EmbeddingRow = serde_json::from_str(&line)
                .context(format!("Bad embedding row at {}:{}", path.display(), line_no + 1))?;
            rows.push(row);
        }
    }
    info!("Loaded {} embeddings from {} chunks", rows.len(), files.len());
    Ok(rows)
}

/// Build an index over `rows`, taking the dimension from the first row
pub fn build_index(rows: &[EmbeddingRow]) -> Result<FlatL2Index> {
    let dim = rows.first().map(|r| r.embedding.len()).ok_or_else(|| eyre!("No embeddings to index"))?;
    let mut index = FlatL2Index::new(dim);
    let vectors: Vec<&[f32]> = rows.iter().map(|r| r.embedding.as_slice()).collect();
    index.add(&vectors)?;
    Ok(index)
}

/// Search every row against `index` in batches and write one line per row
///
/// The row itself is dropped from its own neighbor list, so each line holds
/// up to `k - 1` similar ids. Output is flushed after each batch.
pub fn batch_search_and_save(
    index: &FlatL2Index,
    rows: &[EmbeddingRow],
    k: usize,
    batch_size: usize,
    out: &Path,
) -> Result<usize> {
    debug!(rows = rows.len(), %k, %batch_size, ?out, "batch_search_and_save: called");
    if batch_size == 0 {
        return Err(eyre!("batch size must be positive"));
    }
    if index.len() != rows.len() {
        return Err(eyre!(
            "index holds {} vectors but {} rows were given; build the index from the same rows",
            index.len(),
            rows.len()
        ));
    }
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(out).context(format!("Failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    let batches = rows.len().div_ceil(batch_size);

    let mut written = 0usize;
    for (batch_no, batch) in rows.chunks(batch_size).enumerate() {
        let start = batch_no * batch_size;
        let queries: Vec<&[f32]> = batch.iter().map(|r| r.embedding.as_slice()).collect();
        let neighbors = index.search(&queries, k)?;

        for (offset, (row, found)) in batch.iter().zip(neighbors).enumerate() {
            let own = start + offset;
            let mut found = found;
            match found.iter().position(|&i| i == own) {
                Some(pos) => {
                    found.remove(pos);
                }
                None => {
                    // Exact duplicates can crowd the row out of its own list
                    found.pop();
                }
            }
            let line = NeighborRow {
                item_id: row.item_id.clone(),
                similar_item_ids: found.into_iter().map(|i| rows[i].item_id.clone()).collect(),
            };
            serde_json::to_writer(&mut writer, &line)?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush()?;
        info!("Neighbor search batch {}/{} done", batch_no + 1, batches);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn row(id: &str, embedding: Vec<f32>) -> EmbeddingRow {
        EmbeddingRow {
            item_id: json!(id),
            embedding,
        }
    }

    #[test]
    fn test_search_orders_by_distance() {
        let mut index = FlatL2Index::new(2);
        index.add(&[vec![0.0f32, 0.0], vec![10.0, 0.0], vec![1.0, 0.0], vec![3.0, 0.0]]).unwrap();

        let found = index.search(&[vec![0.0f32, 0.0]], 3).unwrap();
        assert_eq!(found, vec![vec![0, 2, 3]]);

        let found = index.search(&[vec![9.0f32, 0.0]], 10).unwrap();
        assert_eq!(found, vec![vec![1, 3, 2, 0]]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = FlatL2Index::new(3);
        assert!(index.add(&[vec![1.0f32, 2.0]]).is_err());
        assert!(index.is_empty());
        index.add(&[vec![1.0f32, 2.0, 3.0]]).unwrap();
        assert!(index.search(&[vec![1.0f32]], 1).is_err());
    }

    #[test]
    fn test_chunk_files_are_numerically_ordered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["chunk_10.jsonl", "chunk_2.jsonl", "chunk_0.jsonl", "notes.txt", "chunk_x.jsonl"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }

        let files = chunk_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["chunk_0.jsonl", "chunk_2.jsonl", "chunk_10.jsonl"]);
    }

    #[test]
    fn test_batch_search_drops_self() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("neighbors.jsonl");
        let rows = vec![
            row("a", vec![0.0, 0.0]),
            row("b", vec![1.0, 0.0]),
            row("c", vec![5.0, 0.0]),
            row("d", vec![0.0, 2.0]),
        ];
        let index = build_index(&rows).unwrap();

        let written = batch_search_and_save(&index, &rows, 3, 3, &out).unwrap();
        assert_eq!(written, 4);

        let lines: Vec<NeighborRow> = std::fs::read_to_string(&out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines[0].item_id, json!("a"));
        assert_eq!(lines[0].similar_item_ids, vec![json!("b"), json!("d")]);
        assert_eq!(lines[2].similar_item_ids, vec![json!("b"), json!("a")]);
        assert!(lines.iter().all(|l| !l.similar_item_ids.contains(&l.item_id)));
    }

    #[test]
    fn test_batch_search_rejects_index_from_other_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("neighbors.jsonl");
        let rows = vec![
            row("a", vec![0.0, 0.0]),
            row("b", vec![1.0, 0.0]),
            row("c", vec![5.0, 0.0]),
        ];
        let index = build_index(&rows[..2]).unwrap();

        let err = batch_search_and_save(&index, &rows, 3, 2, &out).unwrap_err();
        assert!(err.to_string().contains("index holds 2 vectors but 3 rows"));
        assert!(!out.exists());
    }

    #[test]
    fn test_load_chunks_round_trip_with_extraction_layout() {
        let dir = tempfile::tempdir().unwrap();
        crate::jobs::save_jsonl(&[row("a", vec![1.0])], &dir.path().join("chunk_1.jsonl")).unwrap();
        crate::jobs::save_jsonl(&[row("z", vec![0.0])], &dir.path().join("chunk_0.jsonl")).unwrap();

        let rows = load_chunks(dir.path()).unwrap();
        let ids: Vec<&Value> = rows.iter().map(|r| &r.item_id).collect();
        assert_eq!(ids, vec![&json!("z"), &json!("a")]);
    }

    proptest! {
        #[test]
        fn prop_search_matches_full_sort(
            points in prop::collection::vec(prop::collection::vec(-100.0f32..100.0, 3), 1..40),
            query in prop::collection::vec(-100.0f32..100.0, 3),
            k in 1usize..10,
        ) {
            let mut index = FlatL2Index::new(3);
            index.add(&points).unwrap();

            let found = index.search(&[query.clone()], k).unwrap().remove(0);

            let mut expected: Vec<(f32, usize)> = points
                .iter()
                .enumerate()
                .map(|(i, p)| (squared_l2(&query, p), i))
                .collect();
            expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            let expected: Vec<usize> = expected.into_iter().take(k).map(|(_, i)| i).collect();
            prop_assert_eq!(found, expected);
        }
    }
}
