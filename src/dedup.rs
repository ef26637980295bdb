//! Best-effort duplicate suppression on published files.
//!
//! Runs after a cache publishes its target: the file's decompressed
//! rows are read back, duplicates dropped and the file republished
//! when anything changed. Whole-row duplicates keep their first
//! occurrence. When a field subset is configured for a tabular file,
//! rows project onto those columns and the last occurrence wins, so
//! later data supersedes earlier rows with the same identity.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use log::warn;

use crate::compression::CompressionCodec;
use crate::storage::StorageDriver;
use crate::Result;

/// Per-topic dedup configuration.
#[derive(Debug, Clone, Default)]
pub struct DedupSettings {
    /// Whether publishes run the dedup pass at all.
    pub enabled: bool,
    /// Column subset forming the row identity; empty means whole-row.
    pub fields: Vec<String>,
}

/// Deduplicates a published target in place. `entry` is the inner file
/// name for archive codecs; `csv` enables field-subset projection.
pub fn deduplicate_target(
    driver: &Arc<dyn StorageDriver>,
    codec: &Arc<dyn CompressionCodec>,
    target: &Path,
    entry: &str,
    settings: &DedupSettings,
    csv: bool,
    staging: &Path,
) -> Result<()> {
    let reader = codec.reader(driver.new_input_stream(target)?, entry)?;
    let lines: Vec<String> = BufReader::new(reader)
        .lines()
        .collect::<std::io::Result<_>>()?;
    if lines.len() <= 1 {
        return Ok(());
    }

    let kept = if csv && !settings.fields.is_empty() {
        keep_last_by_fields(&lines, &settings.fields)
    } else {
        keep_first_distinct(&lines)
    };
    if kept.len() == lines.len() {
        return Ok(());
    }

    let temp = tempfile::Builder::new()
        .prefix("dedup-")
        .tempfile_in(staging)?;
    let (file, staged) = temp.into_parts();
    let mut sink = codec.writer(file, None, entry)?;
    for line in &kept {
        writeln!(sink, "{line}")?;
    }
    sink.finish()?;
    driver.store(&staged, target)?;
    Ok(())
}

/// Whole-line distinct, first occurrence wins, order preserved.
fn keep_first_distinct(lines: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    lines
        .iter()
        .filter(|line| seen.insert(line.as_str()))
        .cloned()
        .collect()
}

/// Projects tabular rows onto the named columns; rows sharing a
/// projection keep only the last occurrence. The header row stays.
fn keep_last_by_fields(lines: &[String], fields: &[String]) -> Vec<String> {
    let header: Vec<&str> = lines[0].split(',').collect();
    let indices: Vec<usize> = fields
        .iter()
        .filter_map(|f| header.iter().position(|h| h == f))
        .collect();
    if indices.len() != fields.len() {
        warn!("dedup fields {fields:?} not all present in header, using whole rows");
        return keep_first_distinct(lines);
    }

    let key_of = |line: &str| -> Vec<String> {
        let cells: Vec<&str> = line.split(',').collect();
        indices
            .iter()
            .map(|&i| cells.get(i).copied().unwrap_or("").to_string())
            .collect()
    };

    // Walk backwards so the last occurrence of each identity is the
    // one retained.
    let mut seen = HashSet::new();
    let mut keep = vec![false; lines.len()];
    keep[0] = true;
    for (index, line) in lines.iter().enumerate().skip(1).rev() {
        if seen.insert(key_of(line)) {
            keep[index] = true;
        }
    }
    lines
        .iter()
        .zip(keep)
        .filter_map(|(line, kept)| kept.then(|| line.clone()))
        .collect()
}
