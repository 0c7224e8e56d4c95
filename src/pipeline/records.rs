//! Phase output rows and their CSV files

use crate::persist::{read_csv, write_csv, PersistResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FILTERED_HEADERS: &[&str] = &["Id", "Text", "RelevanceScore", "Date"];
pub const SCORED_HEADERS: &[&str] = &["Id", "Date", "Topic", "Text", "Rank", "Reasoning"];

/// A work unit that passed the relevance threshold for one topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredRecord {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Text")]
    pub text: String,
    #[serde(rename = "RelevanceScore")]
    pub relevance_score: u8,
    #[serde(rename = "Date", default)]
    pub date: String,
}

/// A stance score for one filtered record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredRecord {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Text")]
    pub text: String,
    /// Stance, 1 (strongly opposes) to 10 (strongly supports)
    #[serde(rename = "Rank")]
    pub stance_score: u8,
    /// Empty unless reasoning was sampled for this record
    #[serde(rename = "Reasoning", default)]
    pub reasoning: String,
}

pub fn write_filtered(path: &Path, records: &[FilteredRecord]) -> PersistResult<()> {
    write_csv(path, FILTERED_HEADERS, records)
}

/// `Ok(None)` when the file does not exist.
pub fn read_filtered(path: &Path) -> PersistResult<Option<Vec<FilteredRecord>>> {
    read_csv(path)
}

pub fn write_scored(path: &Path, records: &[ScoredRecord]) -> PersistResult<()> {
    write_csv(path, SCORED_HEADERS, records)
}

pub fn read_scored(path: &Path) -> PersistResult<Option<Vec<ScoredRecord>>> {
    read_csv(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn filtered_file_keeps_multiline_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1_economy_filtered.csv");
        let records = vec![FilteredRecord {
            id: 9,
            text: "line one,\n\"quoted\" line two".into(),
            relevance_score: 4,
            date: "2020-01-01".into(),
        }];
        write_filtered(&path, &records).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.starts_with("Id,Text,RelevanceScore,Date\n"));
        assert_eq!(read_filtered(&path).unwrap().unwrap(), records);
    }

    #[test]
    fn empty_scored_file_has_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("economy.csv");
        write_scored(&path, &[]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Id,Date,Topic,Text,Rank,Reasoning\n");
        assert_eq!(read_scored(&path).unwrap().unwrap(), Vec::new());
        assert!(read_scored(&dir.path().join("absent.csv")).unwrap().is_none());
    }
}
