//! On-disk directory convention under the data root

use super::ConfigError;
use crate::ledger::{EntityId, Pair};
use crate::persist::PersistError;
use std::path::{Path, PathBuf};

/// Where every state file and output lives
///
/// ```text
/// <root>/
///   cache/          job_status.json, entity_resolution_cache.json,
///                   batch_jobs.json, failed_requests.json, aggregates.json
///   intermediate/   <entity>_<topic>_filtered.csv
///   client_data/    mk_data/<entity>/{main.json,<topic>.csv}, topics/<topic>.json
///   config/         prompts
///   input/          mks.txt, topics.txt
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::new("data")
    }
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.cache_dir().join("job_status.json")
    }

    pub fn resolution_cache_path(&self) -> PathBuf {
        self.cache_dir().join("entity_resolution_cache.json")
    }

    pub fn batch_jobs_path(&self) -> PathBuf {
        self.cache_dir().join("batch_jobs.json")
    }

    pub fn failures_path(&self) -> PathBuf {
        self.cache_dir().join("failed_requests.json")
    }

    pub fn aggregates_path(&self) -> PathBuf {
        self.cache_dir().join("aggregates.json")
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        self.root.join("intermediate")
    }

    pub fn filtered_path(&self, pair: &Pair) -> PathBuf {
        self.intermediate_dir()
            .join(format!("{}_{}_filtered.csv", pair.entity_id, pair.topic))
    }

    pub fn client_data_dir(&self) -> PathBuf {
        self.root.join("client_data")
    }

    pub fn entity_dir(&self, entity: EntityId) -> PathBuf {
        self.client_data_dir().join("mk_data").join(entity.to_string())
    }

    pub fn scored_path(&self, pair: &Pair) -> PathBuf {
        self.entity_dir(pair.entity_id).join(format!("{}.csv", pair.topic))
    }

    pub fn entity_report_path(&self, entity: EntityId) -> PathBuf {
        self.entity_dir(entity).join("main.json")
    }

    pub fn topic_report_path(&self, topic: &str) -> PathBuf {
        self.client_data_dir().join("topics").join(format!("{}.json", topic))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn entities_input(&self) -> PathBuf {
        self.input_dir().join("mks.txt")
    }

    pub fn topics_input(&self) -> PathBuf {
        self.input_dir().join("topics.txt")
    }

    /// Create the directories the pipelines write into.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [self.cache_dir(), self.intermediate_dir(), self.client_data_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Read a one-item-per-line input file. Blank lines and `#` comments are
/// skipped.
pub fn read_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_follow_the_layout() {
        let layout = DataLayout::new("/srv/data");
        let pair = Pair::new(42, "economy");

        assert_eq!(layout.ledger_path(), PathBuf::from("/srv/data/cache/job_status.json"));
        assert_eq!(
            layout.filtered_path(&pair),
            PathBuf::from("/srv/data/intermediate/42_economy_filtered.csv")
        );
        assert_eq!(
            layout.scored_path(&pair),
            PathBuf::from("/srv/data/client_data/mk_data/42/economy.csv")
        );
        assert_eq!(
            layout.topic_report_path("economy"),
            PathBuf::from("/srv/data/client_data/topics/economy.json")
        );
    }

    #[test]
    fn read_list_skips_comments_and_blanks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topics.txt");
        std::fs::write(&path, "# topics\neconomy\n\n  housing  \n#defense\n").unwrap();

        assert_eq!(read_list(&path).unwrap(), vec!["economy", "housing"]);
        assert!(matches!(
            read_list(&dir.path().join("absent.txt")),
            Err(ConfigError::MissingFile(_))
        ));
    }
}
