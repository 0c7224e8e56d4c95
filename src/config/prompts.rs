//! Prompt templates loaded from the config directory
//!
//! ```text
//! config/
//!   filter_prompt.txt          contains a {topic_descriptions} placeholder
//!   topic_descriptions.yaml    topic: one-line description
//!   scoring_prompts/<topic>.txt
//! ```

use super::ConfigError;
use crate::persist::PersistError;
use std::collections::BTreeMap;
use std::path::Path;

const TOPIC_PLACEHOLDER: &str = "{topic_descriptions}";

/// Filter template, topic descriptions, and per-topic scoring prompts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptSet {
    filter_template: String,
    descriptions: BTreeMap<String, String>,
    scoring: BTreeMap<String, String>,
}

fn read_text(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    std::fs::read_to_string(path).map_err(|e| PersistError::io(path, e).into())
}

impl PromptSet {
    pub fn new(
        filter_template: impl Into<String>,
        descriptions: BTreeMap<String, String>,
        scoring: BTreeMap<String, String>,
    ) -> Self {
        Self {
            filter_template: filter_template.into(),
            descriptions,
            scoring,
        }
    }

    /// Load everything under `dir`. Scoring prompts are optional per topic;
    /// `validate` reports which ones are missing.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let filter_template = read_text(&dir.join("filter_prompt.txt"))?;

        let desc_path = dir.join("topic_descriptions.yaml");
        let raw = read_text(&desc_path)?;
        let descriptions: BTreeMap<String, String> = if raw.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_yaml::from_str(&raw).map_err(|source| PersistError::Yaml {
                path: desc_path.clone(),
                source,
            })?
        };

        let mut scoring = BTreeMap::new();
        let scoring_dir = dir.join("scoring_prompts");
        if scoring_dir.is_dir() {
            let entries = std::fs::read_dir(&scoring_dir).map_err(|e| PersistError::io(&scoring_dir, e))?;
            for entry in entries {
                let path = entry.map_err(|e| PersistError::io(&scoring_dir, e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                    continue;
                }
                if let Some(topic) = path.file_stem().and_then(|s| s.to_str()) {
                    scoring.insert(topic.to_string(), read_text(&path)?);
                }
            }
        }

        Ok(Self::new(filter_template, descriptions, scoring))
    }

    /// Problems that would stop `topics` from being processed.
    pub fn validate(&self, topics: &[String]) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.filter_template.contains(TOPIC_PLACEHOLDER) {
            problems.push(format!("filter prompt has no {} placeholder", TOPIC_PLACEHOLDER));
        }
        for topic in topics {
            if !self.descriptions.contains_key(topic) {
                problems.push(format!("no description for topic '{}'", topic));
            }
            if !self.scoring.contains_key(topic) {
                problems.push(format!("no scoring prompt for topic '{}'", topic));
            }
        }
        problems
    }

    /// The filter template with descriptions of `topics` spliced in.
    /// Topics without a description are left out of the list.
    pub fn filter_instructions(&self, topics: &[String]) -> String {
        let listing = topics
            .iter()
            .filter_map(|t| self.descriptions.get(t).map(|d| format!("- {}: {}", t, d)))
            .collect::<Vec<_>>()
            .join("\n");
        self.filter_template.replace(TOPIC_PLACEHOLDER, &listing)
    }

    pub fn scoring_prompt(&self, topic: &str) -> Option<&str> {
        self.scoring.get(topic).map(String::as_str)
    }

    pub fn description(&self, topic: &str) -> Option<&str> {
        self.descriptions.get(topic).map(String::as_str)
    }
}
