//! Configuration: scalar knobs, prompt templates, and the data directory
//! layout

mod layout;
mod prompts;
mod settings;

pub use layout::{read_list, DataLayout};
pub use prompts::PromptSet;
pub use settings::PipelineConfig;

use crate::persist::PersistError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    OutOfRange(String),

    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
