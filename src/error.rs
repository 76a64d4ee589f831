//! Error types for driver operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EcdError>;

#[derive(Error, Debug)]
pub enum EcdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Script composition error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
