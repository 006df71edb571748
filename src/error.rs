use crate::types::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a whole run rather than a single case
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(&'static str),

    #[error("Config validation failed: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Directory does not exist: {0}")]
    DirectoryMissing(PathBuf),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to list directory '{path}': {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    Move {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove file '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Directory for stage {stage} is missing: {path}")]
    DirectoryMissing { stage: Stage, path: PathBuf },

    #[error("Case {id} has no artifact in {stage}/Pending")]
    NotPending { stage: Stage, id: String },

    #[error(transparent)]
    Store(StoreError),
}

impl RepositoryError {
    pub fn is_directory_missing(&self) -> bool {
        matches!(self, RepositoryError::DirectoryMissing { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid case identifier '{0}': expected 20 digits")]
pub struct InvalidCaseId(pub String);
