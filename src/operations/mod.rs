mod download;
mod fill;
mod isolated;
mod ocr;
mod report;

pub use download::DownloadOperation;
pub use fill::FillOperation;
pub use isolated::IsolatedFill;
pub use ocr::{available_cores, OcrOperation};
pub use report::ReportOperation;

use crate::browser::SessionControl;
use crate::error::{ConfigError, StoreError};
use crate::types::{CaseId, Stage};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// One unit of work handed to an operation
#[derive(Debug, Clone)]
pub struct CaseJob {
    pub id: CaseId,
    /// Artifact consumed by the stage (the case list for downloads)
    pub input: PathBuf,
    /// Where the stage must write its output, if it produces one
    pub output: Option<PathBuf>,
}

/// Failure of a single operation call, classified for the retry policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Terminal(String),
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        OperationError::Transient(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        OperationError::Terminal(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationError::Terminal(_))
    }

    /// Classify an HTTP status from one of the remote APIs. Auth and request
    /// errors will not fix themselves; throttling and server errors might.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 300));
        match status {
            400 | 401 | 403 | 404 | 422 => OperationError::Terminal(message),
            _ => OperationError::Transient(message),
        }
    }
}

impl From<ConfigError> for OperationError {
    fn from(e: ConfigError) -> Self {
        OperationError::Terminal(e.to_string())
    }
}

impl From<StoreError> for OperationError {
    fn from(e: StoreError) -> Self {
        OperationError::Transient(e.to_string())
    }
}

impl From<reqwest::Error> for OperationError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => OperationError::from_status(status.as_u16(), &e.to_string()),
            None => OperationError::Transient(e.to_string()),
        }
    }
}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        OperationError::Transient(e.to_string())
    }
}

/// Work a stage performs on one case. Operations only produce artifacts;
/// the stage runner moves files between subfolders.
#[async_trait]
pub trait StageOperation: Send + Sync {
    fn stage(&self) -> Stage;

    /// Run the operation. On success returns the output artifact written,
    /// which must be `job.output` when the stage has one.
    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError>;

    /// Long-lived actuator the coordinator resets between cases
    fn session(&self) -> Option<Arc<dyn SessionControl>> {
        None
    }
}

/// The operation wired to each stage
#[derive(Default, Clone)]
pub struct OperationSet {
    operations: BTreeMap<Stage, Arc<dyn StageOperation>>,
}

impl OperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: Arc<dyn StageOperation>) -> Self {
        self.operations.insert(operation.stage(), operation);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageOperation>> {
        self.operations.get(&stage).cloned()
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
