use super::{truncate, CaseJob, OperationError, StageOperation};
use crate::process::{parse_result, run_command, EXIT_SUCCESS, EXIT_TERMINAL};
use crate::types::{ProcessOutput, Stage};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

/// Runs each fill in a fresh child process (`fill-one`), so a browser crash
/// or a hung form only takes down that case
pub struct IsolatedFill {
    exe: PathBuf,
    root: PathBuf,
    config: Option<PathBuf>,
}

impl IsolatedFill {
    pub fn new(exe: PathBuf, root: PathBuf, config: Option<PathBuf>) -> Self {
        Self { exe, root, config }
    }

    fn args(&self, job: &CaseJob) -> Vec<String> {
        let mut args = vec![
            "--root".to_string(),
            self.root.to_string_lossy().to_string(),
        ];
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().to_string());
        }
        args.push("fill-one".to_string());
        args.push(job.id.as_str().to_string());
        args
    }
}

/// Classify a finished child by its exit code
fn classify_exit(output: &ProcessOutput) -> Result<(), OperationError> {
    if output.exit_code == EXIT_SUCCESS {
        return Ok(());
    }

    let parsed = parse_result(&output.stdout_text());
    let reason = match parsed.value.get("error").and_then(|e| e.as_str()) {
        Some(error) => error.to_string(),
        None if parsed.is_raw => parsed.value.as_str().unwrap_or_default().to_string(),
        None if !output.stderr.trim().is_empty() => truncate(output.stderr.trim(), 500),
        None => format!("fill-one exited with code {}", output.exit_code),
    };

    if output.exit_code == EXIT_TERMINAL {
        Err(OperationError::Terminal(reason))
    } else {
        Err(OperationError::Transient(reason))
    }
}

#[async_trait]
impl StageOperation for IsolatedFill {
    fn stage(&self) -> Stage {
        Stage::Fill
    }

    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        let args = self.args(job);
        debug!(case = %job.id, args = ?args, "Spawning fill worker");
        let output = run_command(&self.exe.to_string_lossy(), &args, None)
            .await
            .map_err(|e| OperationError::terminal(format!("{:#}", e)))?;
        classify_exit(&output)?;
        Ok(None)
    }
}
