use crate::error::PipelineError;
use crate::ledger::RetryLedger;
use crate::operations::{CaseJob, OperationError, StageOperation};
use crate::repository::FileStateRepository;
use crate::retry::{RetryPolicy, RetryState};
use crate::types::{CaseId, Stage, StageResult, Subfolder};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// What happened to a case after one runner invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Processed {
        output: Option<PathBuf>,
        /// The output already existed from an interrupted run; the operation was not called
        recovered: bool,
    },
    /// Left in the stage root for another attempt
    Retrying { attempts: u32, reason: String },
    Pending { attempts: u32, reason: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessed,
    AlreadyPending,
    /// No input artifact in the stage root
    NotQueued,
}

/// Result of the cheap checks made before a case reaches its operation
#[derive(Debug)]
pub enum Prepared {
    Settled(RunOutcome),
    Job(CaseJob),
}

/// Applies one stage operation to one case and files the artifact
pub struct StageRunner<'a> {
    repo: &'a FileStateRepository,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<'a> StageRunner<'a> {
    pub fn new(repo: &'a FileStateRepository, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            repo,
            policy,
            timeout,
        }
    }

    /// Run the stage for `id`. Operation failures never surface as `Err`;
    /// only storage problems while filing the artifact do.
    #[cfg(test)]
    pub async fn run(
        &self,
        operation: &dyn StageOperation,
        id: &CaseId,
        ledger: &mut RetryLedger,
    ) -> Result<RunOutcome, PipelineError> {
        match self.prepare(operation.stage(), id, ledger)? {
            Prepared::Settled(outcome) => Ok(outcome),
            Prepared::Job(job) => self.run_job(operation, job, ledger).await,
        }
    }

    /// Resolve every case that needs no operation call: already filed, not
    /// queued, or left with its output by an interrupted run.
    pub fn prepare(
        &self,
        stage: Stage,
        id: &CaseId,
        ledger: &mut RetryLedger,
    ) -> Result<Prepared, PipelineError> {
        if self.repo.exists_in_stage(id, stage, Subfolder::Processed)? {
            return Ok(Prepared::Settled(RunOutcome::Skipped(
                SkipReason::AlreadyProcessed,
            )));
        }
        if self.repo.exists_in_stage(id, stage, Subfolder::Pending)? {
            return Ok(Prepared::Settled(RunOutcome::Skipped(
                SkipReason::AlreadyPending,
            )));
        }
        let Some(input) = self.repo.locate(id, stage, Subfolder::Root)? else {
            return Ok(Prepared::Settled(RunOutcome::Skipped(SkipReason::NotQueued)));
        };

        let output = self.repo.output_path(id, stage);

        // Output written but input never moved: finish the interrupted transition
        if self.repo.output_exists(id, stage)? {
            self.file_input(stage, &input, Subfolder::Processed)?;
            self.forget(stage, id, ledger)?;
            info!(case = %id, stage = %stage, "Recovered completed case");
            return Ok(Prepared::Settled(RunOutcome::Processed {
                output,
                recovered: true,
            }));
        }

        Ok(Prepared::Job(CaseJob {
            id: id.clone(),
            input,
            output,
        }))
    }

    /// Call the operation on a prepared job and file the artifact by outcome
    pub async fn run_job(
        &self,
        operation: &dyn StageOperation,
        job: CaseJob,
        ledger: &mut RetryLedger,
    ) -> Result<RunOutcome, PipelineError> {
        let stage = operation.stage();
        let id = &job.id;
        let input = job.input.clone();
        let output = job.output.clone();
        let state = RetryState::from_attempts(ledger.attempts(stage, id));

        info!(case = %id, stage = %stage, attempt = state.attempts() + 1, "Running");
        let result = self.execute(operation, &job).await;

        match self.policy.transition(state, &result) {
            RetryState::Processed => {
                let produced = match result {
                    StageResult::Success(path) => path.or(output),
                    _ => output,
                };
                self.file_input(stage, &input, Subfolder::Processed)?;
                self.forget(stage, id, ledger)?;
                info!(case = %id, stage = %stage, "Processed");
                Ok(RunOutcome::Processed {
                    output: produced,
                    recovered: false,
                })
            }
            RetryState::Pending => {
                let reason = failure_reason(&result);
                let attempts = state.attempts() + 1;
                self.file_input(stage, &input, Subfolder::Pending)?;
                self.write_pending_record(id, stage, attempts, &reason)?;
                self.forget(stage, id, ledger)?;
                error!(
                    case = %id,
                    stage = %stage,
                    attempt = attempts,
                    error = %reason,
                    "Moved to Pending"
                );
                Ok(RunOutcome::Pending { attempts, reason })
            }
            RetryState::Fresh | RetryState::Retry(_) => {
                let reason = failure_reason(&result);
                let attempts = ledger.record_failure(stage, id, &reason);
                ledger.save(self.repo.store().as_ref())?;
                warn!(
                    case = %id,
                    stage = %stage,
                    attempt = attempts,
                    error = %reason,
                    "Transient failure, will retry"
                );
                Ok(RunOutcome::Retrying { attempts, reason })
            }
        }
    }

    /// Call the operation under the stage timeout and classify the outcome
    async fn execute(&self, operation: &dyn StageOperation, job: &CaseJob) -> StageResult {
        match tokio::time::timeout(self.timeout, operation.execute(job)).await {
            Err(_) => StageResult::TransientFailure(format!(
                "Timed out after {}s",
                self.timeout.as_secs_f64()
            )),
            Ok(Err(OperationError::Transient(reason))) => StageResult::TransientFailure(reason),
            Ok(Err(OperationError::Terminal(reason))) => StageResult::TerminalFailure(reason),
            Ok(Ok(produced)) => {
                let expected = produced.as_ref().or(job.output.as_ref());
                match expected {
                    Some(path) if !self.repo.store().exists(path) => {
                        StageResult::TransientFailure(format!(
                            "Operation reported success but {} was not written",
                            path.display()
                        ))
                    }
                    _ => StageResult::Success(produced),
                }
            }
        }
    }

    /// Move the consumed artifact into a subfolder of its stage.
    /// The download queue is a shared list file, so nothing moves for it.
    fn file_input(&self, stage: Stage, input: &Path, sub: Subfolder) -> Result<(), PipelineError> {
        if stage == Stage::Download {
            return Ok(());
        }
        let Some(file_name) = input.file_name() else {
            return Ok(());
        };
        let target = self.repo.layout().subfolder(stage, sub).join(file_name);
        self.repo.store().rename(input, &target)?;
        Ok(())
    }

    fn write_pending_record(
        &self,
        id: &CaseId,
        stage: Stage,
        attempts: u32,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let record = format!(
            "case: {}\nstage: {}\nattempts: {}\nerror: {}\ntimestamp: {}\n",
            id, stage, attempts, reason, timestamp
        );
        let path = self.repo.pending_record_path(id, stage);
        self.repo.store().write(&path, record.as_bytes())?;
        Ok(())
    }

    fn forget(
        &self,
        stage: Stage,
        id: &CaseId,
        ledger: &mut RetryLedger,
    ) -> Result<(), PipelineError> {
        if ledger.clear(stage, id) {
            ledger.save(self.repo.store().as_ref())?;
        }
        Ok(())
    }
}

fn failure_reason(result: &StageResult) -> String {
    match result {
        StageResult::TransientFailure(reason) | StageResult::TerminalFailure(reason) => {
            reason.clone()
        }
        StageResult::Success(_) => String::new(),
    }
}
