use crate::browser::SessionControl;
use crate::config::{Config, Timeouts};
use crate::error::PipelineError;
use crate::ledger::RetryLedger;
use crate::operations::{CaseJob, OperationError, OperationSet, StageOperation};
use crate::repository::{FileStateRepository, StageCounts};
use crate::retry::RetryPolicy;
use crate::runner::{Prepared, RunOutcome, StageRunner};
use crate::types::{CaseId, Stage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{error, info, warn};

/// What one stage did during a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub processed: usize,
    pub pending: usize,
    /// Still failing transiently when the run ended
    pub retrying: usize,
    pub skipped: usize,
    /// Cases whose artifact could not be filed
    pub errors: usize,
    /// Operation calls made (recovered cases do not count)
    pub executed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub stages: Vec<(Stage, StageSummary)>,
    /// Stopped early by Ctrl+C
    pub interrupted: bool,
}

/// Per-stage counts shown by `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStatus {
    pub stage: Stage,
    /// Waiting in the stage root and never attempted
    pub fresh: usize,
    pub retry: usize,
    pub processed: usize,
    pub pending: usize,
}

impl StageStatus {
    fn new(stage: Stage, counts: StageCounts, retry: usize) -> Self {
        let retry = retry.min(counts.fresh);
        Self {
            stage,
            fresh: counts.fresh - retry,
            retry,
            processed: counts.processed,
            pending: counts.pending,
        }
    }
}

/// Remembers a Ctrl+C seen while polling between cases
struct Shutdown<'a> {
    rx: &'a mut broadcast::Receiver<()>,
    requested: bool,
}

impl<'a> Shutdown<'a> {
    fn new(rx: &'a mut broadcast::Receiver<()>) -> Self {
        Self {
            rx,
            requested: false,
        }
    }

    fn requested(&mut self) -> bool {
        if !self.requested {
            self.requested = matches!(self.rx.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_)));
        }
        self.requested
    }

    /// Sleep for the cooldown unless a shutdown arrives first
    async fn cooldown(&mut self, duration: Duration) {
        if duration.is_zero() || self.requested {
            return;
        }
        let received = tokio::select! {
            _ = tokio::time::sleep(duration) => None,
            received = self.rx.recv() => Some(received),
        };
        match received {
            None => {}
            Some(Err(RecvError::Closed)) => tokio::time::sleep(duration).await,
            Some(_) => self.requested = true,
        }
    }
}

/// Browser session bookkeeping for one stage
struct SessionSlot {
    handle: Option<Arc<dyn SessionControl>>,
    active: bool,
    served: usize,
    batch_size: usize,
    /// Set when login can never succeed this run
    unavailable: Option<String>,
}

impl SessionSlot {
    fn new(handle: Option<Arc<dyn SessionControl>>, batch_size: usize) -> Self {
        Self {
            handle,
            active: false,
            served: 0,
            batch_size: batch_size.max(1),
            unavailable: None,
        }
    }

    /// Make the session ready for the next case: acquire it on first use,
    /// restart it after a full batch, reset it otherwise
    async fn ready(&mut self, stage: Stage) -> Result<(), OperationError> {
        let Some(session) = self.handle.clone() else {
            return Ok(());
        };
        if let Some(reason) = &self.unavailable {
            return Err(OperationError::Terminal(reason.clone()));
        }

        if self.active && self.served >= self.batch_size {
            info!(stage = %stage, cases = self.served, "Restarting browser session");
            self.close(stage).await;
        }

        if self.active {
            if let Err(e) = session.reset().await {
                warn!(stage = %stage, error = %e, "Session reset failed, restarting");
                self.close(stage).await;
            }
        }

        if !self.active {
            match session.acquire().await {
                Ok(()) => {
                    self.active = true;
                    self.served = 0;
                }
                Err(e) => {
                    if e.is_terminal() {
                        self.unavailable = Some(e.to_string());
                    }
                    return Err(e);
                }
            }
        }
        self.served += 1;
        Ok(())
    }

    async fn close(&mut self, stage: Stage) {
        if let (Some(session), true) = (&self.handle, self.active) {
            if let Err(e) = session.release().await {
                warn!(stage = %stage, error = %e, "Failed to release session");
            }
        }
        self.active = false;
        self.served = 0;
    }
}

/// Stand-in operation for a stage whose session can never log in
struct Unavailable {
    stage: Stage,
    reason: String,
}

#[async_trait]
impl StageOperation for Unavailable {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn execute(&self, _job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        Err(OperationError::Terminal(self.reason.clone()))
    }
}

/// Runs the stages in order over every case that is ready for them.
///
/// A stage only considers cases Processed at the previous stage. Within a
/// stage cases run one at a time, sorted by id, with a cooldown in between.
/// Failing cases get further passes in the same run until they are
/// Processed or Pending.
pub struct Coordinator {
    repo: FileStateRepository,
    operations: OperationSet,
    policy: RetryPolicy,
    timeouts: Timeouts,
    cooldown: Duration,
    session_batch_size: usize,
}

impl Coordinator {
    pub fn new(repo: FileStateRepository, operations: OperationSet, config: &Config) -> Self {
        Self {
            repo,
            operations,
            policy: RetryPolicy::new(config.max_attempts),
            timeouts: config.timeouts.clone(),
            cooldown: config.cooldown(),
            session_batch_size: config.session_batch_size,
        }
    }

    pub fn repository(&self) -> &FileStateRepository {
        &self.repo
    }

    fn load_ledger(&self) -> Result<RetryLedger, PipelineError> {
        let path = self.repo.layout().ledger_path();
        Ok(RetryLedger::load(self.repo.store().as_ref(), &path)?)
    }

    /// Cases stage `stage` should work on: waiting in its root, not yet
    /// Processed or Pending there, and Processed at the previous stage.
    ///
    /// A missing stage directory fails the first requested stage and means
    /// no work for the others.
    pub fn candidates(&self, stage: Stage, first: bool) -> Result<Vec<CaseId>, PipelineError> {
        let waiting = match self.repo.list_pending(stage) {
            Ok(ids) => ids,
            Err(e) if e.is_directory_missing() && !first => {
                info!(stage = %stage, reason = %e, "Nothing to do");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let processed = self.repo.processed(stage)?;
        let pending = self.repo.pending(stage)?;
        let gate = match stage.previous() {
            Some(previous) => Some(self.repo.processed(previous)?),
            None => None,
        };

        Ok(waiting
            .into_iter()
            .filter(|id| !processed.contains(id) && !pending.contains(id))
            .filter(|id| gate.as_ref().map_or(true, |gate| gate.contains(id)))
            .collect())
    }

    /// Run `stages` in order. Stops between cases when `shutdown` fires.
    pub async fn run(
        &self,
        stages: &[Stage],
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<RunReport, PipelineError> {
        let mut shutdown = Shutdown::new(shutdown);
        let mut ledger = self.load_ledger()?;
        let mut report = RunReport::default();

        for (index, stage) in stages.iter().copied().enumerate() {
            if shutdown.requested() {
                break;
            }
            let summary = self
                .run_stage(stage, index == 0, &mut ledger, &mut shutdown)
                .await?;
            report.stages.push((stage, summary));
        }

        report.interrupted = shutdown.requested();
        if report.interrupted {
            warn!("Interrupted, remaining cases will run next time");
        }
        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        first: bool,
        ledger: &mut RetryLedger,
        shutdown: &mut Shutdown<'_>,
    ) -> Result<StageSummary, PipelineError> {
        let mut summary = StageSummary::default();
        let todo = self.candidates(stage, first)?;
        if todo.is_empty() {
            info!(stage = %stage, "No cases ready");
            return Ok(summary);
        }
        let Some(operation) = self.operations.get(stage) else {
            warn!(stage = %stage, cases = todo.len(), "No operation configured, skipping stage");
            return Ok(summary);
        };

        info!(stage = %stage, cases = todo.len(), "Stage started");
        let runner = StageRunner::new(&self.repo, self.policy, self.timeouts.for_stage(stage));
        let mut session = SessionSlot::new(operation.session(), self.session_batch_size);
        let mut remaining = todo;
        let mut ran_one = false;

        'passes: for pass in 1..=self.policy.max_attempts {
            if remaining.is_empty() {
                break;
            }
            if pass > 1 {
                info!(stage = %stage, pass, cases = remaining.len(), "Retrying failed cases");
            }

            let mut retry = Vec::new();
            for id in remaining {
                if shutdown.requested() {
                    break 'passes;
                }
                if ran_one {
                    shutdown.cooldown(self.cooldown).await;
                    if shutdown.requested() {
                        break 'passes;
                    }
                }

                // Skips and recoveries never touch the session
                let outcome = match runner.prepare(stage, &id, ledger) {
                    Ok(Prepared::Job(job)) => match session.ready(stage).await {
                        Ok(()) => runner.run_job(operation.as_ref(), job, ledger).await,
                        Err(e) if e.is_terminal() => {
                            let unavailable = Unavailable {
                                stage,
                                reason: e.to_string(),
                            };
                            runner.run_job(&unavailable, job, ledger).await
                        }
                        Err(e) => {
                            error!(stage = %stage, error = %e, "Session unavailable, stopping stage");
                            break 'passes;
                        }
                    },
                    Ok(Prepared::Settled(outcome)) => Ok(outcome),
                    Err(e) => Err(e),
                };

                match outcome {
                    Ok(outcome) => {
                        if matches!(
                            outcome,
                            RunOutcome::Processed { recovered: false, .. }
                                | RunOutcome::Retrying { .. }
                                | RunOutcome::Pending { .. }
                        ) {
                            summary.executed += 1;
                            ran_one = true;
                        }
                        match outcome {
                            RunOutcome::Processed { .. } => summary.processed += 1,
                            RunOutcome::Pending { .. } => summary.pending += 1,
                            RunOutcome::Retrying { .. } => retry.push(id),
                            RunOutcome::Skipped(reason) => {
                                info!(case = %id, stage = %stage, reason = ?reason, "Skipped");
                                summary.skipped += 1;
                            }
                        }
                    }
                    Err(e) => {
                        error!(case = %id, stage = %stage, error = %e, "Failed to file case");
                        summary.errors += 1;
                    }
                }
            }
            remaining = retry;
        }
        session.close(stage).await;

        summary.retrying = ledger.retrying(stage);
        info!(
            stage = %stage,
            processed = summary.processed,
            pending = summary.pending,
            retrying = summary.retrying,
            skipped = summary.skipped,
            errors = summary.errors,
            calls = summary.executed,
            "Stage finished"
        );
        Ok(summary)
    }

    /// Log what each stage would pick up, without running anything
    pub fn dry_run(&self, stages: &[Stage]) -> Result<(), PipelineError> {
        for (index, stage) in stages.iter().copied().enumerate() {
            let todo = self.candidates(stage, index == 0)?;
            let ids: Vec<&str> = todo.iter().map(CaseId::as_str).collect();
            info!(stage = %stage, cases = todo.len(), ids = ?ids, "Would process");
        }
        Ok(())
    }

    pub fn status(&self) -> Result<Vec<StageStatus>, PipelineError> {
        let ledger = self.load_ledger()?;
        let mut statuses = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let counts = self.repo.counts(stage)?;
            statuses.push(StageStatus::new(stage, counts, ledger.retrying(stage)));
        }
        Ok(statuses)
    }

    /// Log the {Processed, Pending, Fresh, Retry} counts of every stage
    pub fn log_status(&self) -> Result<(), PipelineError> {
        for status in self.status()? {
            info!(
                stage = %status.stage,
                processed = status.processed,
                pending = status.pending,
                fresh = status.fresh,
                retry = status.retry,
                "Summary"
            );
        }
        Ok(())
    }

    /// Move a Pending case back to its stage root and forget its attempts
    pub fn requeue(&self, stage: Stage, id: &CaseId) -> Result<PathBuf, PipelineError> {
        let path = self.repo.requeue(id, stage)?;
        let mut ledger = self.load_ledger()?;
        if ledger.clear(stage, id) {
            ledger.save(self.repo.store().as_ref())?;
        }
        info!(case = %id, stage = %stage, path = %path.display(), "Requeued");
        Ok(path)
    }
}
