mod browser;
mod cli;
mod codec;
mod config;
mod coordinator;
mod error;
mod ledger;
mod llm;
mod operations;
mod pdf;
mod process;
mod repository;
mod retry;
mod runner;
mod store;
mod types;
mod vision;

use anyhow::{Context, Result};
use browser::{SessionControl, WebDriverClient, WebSession};
use clap::Parser;
use cli::{Cli, Command};
use config::{Config, Credentials};
use coordinator::Coordinator;
use llm::GeminiClient;
use operations::{
    available_cores, CaseJob, DownloadOperation, FillOperation, IsolatedFill, OcrOperation,
    OperationError, OperationSet, ReportOperation, StageOperation,
};
use pdf::PopplerPages;
use repository::{FileStateRepository, Layout};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use store::{DiskStore, FileStore};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use types::{CaseId, Stage, Subfolder};
use vision::VisionClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = Config::discover(&cli.root, cli.config.as_deref())
        .context("Failed to load configuration")?
        .merge_with_cli(&cli);
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }
    let credentials = Credentials::from_env();

    let store: Arc<dyn FileStore> = Arc::new(DiskStore::new());
    let layout = Layout::new(&cli.root, &config.case_list);
    let repo = FileStateRepository::new(store.clone(), layout);

    match &cli.command {
        Command::Status => {
            let coordinator = Coordinator::new(repo, OperationSet::new(), &config);
            coordinator.log_status()?;
            Ok(())
        }
        Command::Requeue { stage, id } => {
            let id = CaseId::parse(id)?;
            let coordinator = Coordinator::new(repo, OperationSet::new(), &config);
            coordinator.requeue(*stage, &id)?;
            Ok(())
        }
        Command::FillOne { id } => {
            let code = fill_one(&cli, &config, &credentials, store, &repo, id).await;
            std::process::exit(code);
        }
        Command::Run { dry_run: true, .. } => {
            let coordinator = Coordinator::new(repo, OperationSet::new(), &config);
            coordinator.dry_run(&cli.command.stages())?;
            Ok(())
        }
        command => {
            let stages = command.stages();
            let operations = build_operations(&cli, &config, &credentials, store, &stages)?;
            let coordinator = Coordinator::new(repo, operations, &config);
            run_stages(&coordinator, &stages).await
        }
    }
}

async fn run_stages(coordinator: &Coordinator, stages: &[Stage]) -> Result<()> {
    // Set up shutdown signal handler
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, finishing the current case...");
        let _ = shutdown_tx.send(());
    });

    info!(root = %coordinator.repository().layout().root().display(), "Starting pipeline");
    let result = coordinator.run(stages, &mut shutdown_rx).await;
    coordinator.log_status()?;

    match result {
        Ok(report) => {
            let pending: usize = report.stages.iter().map(|(_, s)| s.pending).sum();
            info!(
                stages = report.stages.len(),
                new_pending = pending,
                interrupted = report.interrupted,
                "Run complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pipeline failed");
            Err(e.into())
        }
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn web_session(cli: &Cli, config: &Config, credentials: &Credentials) -> Arc<WebSession> {
    let download_dir = config.download_dir(&cli.root);
    let driver = Arc::new(WebDriverClient::new(
        &config.browser.webdriver_url,
        Some(download_dir),
        config.browser.headless,
    ));
    Arc::new(WebSession::new(driver, config.browser.clone(), credentials))
}

fn gemini(config: &Config, credentials: &Credentials) -> Arc<GeminiClient> {
    Arc::new(GeminiClient::new(
        &config.api.gemini_url,
        credentials.gemini_api_key.clone(),
        config.generation.clone(),
    ))
}

fn fill_operation(
    cli: &Cli,
    config: &Config,
    credentials: &Credentials,
    store: Arc<dyn FileStore>,
    session: Arc<WebSession>,
) -> FillOperation {
    FillOperation::new(
        store,
        session,
        gemini(config, credentials),
        &config.template_model,
        &config.template_prompt,
        config.template_fields.clone(),
        resolve(&cli.root, &config.template_path),
        Duration::from_secs(config.timeouts.template_secs),
    )
}

/// Operations for the requested stages only, so a report-only run never
/// needs a browser
fn build_operations(
    cli: &Cli,
    config: &Config,
    credentials: &Credentials,
    store: Arc<dyn FileStore>,
    stages: &[Stage],
) -> Result<OperationSet> {
    let mut set = OperationSet::new();
    let session = web_session(cli, config, credentials);

    for stage in stages {
        let operation: Arc<dyn StageOperation> = match stage {
            Stage::Download => Arc::new(DownloadOperation::new(
                store.clone(),
                session.clone(),
                config.download_dir(&cli.root),
                Duration::from_secs(config.timeouts.file_generation_secs),
            )),
            Stage::Ocr => {
                let workers = available_cores() * config.ocr_workers_per_core;
                Arc::new(OcrOperation::new(
                    store.clone(),
                    Arc::new(PopplerPages::default()),
                    Arc::new(VisionClient::new(
                        &config.api.vision_url,
                        credentials.vision_api_key.clone(),
                    )),
                    workers,
                ))
            }
            Stage::Report => Arc::new(ReportOperation::new(
                store.clone(),
                gemini(config, credentials),
                &config.report_model,
                &config.report_prompt,
            )),
            Stage::Fill if config.isolate_fill => {
                let exe = std::env::current_exe().context("Failed to locate own executable")?;
                Arc::new(IsolatedFill::new(exe, cli.root.clone(), cli.config.clone()))
            }
            Stage::Fill => Arc::new(fill_operation(
                cli,
                config,
                credentials,
                store.clone(),
                session.clone(),
            )),
        };
        set = set.with(operation);
    }
    Ok(set)
}

/// Child side of the isolated fill: fill one case, report on stdout, and
/// exit 0 (done), 2 (terminal) or 1 (retry later)
async fn fill_one(
    cli: &Cli,
    config: &Config,
    credentials: &Credentials,
    store: Arc<dyn FileStore>,
    repo: &FileStateRepository,
    raw_id: &str,
) -> i32 {
    let id = match CaseId::parse(raw_id) {
        Ok(id) => id,
        Err(e) => return report_child(Err(OperationError::terminal(e.to_string()))),
    };
    let input = match repo.locate(&id, Stage::Fill, Subfolder::Root) {
        Ok(Some(path)) => path,
        Ok(None) => {
            return report_child(Err(OperationError::terminal(format!(
                "No report for {} in {}",
                id,
                repo.layout().subfolder(Stage::Fill, Subfolder::Root).display()
            ))))
        }
        Err(e) => return report_child(Err(OperationError::transient(e.to_string()))),
    };

    let session = web_session(cli, config, credentials);
    let operation = fill_operation(cli, config, credentials, store, session.clone());
    let job = CaseJob {
        id,
        input,
        output: None,
    };

    let result = match session.acquire().await {
        Ok(()) => operation.execute(&job).await,
        Err(e) => Err(e),
    };
    if let Err(e) = session.release().await {
        warn!(error = %e, "Failed to close browser");
    }
    report_child(result.map(|_| ()))
}

fn report_child(result: Result<(), OperationError>) -> i32 {
    let (value, code) = match &result {
        Ok(()) => (json!({ "saved": true }), process::EXIT_SUCCESS),
        Err(e) if e.is_terminal() => (json!({ "error": e.to_string() }), process::EXIT_TERMINAL),
        Err(e) => (json!({ "error": e.to_string() }), 1),
    };
    println!("{}", process::format_result(&value));
    code
}
