use crate::types::Stage;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "laudo-pipeline")]
#[command(about = "Download, OCR, summarize and file judicial process PDFs, resuming where the last run stopped")]
#[command(version)]
pub struct Cli {
    /// Workspace holding processos.txt, Processos/, Output/ and Reports/
    #[arg(short, long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Config file (defaults to <root>/laudo-pipeline.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Attempts before a case is moved to Pending
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Seconds to wait between cases
    #[arg(long, global = true)]
    pub cooldown: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run every stage in order
    Run {
        /// Only list what each stage would process
        #[arg(long)]
        dry_run: bool,

        /// Model used for report generation
        #[arg(long)]
        model: Option<String>,
    },

    /// Download the PDFs listed in the case list
    Download,

    /// Extract text from downloaded PDFs
    Ocr,

    /// Generate reports from OCR text
    Report {
        #[arg(long)]
        model: Option<String>,
    },

    /// Fill and save the web form from generated reports
    Fill {
        /// Model used to extract the form fields
        #[arg(long)]
        model: Option<String>,
    },

    /// Show per-stage counts without running anything
    Status,

    /// Move a Pending case back to its stage root
    Requeue { stage: Stage, id: String },

    /// Fill a single case in this process (used for per-case isolation)
    #[command(hide = true)]
    FillOne { id: String },
}

impl Command {
    /// Stages this command runs, in order
    pub fn stages(&self) -> Vec<Stage> {
        match self {
            Command::Run { .. } => Stage::ALL.to_vec(),
            Command::Download => vec![Stage::Download],
            Command::Ocr => vec![Stage::Ocr],
            Command::Report { .. } => vec![Stage::Report],
            Command::Fill { .. } => vec![Stage::Fill],
            Command::Status | Command::Requeue { .. } | Command::FillOne { .. } => Vec::new(),
        }
    }
}
