use super::{CaseJob, OperationError, StageOperation};
use crate::pdf::PageSource;
use crate::store::FileStore;
use crate::types::Stage;
use crate::vision::PageRecognizer;
use async_channel::{bounded, Receiver};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use sysinfo::System;
use tokio::task::JoinSet;
use tracing::{debug, info};

const NO_TEXT: &str = "Não foi possivel detectar texto";

/// Logical cores on this machine, at least one
pub fn available_cores() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.cpus().len().max(1)
}

/// OCR of every page of the case PDF into `Output/<id>.txt`
pub struct OcrOperation {
    store: Arc<dyn FileStore>,
    pages: Arc<dyn PageSource>,
    recognizer: Arc<dyn PageRecognizer>,
    workers: usize,
}

impl OcrOperation {
    pub fn new(
        store: Arc<dyn FileStore>,
        pages: Arc<dyn PageSource>,
        recognizer: Arc<dyn PageRecognizer>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            pages,
            recognizer,
            workers: workers.max(1),
        }
    }
}

type PageResult = Result<Vec<(usize, String)>, OperationError>;

/// Spawn a pool of page workers. Dropping the set aborts every worker, so a
/// cancelled case stops calling the recognizer.
fn spawn_page_pool(
    concurrency: usize,
    rx: Receiver<usize>,
    pdf: PathBuf,
    pages: Arc<dyn PageSource>,
    recognizer: Arc<dyn PageRecognizer>,
) -> JoinSet<PageResult> {
    let mut workers = JoinSet::new();
    for worker_id in 0..concurrency {
        let rx = rx.clone();
        let pdf = pdf.clone();
        let pages = Arc::clone(&pages);
        let recognizer = Arc::clone(&recognizer);

        workers.spawn(async move { page_worker(worker_id, rx, pdf, pages, recognizer).await });
    }
    workers
}

async fn page_worker(
    worker_id: usize,
    rx: Receiver<usize>,
    pdf: PathBuf,
    pages: Arc<dyn PageSource>,
    recognizer: Arc<dyn PageRecognizer>,
) -> PageResult {
    let mut done = Vec::new();
    while let Ok(page) = rx.recv().await {
        debug!(worker = worker_id, page, "Recognizing page");
        let text = match pages.render_page(&pdf, page).await {
            Ok(image) => recognizer.recognize(&image).await,
            Err(e) => Err(e),
        };
        match text {
            Ok(text) => done.push((page, page_block(page, text.as_deref()))),
            Err(e) => {
                // One bad page fails the document; stop the other workers
                rx.close();
                return Err(e);
            }
        }
    }
    Ok(done)
}

/// Page text between start and end markers
fn page_block(page: usize, text: Option<&str>) -> String {
    format!(
        "\n\n------------ Inicio da pagina {page} ------------\n\n{}\n\n------------ Fim da pagina {page} ------------\n\n",
        text.unwrap_or(NO_TEXT)
    )
}

#[async_trait]
impl StageOperation for OcrOperation {
    fn stage(&self) -> Stage {
        Stage::Ocr
    }

    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        let output = job
            .output
            .clone()
            .ok_or_else(|| OperationError::terminal("OCR has no output path"))?;

        let count = self.pages.page_count(&job.input).await?;
        if count == 0 {
            return Err(OperationError::terminal("PDF has no pages"));
        }

        let concurrency = self.workers.min(count);
        info!(case = %job.id, pages = count, workers = concurrency, "Starting OCR");

        let (tx, rx) = bounded::<usize>(concurrency * 2);
        let mut workers = spawn_page_pool(
            concurrency,
            rx.clone(),
            job.input.clone(),
            Arc::clone(&self.pages),
            Arc::clone(&self.recognizer),
        );
        drop(rx);

        for page in 1..=count {
            // Closed early when a worker fails
            if tx.send(page).await.is_err() {
                break;
            }
        }
        // Close sender so workers know when to stop
        drop(tx);

        let mut blocks = Vec::with_capacity(count);
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(done)) => blocks.extend(done),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(OperationError::transient(format!(
                        "Page worker panicked: {}",
                        e
                    )));
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        blocks.sort_by_key(|(page, _)| *page);
        let text: String = blocks.into_iter().map(|(_, block)| block).collect();
        self.store.write(&output, text.as_bytes())?;
        Ok(Some(output))
    }
}
