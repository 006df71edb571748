use super::{CaseJob, OperationError, SessionControl, StageOperation};
use crate::browser::{Vars, WebSession};
use crate::store::FileStore;
use crate::types::Stage;
use async_trait::async_trait;
use glob::glob;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Drives the e-proc download recipe and files the PDF under `Processos/`
pub struct DownloadOperation {
    store: Arc<dyn FileStore>,
    session: Arc<WebSession>,
    download_dir: PathBuf,
    file_wait: Duration,
    poll_interval: Duration,
}

impl DownloadOperation {
    pub fn new(
        store: Arc<dyn FileStore>,
        session: Arc<WebSession>,
        download_dir: PathBuf,
        file_wait: Duration,
    ) -> Self {
        Self {
            store,
            session,
            download_dir,
            file_wait,
            poll_interval: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn pattern(&self) -> String {
        self.download_dir
            .join(&self.session.config().download_pattern)
            .to_string_lossy()
            .to_string()
    }

    /// Wait for a file that was not there before and whose size stopped changing
    async fn wait_for_new_file(&self, before: &BTreeSet<PathBuf>) -> Result<PathBuf, OperationError> {
        let pattern = self.pattern();
        let deadline = tokio::time::Instant::now() + self.file_wait;
        let mut sizes: BTreeMap<PathBuf, u64> = BTreeMap::new();

        loop {
            for path in collect_glob_matches(&pattern) {
                if before.contains(&path) {
                    continue;
                }
                let size = file_size(&path);
                if size > 0 && sizes.get(&path) == Some(&size) {
                    return Ok(path);
                }
                debug!(file = %path.display(), size, "Download in progress");
                sizes.insert(path, size);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(OperationError::transient(format!(
                    "No downloaded file after {}s",
                    self.file_wait.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Collect all files matching a glob pattern
fn collect_glob_matches(pattern: &str) -> BTreeSet<PathBuf> {
    match glob(pattern) {
        Ok(paths) => paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[async_trait]
impl StageOperation for DownloadOperation {
    fn stage(&self) -> Stage {
        Stage::Download
    }

    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        let output = job
            .output
            .clone()
            .ok_or_else(|| OperationError::terminal("Download has no output path"))?;
        if self.session.config().download.is_empty() {
            return Err(OperationError::terminal("No download recipe configured"));
        }

        self.store.create_dir_all(&self.download_dir)?;
        let before = collect_glob_matches(&self.pattern());

        let vars = Vars::new()
            .set("id", job.id.as_str())
            .set("cnj", job.id.cnj());
        self.session
            .run(&self.session.config().download, &vars, None)
            .await?;

        let downloaded = self.wait_for_new_file(&before).await?;
        info!(case = %job.id, file = %downloaded.display(), "Downloaded");
        self.store.rename(&downloaded, &output)?;
        Ok(Some(output))
    }

    fn session(&self) -> Option<Arc<dyn SessionControl>> {
        Some(self.session.clone() as Arc<dyn SessionControl>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserError, ElementRef, Locator, Step, WebActuator};
    use crate::config::{BrowserConfig, Credentials};
    use crate::store::DiskStore;
    use crate::types::CaseId;
    use tempfile::TempDir;

    /// Clicking "#baixar" drops a PDF into the download directory
    struct DownloadingActuator {
        download_dir: PathBuf,
    }

    #[async_trait]
    impl WebActuator for DownloadingActuator {
        async fn start(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn quit(&self) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn find(&self, locator: &Locator) -> Result<ElementRef, BrowserError> {
            Ok(ElementRef(locator.to_string()))
        }
        async fn click(&self, element: &ElementRef) -> Result<(), BrowserError> {
            if element.0 == "css=#baixar" {
                std::fs::write(self.download_dir.join("P-5001234.PDF.pdf"), b"%PDF-1.7").unwrap();
            }
            Ok(())
        }
        async fn fill(&self, _element: &ElementRef, _text: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn window_handles(&self) -> Result<Vec<String>, BrowserError> {
            Ok(Vec::new())
        }
        async fn switch_to_window(&self, _handle: &str) -> Result<(), BrowserError> {
            Ok(())
        }
        async fn close_window(&self) -> Result<(), BrowserError> {
            Ok(())
        }
    }

    fn operation(tmp: &TempDir, click: &str) -> DownloadOperation {
        let download_dir = tmp.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        let config = BrowserConfig {
            download: vec![Step::Click {
                locator: Locator::Css(click.to_string()),
            }],
            element_wait_secs: 1,
            ..BrowserConfig::default()
        };
        let actuator = Arc::new(DownloadingActuator {
            download_dir: download_dir.clone(),
        });
        let session = Arc::new(WebSession::new(actuator, config, &Credentials::default()));
        DownloadOperation::new(
            Arc::new(DiskStore::new()),
            session,
            download_dir,
            Duration::from_millis(300),
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    fn job(tmp: &TempDir) -> CaseJob {
        CaseJob {
            id: CaseId::parse("50012345620254047102").unwrap(),
            input: tmp.path().join("processos.txt"),
            output: Some(tmp.path().join("Processos").join("PRC50012345620254047102.pdf")),
        }
    }

    #[tokio::test]
    async fn test_new_download_is_moved_into_processos() {
        let tmp = TempDir::new().unwrap();
        let op = operation(&tmp, "#baixar");

        let output = op.execute(&job(&tmp)).await.unwrap().unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"%PDF-1.7");
        assert!(collect_glob_matches(&op.pattern()).is_empty());
    }

    #[tokio::test]
    async fn test_old_files_are_not_mistaken_for_the_download() {
        let tmp = TempDir::new().unwrap();
        let op = operation(&tmp, "#nothing");
        std::fs::write(tmp.path().join("downloads").join("old.pdf"), b"%PDF old").unwrap();

        let err = op.execute(&job(&tmp)).await.unwrap_err();

        assert!(!err.is_terminal());
        assert!(err.to_string().contains("No downloaded file"));
        assert!(tmp.path().join("downloads").join("old.pdf").exists());
    }
}
