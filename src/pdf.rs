use crate::operations::OperationError;
use crate::process::run_command;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;

/// Page-level access to a PDF
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page_count(&self, pdf: &Path) -> Result<usize, OperationError>;

    /// Render one page (1-based) to PNG bytes
    async fn render_page(&self, pdf: &Path, page: usize) -> Result<Vec<u8>, OperationError>;
}

/// Poppler command-line tools (`pdfinfo`, `pdftoppm`)
#[derive(Debug, Clone)]
pub struct PopplerPages {
    dpi: u32,
}

impl Default for PopplerPages {
    fn default() -> Self {
        Self { dpi: 150 }
    }
}

/// Missing tools are a setup problem, so they fail the case for good
fn spawn_error(e: anyhow::Error) -> OperationError {
    OperationError::terminal(format!("{:#}", e))
}

#[async_trait]
impl PageSource for PopplerPages {
    async fn page_count(&self, pdf: &Path) -> Result<usize, OperationError> {
        let output = run_command("pdfinfo", &[pdf.as_os_str()], None)
            .await
            .map_err(spawn_error)?;
        if output.exit_code != 0 {
            // Unreadable or encrypted documents do not get better on retry
            return Err(OperationError::terminal(format!(
                "pdfinfo failed on {}: {}",
                pdf.display(),
                output.stderr.trim()
            )));
        }
        parse_page_count(&output.stdout_text()).ok_or_else(|| {
            OperationError::terminal(format!("No page count for {}", pdf.display()))
        })
    }

    async fn render_page(&self, pdf: &Path, page: usize) -> Result<Vec<u8>, OperationError> {
        let page_arg = page.to_string();
        let dpi_arg = self.dpi.to_string();
        let args = [
            OsStr::new("-f"),
            OsStr::new(&page_arg),
            OsStr::new("-l"),
            OsStr::new(&page_arg),
            OsStr::new("-r"),
            OsStr::new(&dpi_arg),
            OsStr::new("-png"),
            OsStr::new("-singlefile"),
            pdf.as_os_str(),
        ];
        let output = run_command("pdftoppm", &args, None)
            .await
            .map_err(spawn_error)?;
        if output.exit_code != 0 || output.stdout.is_empty() {
            return Err(OperationError::transient(format!(
                "pdftoppm failed on page {} of {}: {}",
                page,
                pdf.display(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn parse_page_count(info: &str) -> Option<usize> {
    info.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_page_count() {
        let info = "Title:          Processo\nProducer:       eproc\nPages:          42\nEncrypted:      no\n";
        assert_eq!(parse_page_count(info), Some(42));
        assert_eq!(parse_page_count("Title: x\n"), None);
    }
}
