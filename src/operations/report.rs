use super::{CaseJob, OperationError, StageOperation};
use crate::llm::ReportModel;
use crate::store::FileStore;
use crate::types::Stage;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Generates `Reports/<id>_final_report.md` from the case's OCR text
pub struct ReportOperation {
    store: Arc<dyn FileStore>,
    model: Arc<dyn ReportModel>,
    model_name: String,
    prompt: String,
}

impl ReportOperation {
    pub fn new(
        store: Arc<dyn FileStore>,
        model: Arc<dyn ReportModel>,
        model_name: &str,
        prompt: &str,
    ) -> Self {
        Self {
            store,
            model,
            model_name: model_name.to_string(),
            prompt: prompt.to_string(),
        }
    }
}

#[async_trait]
impl StageOperation for ReportOperation {
    fn stage(&self) -> Stage {
        Stage::Report
    }

    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        let output = job
            .output
            .clone()
            .ok_or_else(|| OperationError::terminal("Report has no output path"))?;

        let text = self.store.read_to_string(&job.input)?;
        if text.trim().is_empty() {
            return Err(OperationError::terminal("OCR text is empty"));
        }

        info!(case = %job.id, model = %self.model_name, "Generating report");
        let content = format!("DADOS PARA PERICIA:{}\n", text);
        let report = self
            .model
            .generate(&self.model_name, &self.prompt, &content)
            .await?;

        self.store.write(&output, report.as_bytes())?;
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::CaseId;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingModel {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ReportModel for CapturingModel {
        async fn generate(
            &self,
            model: &str,
            _system_instruction: &str,
            content: &str,
        ) -> Result<String, OperationError> {
            self.seen
                .lock()
                .unwrap()
                .push((model.to_string(), content.to_string()));
            Ok("# Laudo\nConclusão pericial".to_string())
        }
    }

    fn job() -> CaseJob {
        CaseJob {
            id: CaseId::parse("50012345620254047102").unwrap(),
            input: PathBuf::from("/work/Output/50012345620254047102.txt"),
            output: Some(PathBuf::from(
                "/work/Reports/50012345620254047102_final_report.md",
            )),
        }
    }

    #[tokio::test]
    async fn test_report_written_next_stage() {
        let store = Arc::new(MemoryStore::new());
        store.write(&job().input, b"pagina 1").unwrap();
        let model = Arc::new(CapturingModel::default());
        let op = ReportOperation::new(store.clone(), model.clone(), "gemini-2.5-pro", "prompt");

        let output = op.execute(&job()).await.unwrap().unwrap();

        assert_eq!(
            store.read_to_string(&output).unwrap(),
            "# Laudo\nConclusão pericial"
        );
        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].0, "gemini-2.5-pro");
        assert_eq!(seen[0].1, "DADOS PARA PERICIA:pagina 1\n");
    }

    #[tokio::test]
    async fn test_empty_text_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        store.write(Path::new("/work/Output/50012345620254047102.txt"), b"  \n").unwrap();
        let model = Arc::new(CapturingModel::default());
        let op = ReportOperation::new(store, model.clone(), "m", "p");

        assert!(op.execute(&job()).await.unwrap_err().is_terminal());
        assert!(model.seen.lock().unwrap().is_empty());
    }
}
