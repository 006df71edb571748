use super::{CaseJob, OperationError, SessionControl, StageOperation};
use crate::browser::{Vars, WebSession};
use crate::llm::{extract_json_object, ReportModel};
use crate::store::FileStore;
use crate::types::Stage;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Field map the template model extracted from a report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDraft {
    pub fields: BTreeMap<String, String>,
}

impl TemplateDraft {
    /// Parse the model's answer: an object keyed `"json"` holding string
    /// values for at least every required field
    pub fn parse(answer: &str, required: &[String]) -> Result<Self, OperationError> {
        let raw = extract_json_object(answer)
            .ok_or_else(|| OperationError::transient("Template answer has no JSON object"))?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| OperationError::transient(format!("Template is not valid JSON: {}", e)))?;

        let object = value
            .get("json")
            .and_then(Value::as_object)
            .ok_or_else(|| OperationError::transient("Template has no \"json\" object"))?;

        let mut fields = BTreeMap::new();
        for (name, value) in object {
            let text = value.as_str().ok_or_else(|| {
                OperationError::transient(format!("Template field {} is not a string", name))
            })?;
            fields.insert(name.clone(), text.to_string());
        }

        let missing: Vec<&str> = required
            .iter()
            .filter(|name| !fields.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(OperationError::transient(format!(
                "Template is missing fields: {}",
                missing.join(", ")
            )));
        }

        Ok(Self { fields })
    }

    pub fn to_json(&self) -> Value {
        json!({ "json": self.fields })
    }
}

/// Extracts the form fields from a report and fills the web form with them
pub struct FillOperation {
    store: Arc<dyn FileStore>,
    session: Arc<WebSession>,
    model: Arc<dyn ReportModel>,
    model_name: String,
    prompt: String,
    required_fields: Vec<String>,
    template_path: PathBuf,
    template_wait: Duration,
}

impl FillOperation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn FileStore>,
        session: Arc<WebSession>,
        model: Arc<dyn ReportModel>,
        model_name: &str,
        prompt: &str,
        required_fields: Vec<String>,
        template_path: PathBuf,
        template_wait: Duration,
    ) -> Self {
        Self {
            store,
            session,
            model,
            model_name: model_name.to_string(),
            prompt: prompt.to_string(),
            required_fields,
            template_path,
            template_wait,
        }
    }

    async fn draft(&self, report: &str) -> Result<TemplateDraft, OperationError> {
        let content = format!("CONTEUDO PROCESSUAL: {}", report);
        let answer = tokio::time::timeout(
            self.template_wait,
            self.model.generate(&self.model_name, &self.prompt, &content),
        )
        .await
        .map_err(|_| {
            OperationError::transient(format!(
                "Template not ready after {}s",
                self.template_wait.as_secs()
            ))
        })??;
        TemplateDraft::parse(&answer, &self.required_fields)
    }
}

#[async_trait]
impl StageOperation for FillOperation {
    fn stage(&self) -> Stage {
        Stage::Fill
    }

    async fn execute(&self, job: &CaseJob) -> Result<Option<PathBuf>, OperationError> {
        if self.session.config().fill.is_empty() {
            return Err(OperationError::terminal("No fill recipe configured"));
        }
        let report = self.store.read_to_string(&job.input)?;
        if report.trim().is_empty() {
            return Err(OperationError::terminal("Report is empty"));
        }

        let draft = self.draft(&report).await?;
        let template = serde_json::to_vec_pretty(&draft.to_json())
            .map_err(|e| OperationError::transient(e.to_string()))?;
        self.store.write(&self.template_path, &template)?;
        info!(case = %job.id, fields = draft.fields.len(), "Template ready");

        let vars = Vars::new()
            .set("id", job.id.as_str())
            .set("cnj", job.id.cnj());
        self.session
            .run(&self.session.config().fill, &vars, Some(&draft.fields))
            .await?;
        info!(case = %job.id, "Form saved");
        Ok(None)
    }

    fn session(&self) -> Option<Arc<dyn SessionControl>> {
        Some(self.session.clone() as Arc<dyn SessionControl>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::RecordingActuator;
    use crate::browser::{Locator, Step};
    use crate::config::{BrowserConfig, Credentials};
    use crate::store::memory::MemoryStore;
    use crate::types::CaseId;
    use std::path::Path;

    enum Answer {
        Fields(&'static str),
        Slow,
    }

    struct TemplateModel(Answer);

    #[async_trait]
    impl ReportModel for TemplateModel {
        async fn generate(&self, _m: &str, _s: &str, _c: &str) -> Result<String, OperationError> {
            match self.0 {
                Answer::Fields(text) => Ok(text.to_string()),
                Answer::Slow => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(String::new())
                }
            }
        }
    }

    fn required() -> Vec<String> {
        vec!["DID".to_string(), "CIF".to_string()]
    }

    fn operation(store: Arc<MemoryStore>, answer: Answer) -> (FillOperation, Arc<RecordingActuator>) {
        let actuator = Arc::new(RecordingActuator::default());
        let config = BrowserConfig {
            fill: vec![
                Step::Navigate {
                    url: "https://form/{id}".to_string(),
                },
                Step::FillFields {
                    locator: Locator::Css("#{field}".to_string()),
                },
            ],
            element_wait_secs: 1,
            ..BrowserConfig::default()
        };
        let session = Arc::new(WebSession::new(
            actuator.clone(),
            config,
            &Credentials::default(),
        ));
        let op = FillOperation::new(
            store,
            session,
            Arc::new(TemplateModel(answer)),
            "gemini-2.5-flash",
            "extract",
            required(),
            PathBuf::from("/work/laudo_template.json"),
            Duration::from_millis(100),
        );
        (op, actuator)
    }

    fn job() -> CaseJob {
        CaseJob {
            id: CaseId::parse("50012345620254047102").unwrap(),
            input: PathBuf::from("/work/Reports/50012345620254047102_final_report.md"),
            output: None,
        }
    }

    #[test]
    fn test_parse_strips_chatter() {
        let draft = TemplateDraft::parse(
            "Segue o JSON:\n```json\n{\"json\": {\"DID\": \"01/2024\", \"CIF\": \"b152\"}}\n```",
            &required(),
        )
        .unwrap();
        assert_eq!(draft.fields["DID"], "01/2024");
        assert_eq!(draft.to_json()["json"]["CIF"], "b152");
    }

    #[test]
    fn test_parse_rejects_malformed_answers() {
        let required = required();
        assert!(TemplateDraft::parse("sem json", &required).is_err());
        assert!(TemplateDraft::parse("{\"DID\": \"x\", \"CIF\": \"y\"}", &required).is_err());
        assert!(TemplateDraft::parse("{\"json\": {\"DID\": 3, \"CIF\": \"y\"}}", &required).is_err());
        let err = TemplateDraft::parse("{\"json\": {\"DID\": \"x\"}}", &required).unwrap_err();
        assert!(err.to_string().contains("CIF"));
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_fill_writes_template_and_runs_recipe() {
        let store = Arc::new(MemoryStore::new());
        store.write(&job().input, b"# Laudo").unwrap();
        let (op, actuator) = operation(
            store.clone(),
            Answer::Fields("{\"json\": {\"DID\": \"01/2024\", \"CIF\": \"b152\"}}"),
        );

        assert_eq!(op.execute(&job()).await.unwrap(), None);

        let template = store
            .read_to_string(Path::new("/work/laudo_template.json"))
            .unwrap();
        let value: Value = serde_json::from_str(&template).unwrap();
        assert_eq!(value["json"]["DID"], "01/2024");
        assert_eq!(
            actuator.calls(),
            vec![
                "navigate https://form/50012345620254047102",
                "fill css=#CIF b152",
                "fill css=#DID 01/2024",
            ]
        );
    }

    #[tokio::test]
    async fn test_slow_template_is_transient() {
        let store = Arc::new(MemoryStore::new());
        store.write(&job().input, b"# Laudo").unwrap();
        let (op, actuator) = operation(store.clone(), Answer::Slow);

        let err = op.execute(&job()).await.unwrap_err();

        assert!(!err.is_terminal());
        assert!(err.to_string().contains("Template not ready"));
        assert!(actuator.calls().is_empty());
        assert!(!store.exists(Path::new("/work/laudo_template.json")));
    }
}
