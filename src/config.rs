use crate::browser::Step;
use crate::cli::{Cli, Command};
use crate::error::ConfigError;
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the workspace root when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "laudo-pipeline.json";

/// Form fields the template model must return
pub const TEMPLATE_FIELDS: [&str; 13] = [
    "FormacaoTecnicoProfissional",
    "UltimaAtividade",
    "TarefasExigidasUltimaAtividade",
    "QuantoTempoUltimaAtividade",
    "AteQuandoUltimaAtividade",
    "ExperienciasLaboraisAnt",
    "MotivoIncapacidade",
    "HistoricoAnamnese",
    "DocumentosMedicosAnalisados",
    "DCB",
    "DID",
    "CausaProvavelDiagnostico",
    "CIF",
];

const DEFAULT_REPORT_PROMPT: &str = "Você receberá o conteúdo de um processo judicial \
previdenciário. Elabore o laudo pericial com as seções: dados do periciado, histórico e \
anamnese, documentos médicos analisados, exame físico e mental, conclusão pericial e escala \
CIF quando presente.";

const DEFAULT_TEMPLATE_PROMPT: &str = "Você receberá o laudo de um processo judicial \
previdenciário. Retorne somente um objeto JSON no formato {\"json\": {campo: texto}} com os \
campos FormacaoTecnicoProfissional, UltimaAtividade, TarefasExigidasUltimaAtividade, \
QuantoTempoUltimaAtividade, AteQuandoUltimaAtividade, ExperienciasLaboraisAnt, \
MotivoIncapacidade, HistoricoAnamnese, DocumentosMedicosAnalisados, DCB, DID, \
CausaProvavelDiagnostico e CIF. Na falta de DCB use a DER. Não use markdown.";

/// Per-operation time limits, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Waiting for the template model's field map
    pub template_secs: u64,
    /// Waiting for the downloaded PDF to appear
    pub file_generation_secs: u64,
    pub report_secs: u64,
    pub ocr_secs: u64,
    /// Whole download operation (recipe plus file wait)
    pub download_secs: u64,
    /// Whole fill operation (template plus form recipe)
    pub fill_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            template_secs: 30,
            file_generation_secs: 120,
            report_secs: 120,
            ocr_secs: 300,
            download_secs: 180,
            fill_secs: 180,
        }
    }
}

impl Timeouts {
    /// Bound on one operation call of the stage
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Download => self.download_secs,
            Stage::Ocr => self.ocr_secs,
            Stage::Report => self.report_secs,
            Stage::Fill => self.fill_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Sampling parameters sent with every generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 64,
            max_output_tokens: 65536,
        }
    }
}

/// Remote API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub gemini_url: String,
    pub vision_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            gemini_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            vision_url: "https://vision.googleapis.com/v1".to_string(),
        }
    }
}

/// Browser session and the recipes that drive it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    /// Login page, opened right after the session starts
    pub base_url: String,
    /// Page the session returns to between cases (defaults to `base_url`)
    pub home_url: String,
    /// Where the browser saves downloads (defaults to `<root>/downloads`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_dir: Option<PathBuf>,
    /// Glob, relative to `download_dir`, matching a finished download
    pub download_pattern: String,
    pub headless: bool,
    /// Default wait for an element to appear
    pub element_wait_secs: u64,
    /// Ask the operator to log in by hand when no credentials are set
    pub manual_login: bool,
    pub login: Vec<Step>,
    pub download: Vec<Step>,
    pub fill: Vec<Step>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            base_url: String::new(),
            home_url: String::new(),
            download_dir: None,
            download_pattern: "*.pdf".to_string(),
            headless: false,
            element_wait_secs: 30,
            manual_login: false,
            login: Vec::new(),
            download: Vec::new(),
            fill: Vec::new(),
        }
    }
}

/// Pipeline configuration, every field optional in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Download queue, relative to the workspace root
    pub case_list: PathBuf,
    /// Attempts before a transiently failing case is moved to Pending
    pub max_attempts: u32,
    /// Pause between cases
    pub cooldown_secs: u64,
    /// Cases between browser restarts
    pub session_batch_size: usize,
    pub ocr_workers_per_core: usize,
    pub timeouts: Timeouts,
    pub report_model: String,
    pub template_model: String,
    pub report_prompt: String,
    pub template_prompt: String,
    /// Fields required in the template model's answer
    pub template_fields: Vec<String>,
    /// Single-slot file holding the latest field map
    pub template_path: PathBuf,
    /// Run each fill in a child process
    pub isolate_fill: bool,
    pub generation: GenerationConfig,
    pub api: ApiConfig,
    pub browser: BrowserConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            case_list: PathBuf::from("processos.txt"),
            max_attempts: 3,
            cooldown_secs: 3,
            session_batch_size: 10,
            ocr_workers_per_core: 2,
            timeouts: Timeouts::default(),
            report_model: "gemini-2.5-pro".to_string(),
            template_model: "gemini-2.5-flash".to_string(),
            report_prompt: DEFAULT_REPORT_PROMPT.to_string(),
            template_prompt: DEFAULT_TEMPLATE_PROMPT.to_string(),
            template_fields: TEMPLATE_FIELDS.iter().map(|f| f.to_string()).collect(),
            template_path: PathBuf::from("laudo_template.json"),
            isolate_fill: false,
            generation: GenerationConfig::default(),
            api: ApiConfig::default(),
            browser: BrowserConfig::default(),
        }
    }
}

impl Config {
    /// Load a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Explicit path if given, else `<root>/laudo-pipeline.json` if it exists, else defaults
    pub fn discover(root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = root.join(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Merge CLI args over file config
    /// CLI args win if explicitly provided
    pub fn merge_with_cli(mut self, cli: &Cli) -> Self {
        if let Some(max_attempts) = cli.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(cooldown) = cli.cooldown {
            self.cooldown_secs = cooldown;
        }
        match &cli.command {
            Command::Run {
                model: Some(model), ..
            }
            | Command::Report { model: Some(model) } => {
                self.report_model = model.clone();
            }
            Command::Fill { model: Some(model) } => {
                self.template_model = model.clone();
            }
            _ => {}
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.session_batch_size == 0 {
            return Err(ConfigError::Validation(
                "session_batch_size must be at least 1".to_string(),
            ));
        }
        if self.ocr_workers_per_core == 0 {
            return Err(ConfigError::Validation(
                "ocr_workers_per_core must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Download directory, resolved against the workspace root
    pub fn download_dir(&self, root: &Path) -> PathBuf {
        match &self.browser.download_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join("downloads"),
        }
    }
}

pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
pub const VISION_API_KEY: &str = "VISION_API_KEY";
pub const EPROC_USER: &str = "EPROC_USER";
pub const EPROC_PASSWORD: &str = "EPROC_PASSWORD";

/// Secrets read from the environment, never from the config file
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub gemini_api_key: Option<String>,
    pub vision_api_key: Option<String>,
    pub eproc_user: Option<String>,
    pub eproc_password: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            gemini_api_key: var(GEMINI_API_KEY),
            vision_api_key: var(VISION_API_KEY),
            eproc_user: var(EPROC_USER),
            eproc_password: var(EPROC_PASSWORD),
        }
    }
}

/// A credential that must be present when the operation runs
pub fn require(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    value.clone().ok_or(ConfigError::MissingCredential(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.cooldown_secs, 3);
        assert_eq!(config.session_batch_size, 10);
        assert_eq!(config.timeouts.template_secs, 30);
        assert_eq!(config.timeouts.file_generation_secs, 120);
        assert_eq!(config.timeouts.for_stage(Stage::Report), Duration::from_secs(120));
        assert_eq!(config.template_fields.len(), 13);
        assert_eq!(config.case_list, PathBuf::from("processos.txt"));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config: Config = serde_json::from_str(
            r##"{
                "max_attempts": 5,
                "timeouts": {"template_secs": 10},
                "browser": {
                    "base_url": "https://eproc.example",
                    "download": [{"action": "click", "locator": {"css": "#baixar"}}]
                }
            }"##,
        )
        .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.timeouts.template_secs, 10);
        assert_eq!(config.timeouts.report_secs, 120);
        assert_eq!(config.browser.download.len(), 1);
        assert_eq!(config.browser.webdriver_url, "http://localhost:9515");
    }

    #[test]
    fn test_discover_prefers_root_file() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(Config::discover(tmp.path(), None).unwrap().max_attempts, 3);

        fs::write(tmp.path().join(DEFAULT_CONFIG_FILE), r#"{"max_attempts": 4}"#).unwrap();
        assert_eq!(Config::discover(tmp.path(), None).unwrap().max_attempts, 4);

        let missing = tmp.path().join("nope.json");
        assert!(matches!(
            Config::discover(tmp.path(), Some(&missing)),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_bad_file_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_merge_with_cli() {
        let cli = Cli::parse_from([
            "laudo-pipeline",
            "--max-attempts",
            "2",
            "fill",
            "--model",
            "gemini-2.5-pro",
        ]);
        let config = Config::default().merge_with_cli(&cli);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.template_model, "gemini-2.5-pro");
        assert_eq!(config.report_model, "gemini-2.5-pro");
        assert_eq!(config.cooldown_secs, 3);
    }

    #[test]
    fn test_validation() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_download_dir_resolution() {
        let root = Path::new("/work");
        let mut config = Config::default();
        assert_eq!(config.download_dir(root), PathBuf::from("/work/downloads"));
        config.browser.download_dir = Some(PathBuf::from("/tmp/dl"));
        assert_eq!(config.download_dir(root), PathBuf::from("/tmp/dl"));
    }
}
