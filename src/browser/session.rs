use super::{run_recipe, BrowserError, Step, Vars, WebActuator};
use crate::config::{BrowserConfig, Credentials};
use crate::error::ConfigError;
use crate::operations::OperationError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lifecycle of a long-lived actuator shared by every case of a stage
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Open the session and log in. A terminal error means no case of the
    /// stage can succeed.
    async fn acquire(&self) -> Result<(), OperationError>;

    /// Bring the session back to a known state between cases
    async fn reset(&self) -> Result<(), OperationError>;

    async fn release(&self) -> Result<(), OperationError>;
}

/// Logged-in browser session used by the download and fill stages
pub struct WebSession {
    actuator: Arc<dyn WebActuator>,
    config: BrowserConfig,
    credentials: Option<(String, String)>,
    active: Mutex<bool>,
}

impl WebSession {
    pub fn new(actuator: Arc<dyn WebActuator>, config: BrowserConfig, credentials: &Credentials) -> Self {
        let login = match (&credentials.eproc_user, &credentials.eproc_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Self {
            actuator,
            config,
            credentials: login,
            active: Mutex::new(false),
        }
    }

    pub fn actuator(&self) -> &dyn WebActuator {
        self.actuator.as_ref()
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }

    fn wait(&self) -> Duration {
        Duration::from_secs(self.config.element_wait_secs)
    }

    /// Run a recipe on this session's browser
    pub async fn run(
        &self,
        steps: &[Step],
        vars: &Vars,
        fields: Option<&BTreeMap<String, String>>,
    ) -> Result<(), BrowserError> {
        run_recipe(self.actuator(), steps, vars, fields, self.wait()).await
    }

    async fn login(&self) -> Result<(), OperationError> {
        match &self.credentials {
            Some((user, password)) => {
                let vars = Vars::new()
                    .set("user", user.as_str())
                    .set("password", password.as_str())
                    .set("base_url", self.config.base_url.as_str());
                self.run(&self.config.login, &vars, None).await?;
                info!("Logged in");
                Ok(())
            }
            None if self.config.manual_login => {
                warn!("No e-proc credentials set; waiting for manual login");
                prompt_operator("Log in in the browser window, then press Enter to continue...")
                    .await?;
                Ok(())
            }
            None => Err(ConfigError::MissingCredential("EPROC_USER").into()),
        }
    }
}

#[async_trait]
impl SessionControl for WebSession {
    async fn acquire(&self) -> Result<(), OperationError> {
        let mut active = self.active.lock().await;
        if *active {
            return Ok(());
        }
        self.actuator.start().await?;
        if !self.config.base_url.is_empty() {
            self.actuator.navigate(&self.config.base_url).await?;
        }
        if let Err(e) = self.login().await {
            let _ = self.actuator.quit().await;
            return Err(e);
        }
        *active = true;
        Ok(())
    }

    /// Close every window but the first and go back to the home page
    async fn reset(&self) -> Result<(), OperationError> {
        if !*self.active.lock().await {
            return Err(BrowserError::NoSession.into());
        }
        let handles = self.actuator.window_handles().await?;
        if let Some((main, extra)) = handles.split_first() {
            for handle in extra {
                self.actuator.switch_to_window(handle).await?;
                self.actuator.close_window().await?;
            }
            self.actuator.switch_to_window(main).await?;
        }
        let home = if self.config.home_url.is_empty() {
            &self.config.base_url
        } else {
            &self.config.home_url
        };
        if !home.is_empty() {
            self.actuator.navigate(home).await?;
        }
        Ok(())
    }

    async fn release(&self) -> Result<(), OperationError> {
        let mut active = self.active.lock().await;
        if !*active {
            return Ok(());
        }
        *active = false;
        self.actuator.quit().await?;
        Ok(())
    }
}

async fn prompt_operator(message: &str) -> Result<(), OperationError> {
    println!("{}", message);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| OperationError::terminal(format!("Failed to read operator input: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::RecordingActuator;
    use super::super::Locator;
    use super::*;

    fn config() -> BrowserConfig {
        BrowserConfig {
            base_url: "https://eproc.example".to_string(),
            home_url: "https://eproc.example/painel".to_string(),
            login: vec![Step::Fill {
                locator: Locator::Css("#txtUsuario".to_string()),
                value: "{user}".to_string(),
            }],
            element_wait_secs: 1,
            ..BrowserConfig::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            eproc_user: Some("alice".to_string()),
            eproc_password: Some("secret".to_string()),
            ..Credentials::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_logs_in_once() {
        let actuator = Arc::new(RecordingActuator::default());
        let session = WebSession::new(actuator.clone(), config(), &credentials());

        session.acquire().await.unwrap();
        session.acquire().await.unwrap();

        assert_eq!(
            actuator.calls(),
            vec![
                "start",
                "navigate https://eproc.example",
                "fill css=#txtUsuario alice"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_are_terminal() {
        let actuator = Arc::new(RecordingActuator::default());
        let session = WebSession::new(actuator.clone(), config(), &Credentials::default());

        let err = session.acquire().await.unwrap_err();

        assert!(err.is_terminal());
        assert!(actuator.calls().contains(&"quit".to_string()));
    }

    #[tokio::test]
    async fn test_reset_closes_extra_windows() {
        let actuator = Arc::new(RecordingActuator::default());
        let session = WebSession::new(actuator.clone(), config(), &credentials());
        session.acquire().await.unwrap();
        actuator.windows.lock().unwrap().push("popup".to_string());

        session.reset().await.unwrap();

        let calls = actuator.calls();
        let tail: Vec<&str> = calls.iter().skip(3).map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "switch popup",
                "close",
                "switch main",
                "navigate https://eproc.example/painel"
            ]
        );
    }

    #[tokio::test]
    async fn test_release_quits_once() {
        let actuator = Arc::new(RecordingActuator::default());
        let session = WebSession::new(actuator.clone(), config(), &credentials());
        session.acquire().await.unwrap();

        session.release().await.unwrap();
        session.release().await.unwrap();

        let quits = actuator.calls().iter().filter(|c| *c == "quit").count();
        assert_eq!(quits, 1);
        assert!(session.reset().await.is_err());
    }
}
