use super::{BrowserError, ElementRef, Locator, WebActuator};
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// W3C key under which element references are returned
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Minimal W3C WebDriver client (chromedriver, geckodriver) over HTTP
pub struct WebDriverClient {
    http: Client,
    base_url: String,
    download_dir: Option<PathBuf>,
    headless: bool,
    session_id: Mutex<Option<String>>,
}

impl WebDriverClient {
    pub fn new(base_url: &str, download_dir: Option<PathBuf>, headless: bool) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            download_dir,
            headless,
            session_id: Mutex::new(None),
        }
    }

    fn capabilities(&self) -> Value {
        let mut args = vec!["--start-maximized".to_string()];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        let mut prefs = json!({
            "plugins.always_open_pdf_externally": true,
            "download.prompt_for_download": false,
        });
        if let Some(dir) = &self.download_dir {
            prefs["download.default_directory"] = json!(dir.to_string_lossy());
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args, "prefs": prefs }
                }
            }
        })
    }

    async fn session_path(&self, suffix: &str) -> Result<String, BrowserError> {
        let guard = self.session_id.lock().await;
        let id = guard.as_ref().ok_or(BrowserError::NoSession)?;
        Ok(format!("/session/{}{}", id, suffix))
    }

    /// Send a command and unwrap the `value` member of the reply
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let payload: Value = response.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(value);
        }

        let error = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
            .to_string();
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        if error == "no such element" {
            return Err(BrowserError::ElementNotFound(message));
        }
        Err(BrowserError::Protocol { error, message })
    }
}

#[async_trait]
impl WebActuator for WebDriverClient {
    async fn start(&self) -> Result<(), BrowserError> {
        let value = self
            .command(Method::POST, "/session", Some(self.capabilities()))
            .await?;
        let id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrowserError::Protocol {
                error: "session not created".to_string(),
                message: "reply has no sessionId".to_string(),
            })?;
        info!(session = %id, "Browser session started");
        *self.session_id.lock().await = Some(id.to_string());
        Ok(())
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        let Some(id) = self.session_id.lock().await.take() else {
            return Ok(());
        };
        self.command(Method::DELETE, &format!("/session/{}", id), None)
            .await?;
        info!(session = %id, "Browser session closed");
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        debug!(url = %url, "Navigate");
        let path = self.session_path("/url").await?;
        self.command(Method::POST, &path, Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn find(&self, locator: &Locator) -> Result<ElementRef, BrowserError> {
        let (using, value) = match locator {
            Locator::Css(s) => ("css selector", s),
            Locator::Xpath(s) => ("xpath", s),
        };
        let path = self.session_path("/element").await?;
        let reply = self
            .command(Method::POST, &path, Some(json!({ "using": using, "value": value })))
            .await?;
        reply
            .get(ELEMENT_KEY)
            .and_then(|v| v.as_str())
            .map(|id| ElementRef(id.to_string()))
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))
    }

    async fn click(&self, element: &ElementRef) -> Result<(), BrowserError> {
        let path = self
            .session_path(&format!("/element/{}/click", element.0))
            .await?;
        self.command(Method::POST, &path, Some(json!({}))).await?;
        Ok(())
    }

    async fn fill(&self, element: &ElementRef, text: &str) -> Result<(), BrowserError> {
        let clear = self
            .session_path(&format!("/element/{}/clear", element.0))
            .await?;
        self.command(Method::POST, &clear, Some(json!({}))).await?;

        let value = self
            .session_path(&format!("/element/{}/value", element.0))
            .await?;
        self.command(Method::POST, &value, Some(json!({ "text": text })))
            .await?;
        Ok(())
    }

    async fn window_handles(&self) -> Result<Vec<String>, BrowserError> {
        let path = self.session_path("/window/handles").await?;
        let value = self.command(Method::GET, &path, None).await?;
        Ok(value
            .as_array()
            .map(|handles| {
                handles
                    .iter()
                    .filter_map(|h| h.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn switch_to_window(&self, handle: &str) -> Result<(), BrowserError> {
        let path = self.session_path("/window").await?;
        self.command(Method::POST, &path, Some(json!({ "handle": handle })))
            .await?;
        Ok(())
    }

    async fn close_window(&self) -> Result<(), BrowserError> {
        let path = self.session_path("/window").await?;
        self.command(Method::DELETE, &path, None).await?;
        Ok(())
    }
}
