mod session;
mod webdriver;

pub use session::{SessionControl, WebSession};
pub use webdriver::WebDriverClient;

use crate::operations::OperationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("WebDriver request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("WebDriver error '{error}': {message}")]
    Protocol { error: String, message: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("No browser session; acquire one first")]
    NoSession,
}

impl From<BrowserError> for OperationError {
    fn from(e: BrowserError) -> Self {
        OperationError::Transient(e.to_string())
    }
}

/// How to find an element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locator {
    Css(String),
    Xpath(String),
}

impl Locator {
    /// Same locator with `{name}` placeholders replaced
    pub fn substitute(&self, vars: &Vars) -> Locator {
        match self {
            Locator::Css(s) => Locator::Css(vars.apply(s)),
            Locator::Xpath(s) => Locator::Xpath(vars.apply(s)),
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css={}", s),
            Locator::Xpath(s) => write!(f, "xpath={}", s),
        }
    }
}

/// Opaque handle to an element in the current page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// The operations a recipe can drive. Page knowledge lives in configured
/// [`Step`] recipes.
#[async_trait]
pub trait WebActuator: Send + Sync {
    async fn start(&self) -> Result<(), BrowserError>;
    async fn quit(&self) -> Result<(), BrowserError>;
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;
    async fn find(&self, locator: &Locator) -> Result<ElementRef, BrowserError>;
    async fn click(&self, element: &ElementRef) -> Result<(), BrowserError>;
    /// Clear the element and type `text`
    async fn fill(&self, element: &ElementRef, text: &str) -> Result<(), BrowserError>;
    async fn window_handles(&self) -> Result<Vec<String>, BrowserError>;
    async fn switch_to_window(&self, handle: &str) -> Result<(), BrowserError>;
    async fn close_window(&self) -> Result<(), BrowserError>;

    /// Poll until the element shows up
    async fn wait_for(&self, locator: &Locator, timeout: Duration) -> Result<ElementRef, BrowserError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.find(locator).await {
                Ok(element) => return Ok(element),
                Err(BrowserError::ElementNotFound(_)) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(BrowserError::ElementNotFound(_)) => {
                    return Err(BrowserError::Timeout {
                        what: locator.to_string(),
                        secs: timeout.as_secs(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One configured browser action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
    },
    Fill {
        locator: Locator,
        value: String,
    },
    Click {
        locator: Locator,
    },
    WaitFor {
        locator: Locator,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Fill every template field; `{field}` in the locator is the field name
    FillFields {
        locator: Locator,
    },
    Pause {
        millis: u64,
    },
}

/// Placeholder values for recipe substitution
#[derive(Debug, Clone, Default)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Replace each `{key}` in `template`; unknown placeholders are left as-is
    pub fn apply(&self, template: &str) -> String {
        self.0.iter().fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
    }
}

/// Run a recipe against the actuator.
///
/// `fields` feeds [`Step::FillFields`]; a recipe using it without fields is a no-op step.
pub async fn run_recipe(
    actuator: &dyn WebActuator,
    steps: &[Step],
    vars: &Vars,
    fields: Option<&BTreeMap<String, String>>,
    default_wait: Duration,
) -> Result<(), BrowserError> {
    for step in steps {
        debug!(step = ?step, "Recipe step");
        match step {
            Step::Navigate { url } => actuator.navigate(&vars.apply(url)).await?,
            Step::Fill { locator, value } => {
                let element = actuator.wait_for(&locator.substitute(vars), default_wait).await?;
                actuator.fill(&element, &vars.apply(value)).await?;
            }
            Step::Click { locator } => {
                let element = actuator.wait_for(&locator.substitute(vars), default_wait).await?;
                actuator.click(&element).await?;
            }
            Step::WaitFor {
                locator,
                timeout_secs,
            } => {
                let timeout = timeout_secs.map(Duration::from_secs).unwrap_or(default_wait);
                actuator.wait_for(&locator.substitute(vars), timeout).await?;
            }
            Step::FillFields { locator } => {
                for (field, value) in fields.into_iter().flatten() {
                    let field_vars = vars.clone().set("field", field.as_str());
                    let element = actuator
                        .wait_for(&locator.substitute(&field_vars), default_wait)
                        .await?;
                    actuator.fill(&element, value).await?;
                }
            }
            Step::Pause { millis } => tokio::time::sleep(Duration::from_millis(*millis)).await,
        }
    }
    Ok(())
}
