use crate::error::InvalidCaseId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Number of digits in a judicial process number
pub const CASE_ID_LEN: usize = 20;

/// A judicial process number, normalized to its 20 digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaseId(String);

impl CaseId {
    /// Parse a process number, accepting the punctuated CNJ form
    /// (`5001234-56.2025.4.04.7102`) as well as the bare digits.
    pub fn parse(raw: &str) -> Result<Self, InvalidCaseId> {
        let digits: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '.'))
            .collect();

        if digits.len() == CASE_ID_LEN && digits.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(digits))
        } else {
            Err(InvalidCaseId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// CNJ display form: `NNNNNNN-DD.AAAA.J.TR.OOOO`
    pub fn cnj(&self) -> String {
        let d = &self.0;
        format!(
            "{}-{}.{}.{}.{}.{}",
            &d[0..7],
            &d[7..9],
            &d[9..13],
            &d[13..14],
            &d[14..16],
            &d[16..20]
        )
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CaseId {
    type Err = InvalidCaseId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CaseId {
    type Error = InvalidCaseId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CaseId> for String {
    fn from(id: CaseId) -> Self {
        id.0
    }
}

/// Pipeline phase, in execution order
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Ocr,
    Report,
    Fill,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Download, Stage::Ocr, Stage::Report, Stage::Fill];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Ocr => "ocr",
            Stage::Report => "report",
            Stage::Fill => "fill",
        }
    }

    /// Stage whose Processed set gates this one
    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::Download => None,
            Stage::Ocr => Some(Stage::Download),
            Stage::Report => Some(Stage::Ocr),
            Stage::Fill => Some(Stage::Report),
        }
    }

    /// Stage that consumes this stage's output artifact
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Download => Some(Stage::Ocr),
            Stage::Ocr => Some(Stage::Report),
            Stage::Report => Some(Stage::Fill),
            Stage::Fill => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where inside a stage directory an artifact sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subfolder {
    /// Awaiting the stage
    Root,
    /// Stage completed
    Processed,
    /// Stage failed terminally or exhausted its retries
    Pending,
}

impl Subfolder {
    pub const ALL: [Subfolder; 3] = [Subfolder::Root, Subfolder::Processed, Subfolder::Pending];

    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            Subfolder::Root => None,
            Subfolder::Processed => Some("Processed"),
            Subfolder::Pending => Some("Pending"),
        }
    }
}

impl fmt::Display for Subfolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name().unwrap_or("root"))
    }
}

/// Outcome of applying one stage operation to one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    /// The operation completed; carries the output artifact when the stage produces one
    Success(Option<PathBuf>),
    /// Worth retrying (network, timeout, page not ready, malformed model output)
    TransientFailure(String),
    /// Retrying cannot help (bad identifier, missing credential, broken document)
    TerminalFailure(String),
}

/// Output captured from a child process
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

/// Parsed result line from a worker process
#[derive(Debug, Clone)]
pub struct ParsedResult {
    /// The result value (JSON or string)
    pub value: serde_json::Value,
    /// True if value is a raw unparsed string
    pub is_raw: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_id_accepts_bare_digits() {
        let id = CaseId::parse("50012345620254047102").unwrap();
        assert_eq!(id.as_str(), "50012345620254047102");
    }

    #[test]
    fn test_case_id_strips_cnj_punctuation() {
        let id = CaseId::parse("5008676-91.2024.4.04.7102").unwrap();
        assert_eq!(id.as_str(), "50086769120244047102");
        assert_eq!(id.cnj(), "5008676-91.2024.4.04.7102");
    }

    #[test]
    fn test_case_id_rejects_wrong_width() {
        assert!(CaseId::parse("5001234562025404710").is_err());
        assert!(CaseId::parse("500123456202540471021").is_err());
        assert!(CaseId::parse("5001234562025404710X").is_err());
        assert!(CaseId::parse("50012345620254047102_final").is_err());
        assert!(CaseId::parse("").is_err());
    }

    #[test]
    fn test_case_id_serde_validates() {
        let id: CaseId = serde_json::from_str("\"50012345620254047102\"").unwrap();
        assert_eq!(id.to_string(), "50012345620254047102");
        assert!(serde_json::from_str::<CaseId>("\"123\"").is_err());
    }

    #[test]
    fn test_stage_order_links() {
        assert_eq!(Stage::ALL[0].previous(), None);
        for pair in Stage::ALL.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
        assert_eq!(Stage::Fill.next(), None);
    }
}
