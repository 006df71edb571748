use crate::types::{ParsedResult, ProcessOutput};
use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Worker process exit codes. Anything else counts as a transient failure.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TERMINAL: i32 = 2;

/// Prefix of the line a worker process reports its result on
pub const RESULT_PREFIX: &str = "RESULT:";

/// Run a program and capture its output
pub async fn run_command<S: AsRef<std::ffi::OsStr>>(
    program: &str,
    args: &[S],
    working_dir: Option<&Path>,
) -> Result<ProcessOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute {}", program))?;

    Ok(ProcessOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Result line a worker prints for its parent
pub fn format_result(value: &serde_json::Value) -> String {
    format!("{} {}", RESULT_PREFIX, value)
}

/// Parse result from a worker's output
/// Looks for lines starting with "RESULT:" and tries to parse as JSON
pub fn parse_result(stdout: &str) -> ParsedResult {
    // Search from the end for the last RESULT: line
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if let Some(json_str) = trimmed.strip_prefix(RESULT_PREFIX) {
            let json_str = json_str.trim();
            if json_str.is_empty() {
                continue;
            }
            return match serde_json::from_str(json_str) {
                Ok(value) => ParsedResult {
                    value,
                    is_raw: false,
                },
                Err(_) => ParsedResult {
                    value: serde_json::Value::String(json_str.to_string()),
                    is_raw: true,
                },
            };
        }
    }

    ParsedResult {
        value: serde_json::Value::Null,
        is_raw: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_result_json() {
        let stdout = r#"
Filling 50012345620254047102
RESULT: {"case": "50012345620254047102", "saved": true}
Session closed
"#;
        let result = parse_result(stdout);
        assert!(!result.is_raw);
        assert_eq!(result.value["saved"], true);
    }

    #[test]
    fn test_parse_result_raw() {
        let result = parse_result("RESULT: form saved\n");
        assert!(result.is_raw);
        assert_eq!(result.value, "form saved");
    }

    #[test]
    fn test_parse_result_none() {
        let result = parse_result("no result line");
        assert!(!result.is_raw);
        assert!(result.value.is_null());
    }

    #[test]
    fn test_parse_result_last_wins() {
        let stdout = "RESULT: {\"first\": 1}\nRESULT: {\"second\": 2}\nRESULT:\n";
        assert_eq!(parse_result(stdout).value["second"], 2);
    }

    #[test]
    fn test_format_result_parses_back() {
        let line = format_result(&json!({"error": "template timeout"}));
        assert_eq!(parse_result(&line).value["error"], "template timeout");
    }

    #[tokio::test]
    async fn test_run_command_captures_exit_code() {
        let output = run_command("sh", &["-c", "echo out; echo err >&2; exit 2"], None)
            .await
            .unwrap();
        assert_eq!(output.exit_code, EXIT_TERMINAL);
        assert_eq!(output.stdout_text().trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command::<&str>("definitely-not-a-program-xyz", &[], None).await;
        assert!(err.is_err());
    }
}
