//! Remote code-execution sandbox used by the assistant.
//!
//! The sandbox service takes `{"language", "code"}` at `POST {url}/execute`
//! and answers with `text`, `stdout`, `stderr` and an optional `error`.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::error::{PosError, PosResult};

pub const DEFAULT_SANDBOX_URL: &str = "https://api.e2b.dev";
pub const SKIPPED_NO_KEY: &str = "Code execution skipped: API Key missing.";
const NO_OUTPUT: &str = "Code executed successfully (No output).";
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_CODE_LEN: usize = 20_000;

#[derive(Debug, Default, Deserialize)]
struct ExecutionError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct Execution {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stdout: Vec<String>,
    #[serde(default)]
    stderr: Vec<String>,
    #[serde(default)]
    error: Option<ExecutionError>,
}

impl Execution {
    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(text) = self.text.as_deref().filter(|t| !t.is_empty()) {
            out.push_str(text);
            out.push('\n');
        }
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout.join("\n"));
            out.push('\n');
        }
        if !self.stderr.is_empty() {
            out.push_str("ERROR: ");
            out.push_str(&self.stderr.join("\n"));
            out.push('\n');
        }
        if let Some(err) = &self.error {
            out.push_str(&format!("EXCEPTION: {}: {}", err.name, err.value));
        }
        let trimmed = out.trim();
        if trimmed.is_empty() {
            NO_OUTPUT.to_string()
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Clone)]
pub struct Sandbox {
    http: Client,
    api_key: Option<Zeroizing<String>>,
    base_url: String,
}

impl Sandbox {
    pub fn new(api_key: Option<Zeroizing<String>>, base_url: Option<&str>) -> Self {
        let http = Client::builder()
            .timeout(EXEC_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client for sandbox: {e}");
                Client::new()
            });
        let base_url = base_url
            .unwrap_or(DEFAULT_SANDBOX_URL)
            .trim()
            .trim_end_matches('/')
            .to_string();
        Self {
            http,
            api_key,
            base_url,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Run a Python snippet. Sandbox failures come back as text, not errors;
    /// only invalid input is an `Err`.
    pub async fn execute_python(&self, code: &str) -> PosResult<String> {
        if code.trim().is_empty() {
            return Err(PosError::Validation("El código es obligatorio".into()));
        }
        if code.len() > MAX_CODE_LEN {
            return Err(PosError::Validation("El código es demasiado largo".into()));
        }
        let Some(key) = self.api_key.as_ref() else {
            warn!("E2B_API_KEY missing; skipping code execution");
            return Ok(SKIPPED_NO_KEY.to_string());
        };

        info!(bytes = code.len(), "Executing code in sandbox");
        let result = self
            .http
            .post(format!("{}/execute", self.base_url))
            .header("X-API-Key", key.as_str())
            .json(&json!({ "language": "python", "code": code }))
            .send()
            .await;

        let resp = match result {
            Ok(r) => r,
            Err(e) => {
                error!("Sandbox request failed: {e}");
                return Ok(format!("System Error: {e}"));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            error!(status = %status, detail = %detail, "Sandbox rejected execution");
            return Ok(format!("System Error: sandbox returned HTTP {}", status.as_u16()));
        }
        match resp.json::<Execution>().await {
            Ok(execution) => Ok(execution.render()),
            Err(e) => {
                error!("Sandbox response could not be decoded: {e}");
                Ok(format!("System Error: {e}"))
            }
        }
    }
}
