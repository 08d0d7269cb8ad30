//! Transactional email through the Resend HTTP API.
//!
//! Without `RESEND_API_KEY` nothing is sent and callers get `false`, which
//! the auth handlers surface as "code not delivered".

use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct Mailer {
    http: Client,
    api_key: Option<Zeroizing<String>>,
    from: String,
    endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Verification,
    PasswordReset,
}

impl CodePurpose {
    fn subject(self) -> &'static str {
        match self {
            CodePurpose::Verification => "Tu código de verificación - Lavaseco Orquídeas",
            CodePurpose::PasswordReset => "Recupera tu contraseña - Lavaseco Orquídeas",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            CodePurpose::Verification => "Verifica tu cuenta",
            CodePurpose::PasswordReset => "Restablece tu contraseña",
        }
    }
}

pub fn code_email_html(purpose: CodePurpose, code: &str) -> String {
    format!(
        "<div style=\"font-family:sans-serif;max-width:480px;margin:auto\">\
         <h2>{heading}</h2>\
         <p>Usa este código en Lavaseco Orquídeas:</p>\
         <p style=\"font-size:32px;font-weight:bold;letter-spacing:6px\">{code}</p>\
         <p style=\"color:#666\">Si no solicitaste este código, ignora este correo.</p>\
         </div>",
        heading = purpose.heading(),
    )
}

impl Mailer {
    pub fn new(api_key: Option<Zeroizing<String>>, from: &str) -> Self {
        Self::with_endpoint(api_key, from, RESEND_ENDPOINT)
    }

    pub fn with_endpoint(api_key: Option<Zeroizing<String>>, from: &str, endpoint: &str) -> Self {
        let http = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client for email: {e}");
                Client::new()
            });
        Self {
            http,
            api_key,
            from: from.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// Mailer that never sends.
    pub fn disabled() -> Self {
        Self::new(None, crate::config::DEFAULT_EMAIL_FROM)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Send a one-time code. Returns whether the provider accepted it.
    pub async fn send_code(&self, to: &str, code: &str, purpose: CodePurpose) -> bool {
        let Some(key) = self.api_key.as_ref() else {
            warn!(purpose = ?purpose, "RESEND_API_KEY not set; code email not sent");
            return false;
        };

        let body = json!({
            "from": self.from,
            "to": [to],
            "subject": purpose.subject(),
            "html": code_email_html(purpose, code),
        });

        let result = self
            .http
            .post(&self.endpoint)
            .bearer_auth(key.as_str())
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(purpose = ?purpose, "Code email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                error!(status = %status, detail = %detail, "Email provider rejected message");
                false
            }
            Err(e) => {
                error!("Email send failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_mailer_does_not_send() {
        let mailer = Mailer::disabled();
        assert!(!mailer.is_configured());
        assert!(!mailer.send_code("a@b.co", "123456", CodePurpose::Verification).await);
    }

    #[test]
    fn test_html_contains_code() {
        let html = code_email_html(CodePurpose::PasswordReset, "654321");
        assert!(html.contains("654321"));
        assert!(html.contains("Restablece"));
    }
}
