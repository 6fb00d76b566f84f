use crate::http::build_client;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

const DEFAULT_VERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptchaError {
    #[error("captcha token is required")]
    Missing,
    #[error("captcha verification failed")]
    Rejected,
    #[error("captcha verifier unavailable: {0}")]
    Unavailable(String),
}

impl CaptchaError {
    pub fn code(&self) -> &'static str {
        match self {
            CaptchaError::Missing => "captcha_required",
            CaptchaError::Rejected => "captcha_failed",
            CaptchaError::Unavailable(_) => "captcha_unavailable",
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Server-side captcha check. Without a configured secret every request passes.
#[derive(Debug, Clone)]
pub struct CaptchaVerifier {
    secret: Option<String>,
    verify_url: String,
    http: Client,
}

impl CaptchaVerifier {
    pub fn from_env() -> Self {
        let secret = std::env::var("CAPTCHA_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let verify_url = std::env::var("CAPTCHA_VERIFY_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VERIFY_URL.to_string());
        Self::new(secret, verify_url)
    }

    pub fn new(secret: Option<String>, verify_url: String) -> Self {
        Self {
            secret,
            verify_url,
            http: build_client(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, DEFAULT_VERIFY_URL.to_string())
    }

    pub async fn verify(&self, token: Option<&str>, remote_ip: Option<&str>) -> Result<(), CaptchaError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CaptchaError::Missing)?;

        let mut body = json!({ "secret": secret, "response": token });
        if let Some(ip) = remote_ip {
            body["remoteip"] = json!(ip);
        }
        let response = self
            .http
            .post(&self.verify_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| CaptchaError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CaptchaError::Unavailable(format!(
                "verifier responded with HTTP {}",
                response.status().as_u16()
            )));
        }
        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|err| CaptchaError::Unavailable(err.to_string()))?;
        if verdict.success {
            Ok(())
        } else {
            warn!(
                target = "dealer_sync.captcha",
                codes = ?verdict.error_codes,
                "captcha rejected"
            );
            Err(CaptchaError::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::post};
    use serde_json::Value;

    async fn spawn_verifier() -> String {
        let app = Router::new().route(
            "/siteverify",
            post(|Json(body): Json<Value>| async move {
                let ok = body["secret"] == "s3cret" && body["response"] == "good-token";
                Json(json!({ "success": ok, "error-codes": if ok { vec![] } else { vec!["invalid-input-response"] } }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/siteverify")
    }

    #[tokio::test]
    async fn no_secret_allows_everything() {
        let verifier = CaptchaVerifier::disabled();
        assert_eq!(verifier.verify(None, None).await, Ok(()));
    }

    #[tokio::test]
    async fn checks_token_with_verifier() {
        let url = spawn_verifier().await;
        let verifier = CaptchaVerifier::new(Some("s3cret".into()), url);
        assert_eq!(verifier.verify(Some("good-token"), Some("10.0.0.1")).await, Ok(()));
        assert_eq!(
            verifier.verify(Some("bad"), None).await,
            Err(CaptchaError::Rejected)
        );
        assert_eq!(verifier.verify(Some("  "), None).await, Err(CaptchaError::Missing));
    }

    #[tokio::test]
    async fn unreachable_verifier_denies() {
        let verifier = CaptchaVerifier::new(Some("s3cret".into()), "http://127.0.0.1:9/siteverify".into());
        let err = verifier.verify(Some("good-token"), None).await.unwrap_err();
        assert_eq!(err.code(), "captcha_unavailable");
    }
}
