//! Authentication recovery
//!
//! Every upstream request goes through [`with_auth_retry`]. An authentication
//! failure, whether reported before the body or in-band mid-stream, earns one
//! credential refresh and one re-issue of the identical request. Anything else
//! is terminal.

use crate::types::{ObservedError, ParleyError, Result, TurnId, TurnRequest};
use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use tokio::sync::RwLock;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(***)")
    }
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn current(&self) -> Result<Credential>;
    async fn refresh(&self) -> Result<Credential>;
}

/// One request awaiting an answer, with its single-use retry allowance.
#[derive(Debug)]
pub struct RetryContext {
    pub request: TurnRequest,
    pub turn_id: TurnId,
    retried: bool,
}

impl RetryContext {
    pub fn new(request: TurnRequest, turn_id: TurnId) -> Self {
        Self {
            request,
            turn_id,
            retried: false,
        }
    }

    pub fn has_retried(&self) -> bool {
        self.retried
    }

    fn take_retry(&mut self) -> bool {
        if self.retried {
            return false;
        }
        self.retried = true;
        true
    }
}

/// Runs `issue` with the current credential. On an authentication failure,
/// refreshes the credential and runs it once more; the second outcome is final.
pub async fn with_auth_retry<C, F, Fut, T>(
    ctx: &mut RetryContext,
    credentials: &C,
    mut issue: F,
) -> Result<T>
where
    C: CredentialSource + ?Sized,
    F: FnMut(Credential) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let credential = credentials.current().await?;
    match issue(credential).await {
        Ok(val) => Ok(val),
        Err(e) if e.is_auth_failure() && ctx.take_retry() => {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Authentication failed for turn {}: {}. Refreshing credential and retrying once",
                ctx.turn_id.short(),
                e.inner
            );
            let fresh = credentials.refresh().await?;
            issue(fresh).await
        }
        Err(e) => Err(e),
    }
}

/// Maps an in-band error object onto the error taxonomy.
pub fn upstream_error(status: Option<u16>, message: String) -> ObservedError {
    match status.and_then(|s| StatusCode::from_u16(s).ok()) {
        Some(StatusCode::UNAUTHORIZED) | Some(StatusCode::FORBIDDEN) => {
            ParleyError::Unauthorized(message).into()
        }
        Some(code) => ParleyError::Upstream(code, message).into(),
        None => ParleyError::Upstream(StatusCode::BAD_GATEWAY, message).into(),
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Holds the current access token and exchanges the refresh token for a new
/// one over HTTP.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    refresh_url: String,
    access: RwLock<Credential>,
    refresh_token: RwLock<String>,
}

impl HttpCredentialSource {
    pub fn new(
        client: reqwest::Client,
        refresh_url: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            refresh_url: refresh_url.into(),
            access: RwLock::new(Credential::new(access_token)),
            refresh_token: RwLock::new(refresh_token.into()),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn current(&self) -> Result<Credential> {
        Ok(self.access.read().await.clone())
    }

    async fn refresh(&self) -> Result<Credential> {
        let refresh_token = self.refresh_token.read().await.clone();
        let response = self
            .client
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(ParleyError::Network)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ParleyError::Unauthorized("Credential refresh was rejected".to_string()).into());
        }
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            return Err(ParleyError::Upstream(status, format!("Credential refresh failed: {}", body)).into());
        }

        let parsed: RefreshResponse = response.json().await.map_err(ParleyError::Network)?;
        let fresh = Credential::new(parsed.access_token);
        *self.access.write().await = fresh.clone();
        if let Some(rotated) = parsed.refresh_token {
            *self.refresh_token.write().await = rotated;
        }
        tracing::info!("[⚙️ ] Credential refreshed");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingCredentials {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl CredentialSource for CountingCredentials {
        async fn current(&self) -> Result<Credential> {
            Ok(Credential::new("stale"))
        }

        async fn refresh(&self) -> Result<Credential> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::new("fresh"))
        }
    }

    fn ctx() -> RetryContext {
        RetryContext::new(
            TurnRequest {
                conversation_id: ConversationId::from("c1"),
                prompt: "hi".into(),
                model: "gpt-4o".into(),
                user_id: None,
            },
            TurnId::from("t1"),
        )
    }

    fn creds() -> CountingCredentials {
        CountingCredentials {
            refreshes: AtomicU32::new(0),
        }
    }

    #[tokio::test]
    async fn test_auth_failure_retries_once_with_fresh_credential() {
        let mut ctx = ctx();
        let creds = creds();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = with_auth_retry(&mut ctx, &creds, move |cred| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if cred.secret() == "stale" {
                    Err(ObservedError::from(ParleyError::Unauthorized("expired".into())))
                } else {
                    Ok("answer")
                }
            }
        })
        .await;

        match result {
            Ok(v) => assert_eq!(v, "answer"),
            Err(e) => panic!("Expected success after retry, got {}", e),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 1);
        assert!(ctx.has_retried());
    }

    #[tokio::test]
    async fn test_second_auth_failure_is_terminal() {
        let mut ctx = ctx();
        let creds = creds();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = with_auth_retry(&mut ctx, &creds, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ObservedError::from(ParleyError::Upstream(StatusCode::UNAUTHORIZED, "nope".into())))
            }
        })
        .await;

        match result {
            Err(e) => assert!(e.is_auth_failure()),
            Ok(_) => panic!("Expected terminal auth failure"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_failures_are_not_retried() {
        let mut ctx = ctx();
        let creds = creds();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = with_auth_retry(&mut ctx, &creds, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ObservedError::from(ParleyError::Upstream(StatusCode::INTERNAL_SERVER_ERROR, "boom".into())))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 0);
        assert!(!ctx.has_retried());
    }

    #[tokio::test]
    async fn test_retry_allowance_is_single_use() {
        let mut ctx = ctx();
        let creds = creds();
        for _ in 0..2 {
            let _: Result<()> = with_auth_retry(&mut ctx, &creds, |_| async {
                Err(ObservedError::from(ParleyError::Unauthorized("expired".into())))
            })
            .await;
        }
        assert_eq!(creds.refreshes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inband_error_mapping() {
        assert!(upstream_error(Some(401), "expired".into()).is_auth_failure());
        assert!(upstream_error(Some(403), "denied".into()).is_auth_failure());
        assert!(!upstream_error(Some(429), "slow down".into()).is_auth_failure());
        assert!(!upstream_error(None, "???".into()).is_auth_failure());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        assert_eq!(format!("{:?}", Credential::new("sk-secret")), "Credential(***)");
    }
}
