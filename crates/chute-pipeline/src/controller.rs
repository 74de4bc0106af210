//! Remote controller client used by the progress reporter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("controller returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("controller unavailable: {0}")]
    Unavailable(String),
}

/// One progress line as the controller stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressMessage {
    /// Seconds since the epoch.
    pub time: f64,
    pub message: String,
}

#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn post_message(
        &self,
        update_id: &str,
        message: &ProgressMessage,
    ) -> Result<(), ControllerError>;

    /// Mark the update completed with its final result.
    async fn complete(&self, update_id: &str, success: bool) -> Result<(), ControllerError>;
}

#[derive(Debug, Clone)]
pub struct HttpController {
    client: reqwest::Client,
    base: String,
    router_id: String,
    token: Option<String>,
}

impl HttpController {
    pub fn new(
        base: &str,
        router_id: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            router_id: router_id.to_string(),
            token,
        })
    }

    fn update_url(&self, update_id: &str) -> String {
        format!(
            "{}/api/routers/{}/updates/{}",
            self.base, self.router_id, update_id
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: String) -> Result<(), ControllerError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(ControllerError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for HttpController {
    async fn post_message(
        &self,
        update_id: &str,
        message: &ProgressMessage,
    ) -> Result<(), ControllerError> {
        let url = format!("{}/messages", self.update_url(update_id));
        self.send(self.client.post(&url).json(message), url).await
    }

    async fn complete(&self, update_id: &str, success: bool) -> Result<(), ControllerError> {
        let url = self.update_url(update_id);
        let body = json!([
            {"op": "replace", "path": "/completed", "value": true},
            {"op": "replace", "path": "/success", "value": success},
        ]);
        self.send(self.client.patch(&url).json(&body), url).await
    }
}

// ── Mock ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockInner {
    messages: Vec<(String, String)>,
    completions: Vec<(String, bool)>,
    failures_left: usize,
}

/// Records what the reporter sends. Can refuse the next N requests.
#[derive(Clone, Default)]
pub struct MockController {
    inner: Arc<Mutex<MockInner>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.inner.lock().failures_left = n;
    }

    /// `(update id, message)` pairs in delivery order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.inner.lock().messages.clone()
    }

    pub fn completions(&self) -> Vec<(String, bool)> {
        self.inner.lock().completions.clone()
    }

    fn gate(inner: &mut MockInner) -> Result<(), ControllerError> {
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(ControllerError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for MockController {
    async fn post_message(
        &self,
        update_id: &str,
        message: &ProgressMessage,
    ) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        inner
            .messages
            .push((update_id.to_string(), message.message.clone()));
        Ok(())
    }

    async fn complete(&self, update_id: &str, success: bool) -> Result<(), ControllerError> {
        let mut inner = self.inner.lock();
        Self::gate(&mut inner)?;
        inner.completions.push((update_id.to_string(), success));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_url_layout() {
        let c = HttpController::new(
            "https://ctl.example.org/",
            "r1",
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            c.update_url("42"),
            "https://ctl.example.org/api/routers/r1/updates/42"
        );
    }

    #[tokio::test]
    async fn mock_refuses_then_accepts() {
        let mock = MockController::new();
        mock.fail_next(1);
        let msg = ProgressMessage {
            time: 0.0,
            message: "hello".into(),
        };
        assert!(mock.post_message("1", &msg).await.is_err());
        mock.post_message("1", &msg).await.unwrap();
        mock.complete("1", true).await.unwrap();
        assert_eq!(mock.messages(), vec![("1".to_string(), "hello".to_string())]);
        assert_eq!(mock.completions(), vec![("1".to_string(), true)]);
    }
}
