//! Webhook invoker for key triggers.
//!
//! The slot store only needs "POST this JSON to that URL, don't wait". The HTTP
//! implementation adds:
//! - Exponential backoff on transport errors and retryable statuses
//! - WEBHOOK_AUTH_TOKEN bearer authentication
//! - A keymq User-Agent

use std::time::Duration;

/// Broker version from Cargo.toml, sent as the webhook User-Agent.
pub const KEYMQ_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fire-and-forget webhook delivery.
///
/// Implementations must return promptly; failures are theirs to log.
pub trait WebhookInvoker: Send + Sync {
    fn post(&self, url: &str, json_body: String);
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub timeout: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// reqwest-backed invoker. Each post runs on its own tokio task.
#[derive(Clone)]
pub struct HttpInvoker {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl HttpInvoker {
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("keymq/{}", KEYMQ_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self { client, config })
    }

    /// Deliver one webhook, retrying with backoff. Resolves once delivered or given up.
    pub async fn deliver(&self, url: &str, json_body: String) {
        let mut attempt = 0;
        loop {
            let request = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(json_body.clone());

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(%url, status, "Webhook delivered");
                        return;
                    }

                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(%url, status, "Webhook failed with non-retryable status");
                        return;
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(%url, status, attempts = attempt, "Webhook failed after max retries");
                        return;
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        %url,
                        status,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Webhook failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(%url, error = %e, attempts = attempt, "Webhook failed after max retries");
                        return;
                    }

                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        %url,
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base * (1 << attempt.min(10))
    }
}

impl WebhookInvoker for HttpInvoker {
    fn post(&self, url: &str, json_body: String) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(%url, "No tokio runtime, dropping webhook");
            return;
        };

        let invoker = self.clone();
        let url = url.to_string();
        handle.spawn(async move {
            invoker.deliver(&url, json_body).await;
        });
    }
}
