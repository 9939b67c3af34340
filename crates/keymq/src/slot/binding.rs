//! Webhook binding carried by a `call_register` body.

use serde::Serialize;

use crate::bridge::protocol::{ProtocolViolation, RoutingKey};

/// Where and what to POST when a key fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookBinding {
    url: String,
    payload: String,
}

#[derive(Serialize)]
struct DefaultPayload {
    key: String,
}

impl WebhookBinding {
    pub fn new(url: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: payload.into(),
        }
    }

    /// Parse a `call_register` body: URL on the first line, payload template after it.
    ///
    /// An empty template becomes `{"key":"<hex>"}`.
    pub fn parse(key: &RoutingKey, body: &[u8]) -> Result<Self, ProtocolViolation> {
        let text = std::str::from_utf8(body)
            .map_err(|e| ProtocolViolation::InvalidBinding(format!("body is not UTF-8: {e}")))?;

        let (url, template) = text.split_once('\n').unwrap_or((text, ""));
        let url = url.trim();
        if url.is_empty() {
            return Err(ProtocolViolation::InvalidBinding("missing URL".to_string()));
        }

        let template = template.trim();
        let payload = if template.is_empty() {
            serde_json::to_string(&DefaultPayload { key: key.to_hex() })
                .map_err(|e| ProtocolViolation::InvalidBinding(e.to_string()))?
        } else {
            template.to_string()
        };

        Ok(Self::new(url, payload))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}
