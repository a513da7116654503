//! WhatsApp sending through the UAZAPI gateway.
//!
//! Each connected number is a UAZAPI "instance" with its own token, passed in
//! the `token` header. Text messages go to `POST {base_url}/send/text`.

use async_trait::async_trait;
use std::time::Duration;
use zapflow_core::config::UazapiConfig;
use zapflow_core::error::{Result, ZapflowError};

use crate::sender::{MessageSender, SendError, SendReceipt};

/// UAZAPI-backed message sender.
pub struct UazapiSender {
    base_url: String,
    client: reqwest::Client,
}

impl UazapiSender {
    pub fn new(config: &UazapiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ZapflowError::Channel(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Pull a human-readable reason out of an error payload.
fn error_message(body: &serde_json::Value, fallback: &str) -> String {
    for key in ["error", "message", "details"] {
        match &body[key] {
            serde_json::Value::String(s) if !s.is_empty() => return s.clone(),
            serde_json::Value::Object(_) => return body[key].to_string(),
            _ => {}
        }
    }
    if fallback.is_empty() {
        "unknown error".into()
    } else {
        fallback.to_string()
    }
}

fn message_id(body: &serde_json::Value) -> Option<String> {
    body["messageid"]
        .as_str()
        .or_else(|| body["id"].as_str())
        .or_else(|| body["key"]["id"].as_str())
        .map(String::from)
}

#[async_trait]
impl MessageSender for UazapiSender {
    fn name(&self) -> &str {
        "uazapi"
    }

    async fn send_text(
        &self,
        credential: &str,
        phone: &str,
        text: &str,
    ) -> std::result::Result<SendReceipt, SendError> {
        let body = serde_json::json!({
            "number": phone,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("send/text"))
            .header("token", credential)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("UAZAPI request failed: {e}")))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| SendError::Transport(format!("UAZAPI response unreadable: {e}")))?;
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap_or_default();

        if !status.is_success() {
            return Err(SendError::Api {
                status: status.as_u16(),
                message: error_message(&parsed, raw.trim()),
            });
        }

        // Some UAZAPI builds answer 200 with an error payload.
        let reported_error = match &parsed["error"] {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => !s.is_empty(),
            serde_json::Value::Object(_) => true,
            _ => false,
        };
        if reported_error {
            return Err(SendError::Api {
                status: status.as_u16(),
                message: error_message(&parsed, raw.trim()),
            });
        }

        let receipt = SendReceipt {
            message_id: message_id(&parsed),
        };
        tracing::debug!(
            "UAZAPI message sent: {} → {}",
            receipt.message_id.as_deref().unwrap_or("unknown"),
            phone
        );
        Ok(receipt)
    }
}
