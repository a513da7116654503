//! The send-one-message capability the dispatch loop depends on.

use async_trait::async_trait;
use thiserror::Error;

/// Why a single send did not go through. Never retried by the sender itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The API answered, but rejected the message (non-2xx or an error payload).
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never got a usable answer (DNS, TLS, timeout, bad body).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Acknowledgement of an accepted message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider-side message id, when the API returns one.
    pub message_id: Option<String>,
}

/// Delivers one text message from one sending identity to one recipient.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn name(&self) -> &str;

    /// `credential` is the sending instance's API token; `phone` must already
    /// be normalized.
    async fn send_text(
        &self,
        credential: &str,
        phone: &str,
        text: &str,
    ) -> Result<SendReceipt, SendError>;
}
