//! Mail transport: outbound SMTP and inbound reply search over IMAP.

pub mod reply;
pub mod smtp_imap;
pub mod text;

pub use reply::{FoundReply, ReplyCandidate};
pub use smtp_imap::EmailTransport;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;

/// Whether a message recorded as claimed actually went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendConfirmation {
    /// Found in the sent mailbox, with its send time.
    Delivered(DateTime<Utc>),
    /// Searched and not found; safe to send again.
    NotFound,
    /// The transport cannot tell.
    Unknown,
}

/// Sends mail and looks for replies.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send a plain-text message.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError>;

    /// Look for a reply from `from`, strictly after `after` when given.
    async fn find_reply(
        &self,
        from: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Option<FoundReply>, TransportError>;

    /// Check whether a message to `to` with `subject` was sent at or after `after`.
    async fn confirm_sent(
        &self,
        _to: &str,
        _subject: &str,
        _after: DateTime<Utc>,
    ) -> Result<SendConfirmation, TransportError> {
        Ok(SendConfirmation::Unknown)
    }
}
