//! Industry classification and per-stage email copy.

pub mod generator;
pub mod parse;

pub use generator::LlmContentGenerator;
pub use parse::parse_subject_body;

use async_trait::async_trait;

use crate::contacts::model::{Contact, Stage};
use crate::error::GenerationError;

/// A generated subject/body pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

impl EmailContent {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Produces the words. Every failure is transient and retried on the next tick.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Classify a company into a short industry label.
    async fn classify_industry(
        &self,
        company_name: &str,
        company_url: Option<&str>,
    ) -> Result<String, GenerationError>;

    /// Write the email for one stage of one contact.
    async fn generate(&self, contact: &Contact, stage: Stage)
    -> Result<EmailContent, GenerationError>;
}
