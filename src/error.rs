//! Error types for the outreach agent.

use std::time::Duration;

use crate::contacts::model::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A compare-and-set guard matched no row; the caller acted on stale state.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Content generation failures. Always transient: the contact is retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Malformed {stage} content: {reason}")]
    Malformed { stage: String, reason: String },

    #[error("Empty {what} returned by the model")]
    Empty { what: String },

    #[error("Generation timed out after {0:?}")]
    Timeout(Duration),
}

/// Mail transport failures. Always transient.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send to {to} failed: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Mailbox search failed: {0}")]
    SearchFailed(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Transport call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by `CampaignController::advance`.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Contact {contact_id}: content generation failed: {source}")]
    Generation {
        contact_id: i64,
        #[source]
        source: GenerationError,
    },

    #[error("Contact {contact_id}: mail transport failed: {source}")]
    Transport {
        contact_id: i64,
        #[source]
        source: TransportError,
    },

    /// A read or pre-send write failed. No mail was sent.
    #[error("Contact {contact_id}: store unavailable: {source}")]
    Store {
        contact_id: i64,
        #[source]
        source: DatabaseError,
    },

    /// Mail went out but the commit did not. Needs reconciliation on the next tick.
    #[error("Contact {contact_id}: {stage} was sent but not recorded (reconciliation required): {source}")]
    Persistence {
        contact_id: i64,
        stage: Stage,
        #[source]
        source: DatabaseError,
    },
}

impl CampaignError {
    /// Contact the error belongs to.
    pub fn contact_id(&self) -> i64 {
        match self {
            Self::Generation { contact_id, .. }
            | Self::Transport { contact_id, .. }
            | Self::Store { contact_id, .. }
            | Self::Persistence { contact_id, .. } => *contact_id,
        }
    }

    /// Whether the store may now disagree with what the mail transport did.
    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
