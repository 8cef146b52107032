//! Configuration types, built from environment variables.
//!
//! Every constructor has a `from_env()` form and a `from_lookup()` form that
//! takes the variable source as a closure, so tests never touch the process
//! environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read and parse an optional variable, falling back to `default` when unset.
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ── Campaign ────────────────────────────────────────────────────────

/// Scheduler and controller settings.
#[derive(Debug, Clone)]
pub struct CampaignConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Time between scheduler ticks (the campaign's "day").
    pub tick_interval: Duration,
    /// Last drip step sent before a contact is exhausted.
    pub max_drip_step: u32,
    /// Contacts advanced in parallel within one tick.
    pub max_concurrent: usize,
    /// Timeout applied to each generator and transport call.
    pub call_timeout: Duration,
    /// Age after which an unconfirmed send claim is reconciled instead of skipped.
    pub send_claim_timeout: Duration,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/outreach.db"),
            tick_interval: Duration::from_secs(86_400), // 1 day
            max_drip_step: 3,
            max_concurrent: 4,
            call_timeout: Duration::from_secs(120),
            send_claim_timeout: Duration::from_secs(900), // 15 minutes
        }
    }
}

impl CampaignConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            db_path: non_empty(&lookup, "OUTREACH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            tick_interval: Duration::from_secs(parse_or(
                &lookup,
                "OUTREACH_TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            max_drip_step: parse_or(&lookup, "OUTREACH_MAX_DRIP_STEP", defaults.max_drip_step)?,
            max_concurrent: parse_or(&lookup, "OUTREACH_MAX_CONCURRENT", defaults.max_concurrent)?,
            call_timeout: Duration::from_secs(parse_or(
                &lookup,
                "OUTREACH_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            send_claim_timeout: Duration::from_secs(parse_or(
                &lookup,
                "OUTREACH_SEND_CLAIM_TIMEOUT_SECS",
                defaults.send_claim_timeout.as_secs(),
            )?),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.max_drip_step == 0 {
            return Err(invalid("OUTREACH_MAX_DRIP_STEP", "must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("OUTREACH_TICK_INTERVAL_SECS", "must be positive"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("OUTREACH_MAX_CONCURRENT", "must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(invalid("OUTREACH_CALL_TIMEOUT_SECS", "must be positive"));
        }
        Ok(())
    }
}

// ── LLM ─────────────────────────────────────────────────────────────

/// Configuration for the OpenAI-compatible completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            api_key: SecretString::from(required(&lookup, "OPENAI_API_KEY")?),
            base_url: non_empty(&lookup, "OUTREACH_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: non_empty(&lookup, "OUTREACH_LLM_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        })
    }
}

// ── Sender persona ──────────────────────────────────────────────────

/// Who the campaign speaks as. Fed into every generation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderProfile {
    pub sender_name: String,
    pub sender_company: String,
    /// Replaces the `[Booking Link]` placeholder in meeting requests.
    pub booking_link: Option<String>,
}

impl Default for SenderProfile {
    fn default() -> Self {
        Self {
            sender_name: "The Team".to_string(),
            sender_company: "Our Company".to_string(),
            booking_link: None,
        }
    }
}

impl SenderProfile {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            sender_name: non_empty(&lookup, "OUTREACH_SENDER_NAME").unwrap_or(defaults.sender_name),
            sender_company: non_empty(&lookup, "OUTREACH_SENDER_COMPANY")
                .unwrap_or(defaults.sender_company),
            booking_link: non_empty(&lookup, "OUTREACH_BOOKING_LINK"),
        }
    }
}

// ── Email ───────────────────────────────────────────────────────────

/// Mail transport configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Mailbox searched for replies.
    pub inbox: String,
    /// Mailbox searched to confirm an unrecorded send. `None` disables confirmation.
    pub sent_mailbox: Option<String>,
}

impl EmailConfig {
    /// Build config from environment variables. `EMAIL_IMAP_HOST` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let imap_host = required(&lookup, "EMAIL_IMAP_HOST")?;
        let imap_port: u16 = parse_or(&lookup, "EMAIL_IMAP_PORT", 993)?;

        let smtp_host = non_empty(&lookup, "EMAIL_SMTP_HOST")
            .unwrap_or_else(|| imap_host.replace("imap", "smtp"));
        let smtp_port: u16 = parse_or(&lookup, "EMAIL_SMTP_PORT", 587)?;

        let username = required(&lookup, "EMAIL_USERNAME")?;
        let password = SecretString::from(lookup("EMAIL_PASSWORD").unwrap_or_default());
        let from_address =
            non_empty(&lookup, "EMAIL_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        from_address
            .parse::<lettre::Address>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "EMAIL_FROM_ADDRESS".to_string(),
                message: format!("{from_address:?}: {e}"),
            })?;

        Ok(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            inbox: non_empty(&lookup, "EMAIL_INBOX").unwrap_or_else(|| "INBOX".to_string()),
            sent_mailbox: non_empty(&lookup, "EMAIL_SENT_MAILBOX"),
        })
    }
}
