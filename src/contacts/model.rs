//! Contact record, lifecycle status, and the write-side types the store accepts.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a contact within the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// Not yet contacted (possibly not yet classified).
    Pending,
    /// Initial message sent.
    Sent,
    /// At least one drip follow-up sent.
    AwaitingReply,
    /// Reply detected. Terminal.
    Replied,
    /// All drip steps sent without a reply. Terminal.
    Exhausted,
}

impl ContactStatus {
    /// Statuses that take no further automated action.
    pub const TERMINAL: [ContactStatus; 2] = [ContactStatus::Replied, ContactStatus::Exhausted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::AwaitingReply => "awaiting_reply",
            Self::Replied => "replied",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "awaiting_reply" => Ok(Self::AwaitingReply),
            "replied" => Ok(Self::Replied),
            "exhausted" => Ok(Self::Exhausted),
            _ => Err(format!("Unknown contact status: {}", s)),
        }
    }
}

/// A message stage in the campaign sequence.
///
/// Drip step 0 is `Initial`; step `n >= 1` is `Drip(n)`. `MeetingRequest`
/// is sent once, after a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Initial,
    Drip(u32),
    MeetingRequest,
}

impl Stage {
    /// Stage that carries the message for a given drip step.
    pub fn for_drip_step(step: u32) -> Self {
        if step == 0 {
            Self::Initial
        } else {
            Self::Drip(step)
        }
    }

    /// The drip step this stage occupies, if it is part of the drip sequence.
    pub fn drip_step(&self) -> Option<u32> {
        match self {
            Self::Initial => Some(0),
            Self::Drip(n) => Some(*n),
            Self::MeetingRequest => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Drip(n) => write!(f, "drip{}", n),
            Self::MeetingRequest => write!(f, "meeting_request"),
        }
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(Self::Initial),
            "meeting_request" => Ok(Self::MeetingRequest),
            other => other
                .strip_prefix("drip")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n >= 1)
                .map(Self::Drip)
                .ok_or_else(|| format!("Unknown stage: {}", s)),
        }
    }
}

/// A persisted contact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub company_name: String,
    pub company_url: Option<String>,
    pub email: String,
    /// Industry classification; `None` until enriched.
    pub industry: Option<String>,
    pub status: ContactStatus,
    pub drip_step: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub reply_body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// The `(status, drip_step)` pair this record was read with.
    pub fn state_guard(&self) -> StateGuard {
        StateGuard {
            status: self.status,
            drip_step: self.drip_step,
        }
    }

    /// Check record-level invariants. Used when rows are read back from the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.status == ContactStatus::Replied && self.replied_at.is_none() {
            return Err(format!("contact {} is replied without a reply timestamp", self.id));
        }
        Ok(())
    }
}

/// Input for creating a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub company_name: String,
    #[serde(default)]
    pub company_url: Option<String>,
    pub email: String,
}

impl NewContact {
    pub fn new(name: &str, company_name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            company_name: company_name.to_string(),
            company_url: None,
            email: email.to_string(),
        }
    }

    pub fn with_company_url(mut self, url: &str) -> Self {
        self.company_url = Some(url.to_string());
        self
    }

    /// Boundary validation: non-empty name and company, parseable address.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("contact name is empty".into());
        }
        if self.company_name.trim().is_empty() {
            return Err("company name is empty".into());
        }
        self.email
            .trim()
            .parse::<lettre::Address>()
            .map_err(|e| format!("invalid email address {:?}: {e}", self.email))?;
        Ok(())
    }
}

/// Predicate for `ContactStore::fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactFilter {
    All,
    Status(ContactStatus),
    IndustryUnset,
    /// Status not in the terminal set.
    NonTerminal,
}

/// Expected state for a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateGuard {
    pub status: ContactStatus,
    pub drip_step: u32,
}

/// Field changes for a contact. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactUpdate {
    pub industry: Option<String>,
    pub status: Option<ContactStatus>,
    pub drip_step: Option<u32>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub reply_body: Option<String>,
}

impl ContactUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    pub fn status(mut self, status: ContactStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn drip_step(mut self, step: u32) -> Self {
        self.drip_step = Some(step);
        self
    }

    pub fn last_sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_sent_at = Some(at);
        self
    }

    pub fn reply(mut self, at: DateTime<Utc>, body: impl Into<String>) -> Self {
        self.replied_at = Some(at);
        self.reply_body = Some(body.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Marks a claimed send log as delivered, inside the same transaction as the contact update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCommit {
    pub log_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// One atomic state change for one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub contact_id: i64,
    pub expected: StateGuard,
    pub update: ContactUpdate,
    pub log: Option<LogCommit>,
}

impl Transition {
    pub fn new(contact: &Contact, update: ContactUpdate) -> Self {
        Self {
            contact_id: contact.id,
            expected: contact.state_guard(),
            update,
            log: None,
        }
    }

    pub fn with_log(mut self, log_id: Uuid, sent_at: DateTime<Utc>) -> Self {
        self.log = Some(LogCommit { log_id, sent_at });
        self
    }

    /// Reject transitions that would move the drip step backwards.
    pub fn check_monotonic(&self) -> Result<(), String> {
        match self.update.drip_step {
            Some(step) if step < self.expected.drip_step => Err(format!(
                "drip step would decrease from {} to {}",
                self.expected.drip_step, step
            )),
            _ => Ok(()),
        }
    }
}

/// Status of a per-stage send log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// Send claimed; delivery not yet confirmed in the store.
    Pending,
    Sent,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for LogStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown log status: {}", s)),
        }
    }
}

/// Content generated for one stage of one contact.
#[derive(Debug, Clone, PartialEq)]
pub struct SendLog {
    pub id: Uuid,
    pub contact_id: i64,
    pub stage: Stage,
    pub subject: String,
    pub body: String,
    pub status: LogStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}
