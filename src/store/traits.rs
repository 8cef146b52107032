//! `ContactStore` trait — the single async interface for campaign persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::contacts::model::{
    Contact, ContactFilter, ContactUpdate, NewContact, SendLog, Stage, Transition,
};
use crate::error::DatabaseError;

/// Backend-agnostic contact store.
///
/// Exclusively owns persisted contact state. Callers hold transient copies
/// and write back through `apply_transition`, which commits the contact
/// update and the matching send log as one unit.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Validate and insert a contact in `pending` status. Returns its id.
    async fn insert_contact(&self, contact: &NewContact) -> Result<i64, DatabaseError>;

    /// Get a contact by id.
    async fn get(&self, id: i64) -> Result<Option<Contact>, DatabaseError>;

    /// Look up a contact by email address (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Fetch contacts matching a filter, ordered by id.
    async fn fetch(&self, filter: ContactFilter) -> Result<Vec<Contact>, DatabaseError>;

    /// Unconditionally update fields on a contact.
    async fn update(&self, contact_id: i64, fields: &ContactUpdate) -> Result<(), DatabaseError>;

    /// Apply a guarded transition in one transaction.
    ///
    /// Fails with `DatabaseError::Conflict` and writes nothing if the contact
    /// is no longer in `transition.expected`, or if the referenced log is not
    /// a pending claim. Returns the contact as committed.
    async fn apply_transition(&self, transition: &Transition) -> Result<Contact, DatabaseError>;

    // ── Send logs ───────────────────────────────────────────────────

    /// Claim a stage for sending by recording its content as `pending`.
    ///
    /// Re-arms a previously `failed` row. Fails with `DatabaseError::Conflict`
    /// if a `pending` or `sent` row already exists for `(contact_id, stage)`.
    async fn insert_log(
        &self,
        contact_id: i64,
        stage: Stage,
        subject: &str,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    /// Get the log for one stage of one contact.
    async fn get_log(&self, contact_id: i64, stage: Stage)
    -> Result<Option<SendLog>, DatabaseError>;

    /// All logs for a contact, oldest first.
    async fn list_logs(&self, contact_id: i64) -> Result<Vec<SendLog>, DatabaseError>;

    /// Release a claim after a failed send so the stage can be retried.
    async fn mark_log_failed(&self, log_id: Uuid) -> Result<(), DatabaseError>;
}
