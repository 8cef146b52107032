//! In-process collaborators for controller and scheduler tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::contacts::model::{
    Contact, ContactFilter, ContactUpdate, NewContact, SendLog, Stage, Transition,
};
use crate::content::{ContentGenerator, EmailContent};
use crate::error::{DatabaseError, GenerationError, TransportError};
use crate::mail::{FoundReply, MailTransport, SendConfirmation};
use crate::store::{ContactStore, LibSqlBackend};

/// Deterministic content: subject is `"{stage} for {name}"`.
#[derive(Default)]
pub struct FakeGenerator {
    pub fail_classify: AtomicBool,
    pub fail_generate: AtomicBool,
    pub generate_calls: AtomicUsize,
    pub generate_delay_ms: AtomicU64,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentGenerator for FakeGenerator {
    async fn classify_industry(
        &self,
        _company_name: &str,
        _company_url: Option<&str>,
    ) -> Result<String, GenerationError> {
        if self.fail_classify.load(Ordering::SeqCst) {
            return Err(GenerationError::Empty {
                what: "industry".into(),
            });
        }
        Ok("Computing".to_string())
    }

    async fn generate(
        &self,
        contact: &Contact,
        stage: Stage,
    ) -> Result<EmailContent, GenerationError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.generate_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(GenerationError::Malformed {
                stage: stage.to_string(),
                reason: "no subject line".into(),
            });
        }
        Ok(EmailContent::new(
            format!("{stage} for {}", contact.name),
            format!("Hello {}", contact.name),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records sends and reply searches; replies and confirmations are scripted.
pub struct FakeTransport {
    sent: Mutex<Vec<SentMail>>,
    searches: Mutex<Vec<Option<DateTime<Utc>>>>,
    reply: Mutex<Option<FoundReply>>,
    confirmation: Mutex<SendConfirmation>,
    pub fail_sends: AtomicBool,
    pub fail_search: AtomicBool,
    pub search_delay_ms: AtomicU64,
    /// Sends sleep this long before delivering; a timed-out send is not recorded.
    pub send_delay_ms: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            searches: Mutex::new(Vec::new()),
            reply: Mutex::new(None),
            confirmation: Mutex::new(SendConfirmation::Unknown),
            fail_sends: AtomicBool::new(false),
            fail_search: AtomicBool::new(false),
            search_delay_ms: AtomicU64::new(0),
            send_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn set_reply(&self, reply: Option<FoundReply>) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_confirmation(&self, confirmation: SendConfirmation) {
        *self.confirmation.lock().unwrap() = confirmation;
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn searches(&self) -> Vec<Option<DateTime<Utc>>> {
        self.searches.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed {
                to: to.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn find_reply(
        &self,
        _from: &str,
        after: Option<DateTime<Utc>>,
    ) -> Result<Option<FoundReply>, TransportError> {
        let delay = self.search_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(TransportError::SearchFailed("mailbox unavailable".into()));
        }
        self.searches.lock().unwrap().push(after);
        Ok(self.reply.lock().unwrap().clone())
    }

    async fn confirm_sent(
        &self,
        _to: &str,
        _subject: &str,
        _after: DateTime<Utc>,
    ) -> Result<SendConfirmation, TransportError> {
        Ok(*self.confirmation.lock().unwrap())
    }
}

/// Real in-memory store that can be told to fail the next transition.
pub struct FlakyStore {
    inner: LibSqlBackend,
    fail_next_transition: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: LibSqlBackend) -> Self {
        Self {
            inner,
            fail_next_transition: AtomicBool::new(false),
        }
    }

    pub fn fail_next_transition(&self) {
        self.fail_next_transition.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContactStore for FlakyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }

    async fn insert_contact(&self, contact: &NewContact) -> Result<i64, DatabaseError> {
        self.inner.insert_contact(contact).await
    }

    async fn get(&self, id: i64) -> Result<Option<Contact>, DatabaseError> {
        self.inner.get(id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Contact>, DatabaseError> {
        self.inner.find_by_email(email).await
    }

    async fn fetch(&self, filter: ContactFilter) -> Result<Vec<Contact>, DatabaseError> {
        self.inner.fetch(filter).await
    }

    async fn update(&self, contact_id: i64, update: &ContactUpdate) -> Result<(), DatabaseError> {
        self.inner.update(contact_id, update).await
    }

    async fn apply_transition(&self, transition: &Transition) -> Result<Contact, DatabaseError> {
        if self.fail_next_transition.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Query("disk I/O error".into()));
        }
        self.inner.apply_transition(transition).await
    }

    async fn insert_log(
        &self,
        contact_id: i64,
        stage: Stage,
        subject: &str,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        self.inner
            .insert_log(contact_id, stage, subject, body, created_at)
            .await
    }

    async fn get_log(
        &self,
        contact_id: i64,
        stage: Stage,
    ) -> Result<Option<SendLog>, DatabaseError> {
        self.inner.get_log(contact_id, stage).await
    }

    async fn list_logs(&self, contact_id: i64) -> Result<Vec<SendLog>, DatabaseError> {
        self.inner.list_logs(contact_id).await
    }

    async fn mark_log_failed(&self, log_id: Uuid) -> Result<(), DatabaseError> {
        self.inner.mark_log_failed(log_id).await
    }
}
