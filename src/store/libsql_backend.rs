//! libSQL backend — async `ContactStore` implementation.
//!
//! Supports local file and in-memory databases. All access goes through one
//! connection behind an async mutex, so a transaction never interleaves with
//! writes from another task. Fine for a write-light campaign workload.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contacts::model::{
    Contact, ContactFilter, ContactStatus, ContactUpdate, LogStatus, NewContact, SendLog, Stage,
    Transition,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::ContactStore;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Lock the connection for the duration of one operation.
    async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    warn!(value = s, "Unparseable timestamp in database, falling back to MIN_UTC");
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn query_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| {
        let msg = e.to_string();
        if msg.contains("UNIQUE constraint") || msg.contains("CHECK constraint") {
            DatabaseError::Constraint(format!("{op}: {msg}"))
        } else {
            DatabaseError::Query(format!("{op}: {msg}"))
        }
    }
}

const CONTACT_COLUMNS: &str = "id, name, company_name, company_url, email, industry, status, drip_step, last_sent_at, replied_at, reply_body, created_at, updated_at";

const LOG_COLUMNS: &str = "id, contact_id, stage, subject, body, status, created_at, sent_at";

/// Map a libsql Row to a Contact, validating it at the boundary.
fn row_to_contact(row: &libsql::Row) -> Result<Contact, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Serialization(format!("contact row: {e}"));

    let status_str: String = row.get(6).map_err(parse)?;
    let status: ContactStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let drip_step: i64 = row.get(7).map_err(parse)?;
    let drip_step = u32::try_from(drip_step)
        .map_err(|_| DatabaseError::Serialization(format!("invalid drip_step {drip_step}")))?;
    let last_sent_str: Option<String> = row.get(8).ok();
    let replied_str: Option<String> = row.get(9).ok();
    let created_str: String = row.get(11).map_err(parse)?;
    let updated_str: String = row.get(12).map_err(parse)?;

    let contact = Contact {
        id: row.get(0).map_err(parse)?,
        name: row.get(1).map_err(parse)?,
        company_name: row.get(2).map_err(parse)?,
        company_url: row.get(3).ok(),
        email: row.get(4).map_err(parse)?,
        industry: row.get::<String>(5).ok().filter(|s| !s.trim().is_empty()),
        status,
        drip_step,
        last_sent_at: parse_optional_datetime(&last_sent_str),
        replied_at: parse_optional_datetime(&replied_str),
        reply_body: row.get(10).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    };
    contact.validate().map_err(DatabaseError::Serialization)?;
    Ok(contact)
}

/// Map a libsql Row to a SendLog.
fn row_to_log(row: &libsql::Row) -> Result<SendLog, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Serialization(format!("log row: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let stage_str: String = row.get(2).map_err(parse)?;
    let status_str: String = row.get(5).map_err(parse)?;
    let created_str: String = row.get(6).map_err(parse)?;
    let sent_str: Option<String> = row.get(7).ok();

    Ok(SendLog {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("log id {id_str}: {e}")))?,
        contact_id: row.get(1).map_err(parse)?,
        stage: stage_str.parse().map_err(DatabaseError::Serialization)?,
        subject: row.get(3).map_err(parse)?,
        body: row.get(4).map_err(parse)?,
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str),
        sent_at: parse_optional_datetime(&sent_str),
    })
}

/// Build `col = ?N` assignments for the non-empty fields of an update.
///
/// Always bumps `updated_at`. Placeholders are numbered from 1.
fn set_clauses(fields: &ContactUpdate, now: &str) -> (Vec<String>, Vec<Value>) {
    let mut cols: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(ref industry) = fields.industry {
        cols.push("industry");
        values.push(Value::Text(industry.trim().to_string()));
    }
    if let Some(status) = fields.status {
        cols.push("status");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(step) = fields.drip_step {
        cols.push("drip_step");
        values.push(Value::Integer(i64::from(step)));
    }
    if let Some(at) = fields.last_sent_at {
        cols.push("last_sent_at");
        values.push(Value::Text(at.to_rfc3339()));
    }
    if let Some(at) = fields.replied_at {
        cols.push("replied_at");
        values.push(Value::Text(at.to_rfc3339()));
    }
    if let Some(ref body) = fields.reply_body {
        cols.push("reply_body");
        values.push(Value::Text(body.clone()));
    }
    cols.push("updated_at");
    values.push(Value::Text(now.to_string()));

    let assignments = cols
        .iter()
        .enumerate()
        .map(|(i, col)| format!("{col} = ?{}", i + 1))
        .collect();
    (assignments, values)
}

fn filter_clause(filter: ContactFilter) -> (String, Vec<Value>) {
    match filter {
        ContactFilter::All => ("1 = 1".to_string(), Vec::new()),
        ContactFilter::Status(status) => (
            "status = ?1".to_string(),
            vec![Value::Text(status.as_str().to_string())],
        ),
        ContactFilter::IndustryUnset => (
            "(industry IS NULL OR TRIM(industry) = '')".to_string(),
            Vec::new(),
        ),
        ContactFilter::NonTerminal => {
            let terminal = ContactStatus::TERMINAL
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            (format!("status NOT IN ({terminal})"), Vec::new())
        }
    }
}

async fn query_contact(conn: &Connection, id: i64) -> Result<Option<Contact>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("get"))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_contact(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get: {e}"))),
    }
}

/// Body of `apply_transition`, run between BEGIN and COMMIT.
async fn transition_statements(
    conn: &Connection,
    transition: &Transition,
    now: &str,
) -> Result<(), DatabaseError> {
    if let Some(log) = transition.log {
        let marked = conn
            .execute(
                "UPDATE email_logs SET status = 'sent', sent_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND contact_id = ?4 AND status = 'pending'",
                params![
                    log.sent_at.to_rfc3339(),
                    now,
                    log.log_id.to_string(),
                    transition.contact_id
                ],
            )
            .await
            .map_err(query_err("apply_transition log"))?;
        if marked == 0 {
            return Err(DatabaseError::Conflict(format!(
                "log {} is not a pending claim for contact {}",
                log.log_id, transition.contact_id
            )));
        }
    }

    let (assignments, mut values) = set_clauses(&transition.update, now);
    let n = values.len();
    let sql = format!(
        "UPDATE contacts SET {} WHERE id = ?{} AND status = ?{} AND drip_step = ?{}",
        assignments.join(", "),
        n + 1,
        n + 2,
        n + 3
    );
    values.push(Value::Integer(transition.contact_id));
    values.push(Value::Text(transition.expected.status.as_str().to_string()));
    values.push(Value::Integer(i64::from(transition.expected.drip_step)));

    let updated = conn
        .execute(&sql, Params::Positional(values))
        .await
        .map_err(query_err("apply_transition"))?;
    if updated == 0 {
        return Err(DatabaseError::Conflict(format!(
            "contact {} is no longer {} at drip step {}",
            transition.contact_id, transition.expected.status, transition.expected.drip_step
        )));
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ContactStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        migrations::run_migrations(&conn).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn insert_contact(&self, contact: &NewContact) -> Result<i64, DatabaseError> {
        contact.validate().map_err(DatabaseError::Constraint)?;

        let now = Utc::now().to_rfc3339();
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "INSERT INTO contacts (name, company_name, company_url, email, status, drip_step, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
                 RETURNING id",
                params![
                    contact.name.trim(),
                    contact.company_name.trim(),
                    opt_text(contact.company_url.as_deref().map(str::trim)),
                    contact.email.trim(),
                    now,
                ],
            )
            .await
            .map_err(query_err("insert_contact"))?;

        let row = rows
            .next()
            .await
            .map_err(query_err("insert_contact"))?
            .ok_or_else(|| DatabaseError::Query("insert_contact: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("insert_contact id: {e}")))?;

        debug!(contact_id = id, email = %contact.email, "Contact inserted into DB");
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<Option<Contact>, DatabaseError> {
        let conn = self.conn().await;
        query_contact(&conn, id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Contact>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1 COLLATE NOCASE"),
                params![email.trim()],
            )
            .await
            .map_err(query_err("find_by_email"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_contact(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_by_email: {e}"))),
        }
    }

    async fn fetch(&self, filter: ContactFilter) -> Result<Vec<Contact>, DatabaseError> {
        let (clause, values) = filter_clause(filter);
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE {clause} ORDER BY id ASC"),
                Params::Positional(values),
            )
            .await
            .map_err(query_err("fetch"))?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("fetch"))? {
            match row_to_contact(&row) {
                Ok(contact) => contacts.push(contact),
                Err(e) => {
                    warn!("Skipping contact row: {e}");
                }
            }
        }
        Ok(contacts)
    }

    async fn update(&self, contact_id: i64, fields: &ContactUpdate) -> Result<(), DatabaseError> {
        if fields.is_empty() {
            return Err(DatabaseError::Constraint(format!(
                "empty update for contact {contact_id}"
            )));
        }
        let now = Utc::now().to_rfc3339();
        let (assignments, mut values) = set_clauses(fields, &now);
        let sql = format!(
            "UPDATE contacts SET {} WHERE id = ?{}",
            assignments.join(", "),
            values.len() + 1
        );
        values.push(Value::Integer(contact_id));

        let conn = self.conn().await;
        let updated = conn
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(query_err("update"))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact_id.to_string(),
            });
        }
        debug!(contact_id, "Contact updated in DB");
        Ok(())
    }

    async fn apply_transition(&self, transition: &Transition) -> Result<Contact, DatabaseError> {
        transition
            .check_monotonic()
            .map_err(DatabaseError::Constraint)?;

        let now = Utc::now().to_rfc3339();
        let conn = self.conn().await;

        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(query_err("apply_transition begin"))?;

        if let Err(e) = transition_statements(&conn, transition, &now).await {
            if let Err(rollback) = conn.execute("ROLLBACK", ()).await {
                warn!(contact_id = transition.contact_id, "Rollback failed: {rollback}");
            }
            return Err(e);
        }

        if let Err(e) = conn.execute("COMMIT", ()).await {
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Query(format!("apply_transition commit: {e}")));
        }

        debug!(
            contact_id = transition.contact_id,
            from = %transition.expected.status,
            to = ?transition.update.status,
            "Transition committed"
        );

        query_contact(&conn, transition.contact_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "contact".into(),
                id: transition.contact_id.to_string(),
            })
    }

    // ── Send logs ───────────────────────────────────────────────────

    async fn insert_log(
        &self,
        contact_id: i64,
        stage: Stage,
        subject: &str,
        body: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let ts = timestamp.to_rfc3339();
        let conn = self.conn().await;
        let written = conn
            .execute(
                "INSERT INTO email_logs (id, contact_id, stage, subject, body, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)
                 ON CONFLICT (contact_id, stage) DO UPDATE SET
                    id = excluded.id,
                    subject = excluded.subject,
                    body = excluded.body,
                    status = 'pending',
                    created_at = excluded.created_at,
                    sent_at = NULL,
                    updated_at = excluded.updated_at
                 WHERE email_logs.status = 'failed'",
                params![id.to_string(), contact_id, stage.to_string(), subject, body, ts],
            )
            .await
            .map_err(query_err("insert_log"))?;

        if written == 0 {
            return Err(DatabaseError::Conflict(format!(
                "{stage} already claimed for contact {contact_id}"
            )));
        }
        debug!(contact_id, stage = %stage, log_id = %id, "Send claimed");
        Ok(id)
    }

    async fn get_log(
        &self,
        contact_id: i64,
        stage: Stage,
    ) -> Result<Option<SendLog>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM email_logs WHERE contact_id = ?1 AND stage = ?2"),
                params![contact_id, stage.to_string()],
            )
            .await
            .map_err(query_err("get_log"))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_log(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_log: {e}"))),
        }
    }

    async fn list_logs(&self, contact_id: i64) -> Result<Vec<SendLog>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM email_logs WHERE contact_id = ?1 ORDER BY created_at ASC"
                ),
                params![contact_id],
            )
            .await
            .map_err(query_err("list_logs"))?;

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_logs"))? {
            match row_to_log(&row) {
                Ok(log) => logs.push(log),
                Err(e) => {
                    warn!("Skipping log row: {e}");
                }
            }
        }
        Ok(logs)
    }

    async fn mark_log_failed(&self, log_id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn().await;
        let updated = conn
            .execute(
                "UPDATE email_logs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'pending'",
                params![LogStatus::Failed.as_str(), now, log_id.to_string()],
            )
            .await
            .map_err(query_err("mark_log_failed"))?;

        if updated == 0 {
            return Err(DatabaseError::Conflict(format!(
                "log {log_id} is not a pending claim"
            )));
        }
        Ok(())
    }
}
