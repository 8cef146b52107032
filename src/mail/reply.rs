//! Reply qualification policy.
//!
//! Mailbox searches are coarse (IMAP `SINCE` is date-granular), so every
//! candidate is re-checked here against the exact lower bound. This is the
//! only place that decides whether an inbound message counts as a reply.

use chrono::{DateTime, Utc};

/// An inbound message that might be a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCandidate {
    /// Sender address.
    pub from: String,
    /// Parsed `Date:` header; `None` when missing or unparseable.
    pub date: Option<DateTime<Utc>>,
    pub body: String,
}

/// A detected reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundReply {
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Decide whether `candidate` is a reply from `expected_from` strictly after `after`.
///
/// Returns the timestamp to record. A candidate without a usable date only
/// counts when there is no lower bound at all, and is then stamped `now`.
pub fn qualifies(
    candidate: &ReplyCandidate,
    expected_from: &str,
    after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !candidate.from.trim().eq_ignore_ascii_case(expected_from.trim()) {
        return None;
    }
    match (candidate.date, after) {
        (Some(date), Some(bound)) => (date > bound).then_some(date),
        (Some(date), None) => Some(date),
        (None, None) => Some(now),
        (None, Some(_)) => None,
    }
}

/// First qualifying candidate, in the order given. Existence drives the
/// transition, so one is enough.
pub fn select_reply<I>(
    candidates: I,
    expected_from: &str,
    after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<FoundReply>
where
    I: IntoIterator<Item = ReplyCandidate>,
{
    candidates.into_iter().find_map(|candidate| {
        qualifies(&candidate, expected_from, after, now).map(|received_at| FoundReply {
            received_at,
            body: candidate.body,
        })
    })
}
