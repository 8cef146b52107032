//! Decides and executes the next step for one contact.
//!
//! Every send follows the same protocol: generate, claim the stage in the
//! send log, send, then commit the log and the contact transition in one
//! transaction. A claim left `pending` by a crash or a failed commit is
//! reconciled on a later pass instead of being sent again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::CampaignConfig;
use crate::contacts::model::{
    Contact, ContactStatus, ContactUpdate, LogStatus, SendLog, Stage, Transition,
};
use crate::content::{ContentGenerator, EmailContent};
use crate::error::{CampaignError, DatabaseError, GenerationError, TransportError};
use crate::mail::{MailTransport, SendConfirmation};
use crate::store::ContactStore;

/// Controller settings.
#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub max_drip_step: u32,
    pub call_timeout: Duration,
    pub send_claim_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&CampaignConfig::default())
    }
}

impl From<&CampaignConfig> for ControllerSettings {
    fn from(config: &CampaignConfig) -> Self {
        Self {
            max_drip_step: config.max_drip_step,
            call_timeout: config.call_timeout,
            send_claim_timeout: config.send_claim_timeout,
        }
    }
}

/// Why `advance` did nothing this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The contact changed since it was read.
    Stale,
    /// A claim for this stage is younger than the claim timeout.
    SendInFlight(Stage),
    /// An unconfirmed claim was released; the stage is retried next tick.
    ClaimReleased(Stage),
    /// The stage is already logged as sent.
    AlreadySent(Stage),
}

/// What one `advance` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Industry classified; still pending.
    Enriched { industry: String },
    /// A drip-sequence stage was sent and committed.
    Sent { stage: Stage },
    /// A reply was recorded. The meeting request may or may not have gone out.
    Replied { meeting_request_sent: bool },
    /// Drip sequence finished without a reply.
    Exhausted,
    /// A previously unrecorded send was committed without resending.
    Reconciled { stage: Stage },
    Skipped(SkipReason),
    /// Replied or exhausted; nothing to do.
    Terminal,
}

/// Result of running the send protocol for one stage.
enum StageSend {
    Sent,
    Reconciled,
    Skipped(SkipReason),
}

/// Per-contact lifecycle controller with injected collaborators.
pub struct CampaignController {
    store: Arc<dyn ContactStore>,
    generator: Arc<dyn ContentGenerator>,
    transport: Arc<dyn MailTransport>,
    settings: ControllerSettings,
}

impl CampaignController {
    pub fn new(
        store: Arc<dyn ContactStore>,
        generator: Arc<dyn ContentGenerator>,
        transport: Arc<dyn MailTransport>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            store,
            generator,
            transport,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.store
    }

    /// Decide and execute the next action for `contact`.
    ///
    /// The contact is re-read first; if it no longer matches the given copy the
    /// call is a no-op. All writes go through compare-and-set transitions, so
    /// a concurrent or repeated call can never send the same stage twice.
    pub async fn advance(&self, contact: &Contact) -> Result<AdvanceOutcome, CampaignError> {
        if contact.status.is_terminal() {
            return Ok(AdvanceOutcome::Terminal);
        }

        let current = self
            .store
            .get(contact.id)
            .await
            .map_err(|e| store_err(contact.id, e))?;
        let Some(current) = current else {
            warn!(contact_id = contact.id, "Contact vanished before advance");
            return Ok(AdvanceOutcome::Skipped(SkipReason::Stale));
        };
        if current.state_guard() != contact.state_guard() {
            debug!(
                contact_id = contact.id,
                status = %current.status,
                drip_step = current.drip_step,
                "Stale contact copy, skipping"
            );
            return Ok(AdvanceOutcome::Skipped(SkipReason::Stale));
        }

        match current.status {
            ContactStatus::Pending if current.industry.is_none() => self.enrich(&current).await,
            ContactStatus::Pending => {
                let update = ContactUpdate::new().status(ContactStatus::Sent);
                let sent = self.send_stage(&current, Stage::Initial, update).await?;
                Ok(stage_outcome(Stage::Initial, sent))
            }
            ContactStatus::Sent | ContactStatus::AwaitingReply => self.check_reply(&current).await,
            ContactStatus::Replied | ContactStatus::Exhausted => Ok(AdvanceOutcome::Terminal),
        }
    }

    // ── States ──────────────────────────────────────────────────────

    async fn enrich(&self, contact: &Contact) -> Result<AdvanceOutcome, CampaignError> {
        let industry = self
            .timed(
                self.generator
                    .classify_industry(&contact.company_name, contact.company_url.as_deref()),
                GenerationError::Timeout,
            )
            .await
            .map_err(|source| CampaignError::Generation {
                contact_id: contact.id,
                source,
            })?;

        let transition = Transition::new(contact, ContactUpdate::new().industry(industry.clone()));
        match self.store.apply_transition(&transition).await {
            Ok(_) => {
                info!(contact_id = contact.id, industry = %industry, "Contact enriched");
                Ok(AdvanceOutcome::Enriched { industry })
            }
            Err(DatabaseError::Conflict(reason)) => {
                debug!(contact_id = contact.id, %reason, "Enrichment lost a race");
                Ok(AdvanceOutcome::Skipped(SkipReason::Stale))
            }
            Err(e) => Err(store_err(contact.id, e)),
        }
    }

    async fn check_reply(&self, contact: &Contact) -> Result<AdvanceOutcome, CampaignError> {
        let found = self
            .timed(
                self.transport.find_reply(&contact.email, contact.last_sent_at),
                TransportError::Timeout,
            )
            .await
            .map_err(|source| CampaignError::Transport {
                contact_id: contact.id,
                source,
            })?;

        // The transport applies the same bound; re-check so a replied
        // contact always has a reply strictly after its last send.
        let reply = match (found, contact.last_sent_at) {
            (Some(reply), Some(sent)) if reply.received_at <= sent => {
                warn!(
                    contact_id = contact.id,
                    received_at = %reply.received_at,
                    last_sent_at = %sent,
                    "Ignoring reply that predates the last send"
                );
                None
            }
            (found, _) => found,
        };

        if let Some(reply) = reply {
            return self.record_reply(contact, reply.received_at, reply.body).await;
        }

        if contact.drip_step >= self.settings.max_drip_step {
            let transition =
                Transition::new(contact, ContactUpdate::new().status(ContactStatus::Exhausted));
            return match self.store.apply_transition(&transition).await {
                Ok(_) => {
                    info!(
                        contact_id = contact.id,
                        drip_step = contact.drip_step,
                        "Drip sequence exhausted"
                    );
                    Ok(AdvanceOutcome::Exhausted)
                }
                Err(DatabaseError::Conflict(_)) => Ok(AdvanceOutcome::Skipped(SkipReason::Stale)),
                Err(e) => Err(store_err(contact.id, e)),
            };
        }

        let stage = Stage::for_drip_step(contact.drip_step + 1);
        let update = ContactUpdate::new().status(ContactStatus::AwaitingReply);
        let sent = self.send_stage(contact, stage, update).await?;
        Ok(stage_outcome(stage, sent))
    }

    async fn record_reply(
        &self,
        contact: &Contact,
        received_at: chrono::DateTime<Utc>,
        body: String,
    ) -> Result<AdvanceOutcome, CampaignError> {
        let transition = Transition::new(
            contact,
            ContactUpdate::new()
                .status(ContactStatus::Replied)
                .reply(received_at, body),
        );
        let replied = match self.store.apply_transition(&transition).await {
            Ok(replied) => replied,
            Err(DatabaseError::Conflict(_)) => {
                return Ok(AdvanceOutcome::Skipped(SkipReason::Stale));
            }
            Err(e) => return Err(store_err(contact.id, e)),
        };
        info!(
            contact_id = contact.id,
            drip_step = contact.drip_step,
            replied_at = %received_at,
            "Reply detected"
        );

        // Replied is final. A failed meeting request is logged, never reverted.
        let meeting_request_sent = match self
            .send_stage(&replied, Stage::MeetingRequest, ContactUpdate::new())
            .await
        {
            Ok(StageSend::Sent) | Ok(StageSend::Reconciled) => true,
            Ok(StageSend::Skipped(reason)) => {
                warn!(contact_id = contact.id, ?reason, "Meeting request not sent");
                false
            }
            Err(e) => {
                error!(
                    contact_id = contact.id,
                    error = %e,
                    "Meeting request failed; contact stays replied"
                );
                false
            }
        };

        Ok(AdvanceOutcome::Replied {
            meeting_request_sent,
        })
    }

    // ── Send protocol ───────────────────────────────────────────────

    /// Send `stage` to `contact` and commit `update` with it.
    ///
    /// Drip stages also advance `drip_step` to the stage's position.
    async fn send_stage(
        &self,
        contact: &Contact,
        stage: Stage,
        mut update: ContactUpdate,
    ) -> Result<StageSend, CampaignError> {
        if let Some(step) = stage.drip_step() {
            update = update.drip_step(step);
        }
        let existing = self
            .store
            .get_log(contact.id, stage)
            .await
            .map_err(|e| store_err(contact.id, e))?;

        match existing {
            Some(log) if log.status == LogStatus::Pending => {
                return self.reconcile(contact, log, update).await;
            }
            Some(log) if log.status == LogStatus::Sent => {
                warn!(
                    contact_id = contact.id,
                    stage = %stage,
                    "Stage already logged as sent; not resending"
                );
                return Ok(StageSend::Skipped(SkipReason::AlreadySent(stage)));
            }
            _ => {}
        }

        let content: EmailContent = self
            .timed(self.generator.generate(contact, stage), GenerationError::Timeout)
            .await
            .map_err(|source| CampaignError::Generation {
                contact_id: contact.id,
                source,
            })?;

        let log_id = match self
            .store
            .insert_log(contact.id, stage, &content.subject, &content.body, Utc::now())
            .await
        {
            Ok(id) => id,
            Err(DatabaseError::Conflict(reason)) => {
                debug!(contact_id = contact.id, stage = %stage, %reason, "Stage already claimed");
                return Ok(StageSend::Skipped(SkipReason::Stale));
            }
            Err(e) => return Err(store_err(contact.id, e)),
        };

        let send = self
            .timed(
                self.transport
                    .send(&contact.email, &content.subject, &content.body),
                TransportError::Timeout,
            )
            .await;
        if let Err(source) = send {
            // A timed-out send may still have gone out; leave it for reconciliation.
            if !matches!(source, TransportError::Timeout(_)) {
                if let Err(e) = self.store.mark_log_failed(log_id).await {
                    warn!(contact_id = contact.id, stage = %stage, "Could not release claim: {e}");
                }
            }
            warn!(contact_id = contact.id, stage = %stage, error = %source, "Send failed");
            return Err(CampaignError::Transport {
                contact_id: contact.id,
                source,
            });
        }

        let sent_at = Utc::now();
        let transition =
            Transition::new(contact, update.last_sent_at(sent_at)).with_log(log_id, sent_at);
        match self.store.apply_transition(&transition).await {
            Ok(committed) => {
                info!(
                    contact_id = contact.id,
                    stage = %stage,
                    status = %committed.status,
                    drip_step = committed.drip_step,
                    "Stage sent"
                );
                Ok(StageSend::Sent)
            }
            Err(source) => {
                error!(
                    contact_id = contact.id,
                    stage = %stage,
                    log_id = %log_id,
                    error = %source,
                    "Sent but not recorded; reconciliation required"
                );
                Err(CampaignError::Persistence {
                    contact_id: contact.id,
                    stage,
                    source,
                })
            }
        }
    }

    /// Resolve a claim that was never committed.
    async fn reconcile(
        &self,
        contact: &Contact,
        log: SendLog,
        update: ContactUpdate,
    ) -> Result<StageSend, CampaignError> {
        let age = (Utc::now() - log.created_at).to_std().unwrap_or_default();
        if age < self.settings.send_claim_timeout {
            debug!(contact_id = contact.id, stage = %log.stage, "Send in flight, skipping");
            return Ok(StageSend::Skipped(SkipReason::SendInFlight(log.stage)));
        }

        let confirmation = self
            .timed(
                self.transport
                    .confirm_sent(&contact.email, &log.subject, log.created_at),
                TransportError::Timeout,
            )
            .await
            .map_err(|source| CampaignError::Transport {
                contact_id: contact.id,
                source,
            })?;

        let sent_at = match confirmation {
            SendConfirmation::Delivered(at) => at,
            SendConfirmation::Unknown => {
                warn!(
                    contact_id = contact.id,
                    stage = %log.stage,
                    "Unconfirmed send; recording it as sent at claim time"
                );
                log.created_at
            }
            SendConfirmation::NotFound => {
                self.store
                    .mark_log_failed(log.id)
                    .await
                    .map_err(|e| store_err(contact.id, e))?;
                info!(
                    contact_id = contact.id,
                    stage = %log.stage,
                    "Claimed send never went out; releasing for retry"
                );
                return Ok(StageSend::Skipped(SkipReason::ClaimReleased(log.stage)));
            }
        };

        let transition =
            Transition::new(contact, update.last_sent_at(sent_at)).with_log(log.id, sent_at);
        match self.store.apply_transition(&transition).await {
            Ok(committed) => {
                info!(
                    contact_id = contact.id,
                    stage = %log.stage,
                    status = %committed.status,
                    drip_step = committed.drip_step,
                    "Reconciled unrecorded send"
                );
                Ok(StageSend::Reconciled)
            }
            Err(DatabaseError::Conflict(_)) => Ok(StageSend::Skipped(SkipReason::Stale)),
            Err(source) => Err(CampaignError::Persistence {
                contact_id: contact.id,
                stage: log.stage,
                source,
            }),
        }
    }

    /// Bound a collaborator call by the configured timeout.
    async fn timed<T, E, F>(&self, call: F, on_timeout: fn(Duration) -> E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(self.settings.call_timeout)),
        }
    }
}

fn store_err(contact_id: i64, source: DatabaseError) -> CampaignError {
    CampaignError::Store { contact_id, source }
}

fn stage_outcome(stage: Stage, sent: StageSend) -> AdvanceOutcome {
    match sent {
        StageSend::Sent => AdvanceOutcome::Sent { stage },
        StageSend::Reconciled => AdvanceOutcome::Reconciled { stage },
        StageSend::Skipped(reason) => AdvanceOutcome::Skipped(reason),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::campaign::fakes::{FakeGenerator, FakeTransport, FlakyStore};
    use crate::contacts::model::NewContact;
    use crate::mail::FoundReply;
    use crate::store::LibSqlBackend;

    struct Harness {
        store: Arc<FlakyStore>,
        generator: Arc<FakeGenerator>,
        transport: Arc<FakeTransport>,
        controller: CampaignController,
    }

    async fn harness_with(settings: ControllerSettings) -> Harness {
        let store = Arc::new(FlakyStore::new(LibSqlBackend::new_memory().await.unwrap()));
        let generator = Arc::new(FakeGenerator::new());
        let transport = Arc::new(FakeTransport::new());
        let controller = CampaignController::new(
            store.clone(),
            generator.clone(),
            transport.clone(),
            settings,
        );
        Harness {
            store,
            generator,
            transport,
            controller,
        }
    }

    async fn harness() -> Harness {
        harness_with(ControllerSettings::default()).await
    }

    impl Harness {
        async fn seed(&self) -> Contact {
            let id = self
                .store
                .insert_contact(
                    &NewContact::new("Ada", "Analytical Engines", "ada@engines.example")
                        .with_company_url("https://engines.example"),
                )
                .await
                .unwrap();
            self.reload(id).await
        }

        async fn seed_in(&self, status: ContactStatus, step: u32) -> Contact {
            let contact = self.seed().await;
            let mut update = ContactUpdate::new()
                .industry("Computing")
                .status(status)
                .drip_step(step);
            if status != ContactStatus::Pending {
                update = update.last_sent_at(Utc::now() - ChronoDuration::days(1));
            }
            self.store.update(contact.id, &update).await.unwrap();
            self.reload(contact.id).await
        }

        async fn reload(&self, id: i64) -> Contact {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    // ── Scenarios ───────────────────────────────────────────────────

    #[tokio::test]
    async fn pending_contact_is_enriched_then_sent_initial() {
        let h = harness().await;
        let contact = h.seed().await;

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Enriched {
                industry: "Computing".to_string()
            }
        );
        let contact = h.reload(contact.id).await;
        assert_eq!(contact.industry.as_deref(), Some("Computing"));
        assert_eq!(contact.status, ContactStatus::Pending);
        assert_eq!(h.transport.sent_count(), 0);

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Initial });
        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::Sent);
        assert_eq!(contact.drip_step, 0);
        assert!(contact.last_sent_at.is_some());
        assert_eq!(h.transport.sent_count(), 1);

        let log = h.store.get_log(contact.id, Stage::Initial).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Sent);
        assert_eq!(log.subject, "initial for Ada");
    }

    #[tokio::test]
    async fn no_reply_sends_next_drip() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;
        let before = contact.last_sent_at.unwrap();

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Drip(1) });

        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::AwaitingReply);
        assert_eq!(contact.drip_step, 1);
        assert!(contact.last_sent_at.unwrap() > before);

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@engines.example");
        assert_eq!(sent[0].subject, "drip1 for Ada");
        assert_eq!(sent[0].body, "Hello Ada");

        // The reply search was bounded by the previous send.
        assert_eq!(h.transport.searches(), vec![Some(before)]);
    }

    #[tokio::test]
    async fn max_step_without_reply_exhausts_without_sending() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::AwaitingReply, 3).await;

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Exhausted);
        assert_eq!(h.reload(contact.id).await.status, ContactStatus::Exhausted);
        assert_eq!(h.transport.sent_count(), 0);
        assert_eq!(h.generator.generate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reply_marks_replied_and_sends_meeting_request() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;
        let reply_at = contact.last_sent_at.unwrap() + ChronoDuration::hours(1);
        h.transport.set_reply(Some(FoundReply {
            received_at: reply_at,
            body: "Tell me more".to_string(),
        }));

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Replied {
                meeting_request_sent: true
            }
        );

        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::Replied);
        assert_eq!(contact.replied_at, Some(reply_at));
        assert_eq!(contact.reply_body.as_deref(), Some("Tell me more"));

        let sent = h.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "meeting_request for Ada");
        let log = h
            .store
            .get_log(contact.id, Stage::MeetingRequest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, LogStatus::Sent);
    }

    #[tokio::test]
    async fn terminal_contacts_are_untouched() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Exhausted, 3).await;
        assert_eq!(
            h.controller.advance(&contact).await.unwrap(),
            AdvanceOutcome::Terminal
        );
        assert!(h.transport.searches().is_empty());
    }

    // ── Idempotence and races ───────────────────────────────────────

    #[tokio::test]
    async fn repeated_advance_on_same_copy_is_a_no_op() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;

        let first = h.controller.advance(&contact).await.unwrap();
        assert_eq!(first, AdvanceOutcome::Sent { stage: Stage::Drip(1) });

        let second = h.controller.advance(&contact).await.unwrap();
        assert_eq!(second, AdvanceOutcome::Skipped(SkipReason::Stale));
        assert_eq!(h.transport.sent_count(), 1);

        let contact = h.reload(contact.id).await;
        assert_eq!(contact.drip_step, 1);
    }

    #[tokio::test]
    async fn uncommitted_send_is_not_repeated() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;

        h.store.fail_next_transition();
        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(err.requires_reconciliation());
        assert_eq!(h.transport.sent_count(), 1);

        // State was not advanced, but the claim blocks a second send.
        let contact = h.reload(contact.id).await;
        assert_eq!(contact.drip_step, 0);
        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Skipped(SkipReason::SendInFlight(Stage::Drip(1)))
        );
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn stale_claim_confirmed_by_transport_is_committed() {
        let h = harness_with(ControllerSettings {
            send_claim_timeout: Duration::ZERO,
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;

        h.store.fail_next_transition();
        assert!(h.controller.advance(&contact).await.is_err());
        let delivered_at = Utc::now();
        h.transport
            .set_confirmation(SendConfirmation::Delivered(delivered_at));

        let contact = h.reload(contact.id).await;
        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Reconciled { stage: Stage::Drip(1) });

        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::AwaitingReply);
        assert_eq!(contact.drip_step, 1);
        assert_eq!(contact.last_sent_at, Some(delivered_at));
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn unknown_confirmation_commits_forward_without_resending() {
        let h = harness_with(ControllerSettings {
            send_claim_timeout: Duration::ZERO,
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;

        h.store.fail_next_transition();
        assert!(h.controller.advance(&contact).await.is_err());

        let contact = h.reload(contact.id).await;
        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Reconciled { stage: Stage::Drip(1) });
        assert_eq!(h.transport.sent_count(), 1);

        let log = h.store.get_log(contact.id, Stage::Drip(1)).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Sent);
        assert_eq!(h.reload(contact.id).await.last_sent_at, Some(log.created_at));
    }

    #[tokio::test]
    async fn claim_not_found_in_sent_mail_is_released_and_resent() {
        let h = harness_with(ControllerSettings {
            send_claim_timeout: Duration::ZERO,
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;

        h.store.fail_next_transition();
        assert!(h.controller.advance(&contact).await.is_err());
        h.transport.set_confirmation(SendConfirmation::NotFound);

        let contact = h.reload(contact.id).await;
        assert_eq!(
            h.controller.advance(&contact).await.unwrap(),
            AdvanceOutcome::Skipped(SkipReason::ClaimReleased(Stage::Drip(1)))
        );

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Drip(1) });
        assert_eq!(h.transport.sent_count(), 2);
    }

    // ── Failures ────────────────────────────────────────────────────

    #[tokio::test]
    async fn classification_failure_leaves_state_unchanged() {
        let h = harness().await;
        let contact = h.seed().await;
        h.generator.fail_classify.store(true, Ordering::SeqCst);

        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(matches!(err, CampaignError::Generation { .. }));
        assert_eq!(h.reload(contact.id).await, contact);
    }

    #[tokio::test]
    async fn generation_failure_sends_nothing_and_retries() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Pending, 0).await;
        h.generator.fail_generate.store(true, Ordering::SeqCst);

        assert!(matches!(
            h.controller.advance(&contact).await.unwrap_err(),
            CampaignError::Generation { .. }
        ));
        assert_eq!(h.transport.sent_count(), 0);
        assert!(h.store.get_log(contact.id, Stage::Initial).await.unwrap().is_none());

        h.generator.fail_generate.store(false, Ordering::SeqCst);
        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Initial });
    }

    #[tokio::test]
    async fn send_failure_is_never_recorded_as_sent() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Pending, 0).await;
        h.transport.fail_sends.store(true, Ordering::SeqCst);

        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(matches!(err, CampaignError::Transport { .. }));
        let reread = h.reload(contact.id).await;
        assert_eq!(reread.status, ContactStatus::Pending);
        assert!(reread.last_sent_at.is_none());
        let log = h.store.get_log(contact.id, Stage::Initial).await.unwrap().unwrap();
        assert_eq!(log.status, LogStatus::Failed);

        h.transport.fail_sends.store(false, Ordering::SeqCst);
        let outcome = h.controller.advance(&reread).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Initial });
        assert_eq!(h.transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn reply_search_failure_leaves_state_unchanged() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::AwaitingReply, 1).await;
        h.transport.fail_search.store(true, Ordering::SeqCst);

        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(matches!(err, CampaignError::Transport { .. }));
        assert_eq!(h.reload(contact.id).await, contact);
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn meeting_request_failure_does_not_revert_reply() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::AwaitingReply, 2).await;
        h.transport.set_reply(Some(FoundReply {
            received_at: Utc::now(),
            body: "yes".to_string(),
        }));
        h.transport.fail_sends.store(true, Ordering::SeqCst);

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Replied {
                meeting_request_sent: false
            }
        );
        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::Replied);
        assert_eq!(contact.drip_step, 2);

        // Terminal from here on: no drip content to an engaged contact.
        h.transport.fail_sends.store(false, Ordering::SeqCst);
        assert_eq!(
            h.controller.advance(&contact).await.unwrap(),
            AdvanceOutcome::Terminal
        );
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn reply_not_after_last_send_is_ignored() {
        let h = harness().await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;
        h.transport.set_reply(Some(FoundReply {
            received_at: contact.last_sent_at.unwrap(),
            body: "old".to_string(),
        }));

        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Sent { stage: Stage::Drip(1) });
        assert_eq!(
            h.reload(contact.id).await.status,
            ContactStatus::AwaitingReply
        );
    }

    #[tokio::test]
    async fn slow_collaborator_times_out() {
        let h = harness_with(ControllerSettings {
            call_timeout: Duration::from_millis(20),
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Sent, 0).await;
        h.transport.search_delay_ms.store(500, Ordering::SeqCst);

        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::Transport {
                source: TransportError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn timed_out_send_keeps_its_claim() {
        let h = harness_with(ControllerSettings {
            call_timeout: Duration::from_millis(20),
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Pending, 0).await;
        h.transport.send_delay_ms.store(500, Ordering::SeqCst);

        let err = h.controller.advance(&contact).await.unwrap_err();
        assert!(matches!(
            err,
            CampaignError::Transport {
                source: TransportError::Timeout(_),
                ..
            }
        ));

        // The mail may have gone out, so the claim is neither released nor committed.
        let log = h
            .store
            .get_log(contact.id, Stage::Initial)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, LogStatus::Pending);
        let reloaded = h.reload(contact.id).await;
        assert_eq!(reloaded, contact);

        h.transport.send_delay_ms.store(0, Ordering::SeqCst);
        let outcome = h.controller.advance(&reloaded).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::Skipped(SkipReason::SendInFlight(Stage::Initial))
        );
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn timed_out_send_is_reconciled_once_the_claim_ages() {
        let h = harness_with(ControllerSettings {
            call_timeout: Duration::from_millis(20),
            send_claim_timeout: Duration::ZERO,
            ..ControllerSettings::default()
        })
        .await;
        let contact = h.seed_in(ContactStatus::Pending, 0).await;
        h.transport.send_delay_ms.store(500, Ordering::SeqCst);
        assert!(h.controller.advance(&contact).await.is_err());

        h.transport.send_delay_ms.store(0, Ordering::SeqCst);
        let contact = h.reload(contact.id).await;
        let outcome = h.controller.advance(&contact).await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Reconciled { stage: Stage::Initial });

        let contact = h.reload(contact.id).await;
        assert_eq!(contact.status, ContactStatus::Sent);
        assert_eq!(contact.drip_step, 0);
        assert!(contact.last_sent_at.is_some());
        assert_eq!(h.transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn drip_step_never_decreases_across_the_sequence() {
        let h = harness().await;
        let mut contact = h.seed().await;
        let mut steps = vec![contact.drip_step];

        for _ in 0..8 {
            h.controller.advance(&contact).await.unwrap();
            contact = h.reload(contact.id).await;
            steps.push(contact.drip_step);
        }

        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(contact.status, ContactStatus::Exhausted);
        assert_eq!(contact.drip_step, 3);
        // initial + drip1..drip3, each exactly once.
        assert_eq!(h.transport.sent_count(), 4);
        let subjects: Vec<String> = h.transport.sent().into_iter().map(|m| m.subject).collect();
        assert_eq!(
            subjects,
            vec![
                "initial for Ada",
                "drip1 for Ada",
                "drip2 for Ada",
                "drip3 for Ada"
            ]
        );
    }
}
