//! Drives the controller across all open contacts.
//!
//! One tick fetches every non-terminal contact and advances each once, with
//! bounded parallelism. The day-long wait between stages is the tick
//! interval; nothing inside a tick sleeps. Shutdown is only observed between
//! ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::campaign::controller::{AdvanceOutcome, CampaignController, SkipReason};
use crate::contacts::model::{Contact, ContactFilter};
use crate::error::{CampaignError, DatabaseError};

/// Shortest wait between ticks; a zero interval would make the ticker panic.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Counts for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub contacts: usize,
    pub enriched: usize,
    pub sent: usize,
    pub replied: usize,
    pub exhausted: usize,
    pub reconciled: usize,
    /// Stale copies and terminal contacts.
    pub no_op: usize,
    /// Sends deferred behind an in-flight or released claim.
    pub skipped: usize,
    pub failed: usize,
    /// Failures where mail went out but the store did not record it.
    pub reconciliation_required: usize,
}

impl TickSummary {
    fn record(&mut self, result: &Result<AdvanceOutcome, CampaignError>) {
        match result {
            Ok(AdvanceOutcome::Enriched { .. }) => self.enriched += 1,
            Ok(AdvanceOutcome::Sent { .. }) => self.sent += 1,
            Ok(AdvanceOutcome::Replied { .. }) => self.replied += 1,
            Ok(AdvanceOutcome::Exhausted) => self.exhausted += 1,
            Ok(AdvanceOutcome::Reconciled { .. }) => self.reconciled += 1,
            Ok(AdvanceOutcome::Skipped(SkipReason::Stale)) | Ok(AdvanceOutcome::Terminal) => {
                self.no_op += 1
            }
            Ok(AdvanceOutcome::Skipped(_)) => self.skipped += 1,
            Err(e) => {
                self.failed += 1;
                if e.requires_reconciliation() {
                    self.reconciliation_required += 1;
                }
            }
        }
    }
}

/// Handle for stopping a spawned scheduler between ticks.
#[derive(Debug, Clone)]
pub struct SchedulerShutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl SchedulerShutdown {
    /// Ask the loop to stop after the current tick.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct CampaignScheduler {
    controller: Arc<CampaignController>,
    max_concurrent: usize,
    /// Per-contact locks; two advances for one contact never overlap.
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl CampaignScheduler {
    pub fn new(controller: Arc<CampaignController>, max_concurrent: usize) -> Self {
        Self {
            controller,
            max_concurrent: max_concurrent.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run one tick over every non-terminal contact.
    ///
    /// Per-contact failures are logged and counted, never propagated. Only a
    /// failure to list contacts fails the tick.
    pub async fn run_tick(&self) -> Result<TickSummary, DatabaseError> {
        let contacts = self
            .controller
            .store()
            .fetch(ContactFilter::NonTerminal)
            .await?;

        let mut summary = TickSummary {
            contacts: contacts.len(),
            ..TickSummary::default()
        };
        if contacts.is_empty() {
            debug!("No open contacts this tick");
            return Ok(summary);
        }

        let results = Mutex::new(Vec::with_capacity(contacts.len()));
        futures::stream::iter(contacts)
            .for_each_concurrent(self.max_concurrent, |contact| {
                let results = &results;
                async move {
                    let result = self.advance_locked(&contact).await;
                    results.lock().await.push(result);
                }
            })
            .await;

        for result in results.into_inner().iter() {
            summary.record(result);
        }
        self.prune_locks().await;

        info!(
            contacts = summary.contacts,
            enriched = summary.enriched,
            sent = summary.sent,
            replied = summary.replied,
            exhausted = summary.exhausted,
            reconciled = summary.reconciled,
            no_op = summary.no_op,
            skipped = summary.skipped,
            failed = summary.failed,
            "Campaign tick complete"
        );
        if summary.reconciliation_required > 0 {
            error!(
                count = summary.reconciliation_required,
                "Sends not recorded this tick; they will be reconciled next tick"
            );
        }
        Ok(summary)
    }

    /// Tick every `interval` until `shutdown` flips to true.
    ///
    /// The first tick runs immediately. A stop request interrupts the wait,
    /// never a tick in progress. If every sender is dropped without asking to
    /// stop, the loop keeps ticking until the task is aborted.
    pub async fn run_forever(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let interval = interval.max(MIN_TICK_INTERVAL);
        info!(interval_secs = interval.as_secs(), "Campaign scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut listening = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed(), if listening => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => break,
                        Ok(()) => {}
                        Err(_) => {
                            debug!("Shutdown handle dropped; scheduler runs until aborted");
                            listening = false;
                        }
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_tick().await {
                warn!(error = %e, "Campaign tick failed to list contacts");
            }
        }
        info!("Campaign scheduler stopped");
    }

    async fn advance_locked(&self, contact: &Contact) -> Result<AdvanceOutcome, CampaignError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(contact.id).or_default().clone()
        };
        let _guard = lock.lock().await;

        let result = self.controller.advance(contact).await;
        if let Err(ref e) = result {
            if e.requires_reconciliation() {
                error!(contact_id = e.contact_id(), error = %e, "Contact needs reconciliation");
            } else {
                warn!(
                    contact_id = e.contact_id(),
                    error = %e,
                    "Contact advance failed; retrying next tick"
                );
            }
        }
        result
    }

    /// Drop locks nobody else holds.
    async fn prune_locks(&self) {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

/// Spawn the scheduler loop on the runtime.
///
/// Only [`SchedulerShutdown::shutdown`] stops the loop. Dropping every
/// shutdown handle leaves it running; abort the returned `JoinHandle` instead.
pub fn spawn_campaign_scheduler(
    scheduler: Arc<CampaignScheduler>,
    interval: Duration,
) -> (JoinHandle<()>, SchedulerShutdown) {
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        scheduler.run_forever(interval, rx).await;
    });
    (handle, SchedulerShutdown { tx: Arc::new(tx) })
}
