//! Campaign core: the per-contact controller and the scheduler that drives it.

pub mod controller;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod fakes;

pub use controller::{AdvanceOutcome, CampaignController, ControllerSettings, SkipReason};
pub use scheduler::{CampaignScheduler, SchedulerShutdown, TickSummary, spawn_campaign_scheduler};
