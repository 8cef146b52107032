//! Contact records and campaign lifecycle types.

pub mod import;
pub mod model;

pub use import::{ImportSummary, import_contacts};
pub use model::{
    Contact, ContactFilter, ContactStatus, ContactUpdate, LogStatus, NewContact, SendLog, Stage,
    StateGuard, Transition,
};
