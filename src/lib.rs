//! A drip-campaign state machine for cold email.

pub mod campaign;
pub mod config;
pub mod contacts;
pub mod content;
pub mod error;
pub mod llm;
pub mod mail;
pub mod store;
