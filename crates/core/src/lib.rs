//! Spotter core: the partner-relationship consistency engine.
//!
//! Two profile documents, each writable only by its owner, are kept in
//! agreement about partner links and routine sync through event documents
//! (link requests, relationship actions, routine requests), idempotent
//! trigger handlers and an offline reconciliation auditor.

pub mod aliases;
pub mod audit;
pub mod config;
pub mod errors;
pub mod notifications;
pub mod profiles;
pub mod relationships;
pub mod routine_requests;
pub mod routine_sync;
pub mod store;
pub mod time_utils;
pub mod triggers;

pub use config::RelationshipPolicy;
pub use errors::{Error, ErrorCategory, ErrorCode, Result};
