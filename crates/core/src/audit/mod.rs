//! Reconciliation auditor over the whole profile collection.

mod audit_model;
mod auditor;

pub use audit_model::*;
pub use auditor::{audit_dataset, audit_profile, Dataset, ReconciliationAuditor};
