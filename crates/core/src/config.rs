//! Engine-wide relationship policy.

use serde::{Deserialize, Serialize};

use crate::store::MAX_BATCH_OPS;

pub const DEFAULT_MAX_PARTNERS: usize = 1;
pub const DEFAULT_ROUTINE_REQUEST_TTL_HOURS: i64 = 72;
pub const DEFAULT_AUDIT_BATCH_LIMIT: usize = 400;
pub const DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS: u64 = 15 * 60;
pub const DEFAULT_AUDIT_MAX_PASSES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationshipPolicy {
    pub max_partners: usize,
    pub routine_request_ttl_hours: i64,
    /// Writes per physical batch when the auditor applies fixes.
    pub audit_batch_limit: usize,
    pub expiry_sweep_interval_secs: u64,
    pub audit_max_passes: usize,
}

impl Default for RelationshipPolicy {
    fn default() -> Self {
        Self {
            max_partners: DEFAULT_MAX_PARTNERS,
            routine_request_ttl_hours: DEFAULT_ROUTINE_REQUEST_TTL_HOURS,
            audit_batch_limit: DEFAULT_AUDIT_BATCH_LIMIT,
            expiry_sweep_interval_secs: DEFAULT_EXPIRY_SWEEP_INTERVAL_SECS,
            audit_max_passes: DEFAULT_AUDIT_MAX_PASSES,
        }
    }
}

impl RelationshipPolicy {
    /// Batch size actually used, clamped to the store limit.
    pub fn effective_batch_limit(&self) -> usize {
        self.audit_batch_limit.clamp(1, MAX_BATCH_OPS)
    }

    pub fn routine_request_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.routine_request_ttl_hours.max(1))
    }
}
