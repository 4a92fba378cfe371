use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::profiles::{PartnerRef, Profile, RoutineSync};

/// The relationship fields of a profile, as audited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipSnapshot {
    pub partner_ids: Vec<String>,
    pub partners: Vec<PartnerRef>,
    pub partner_id: Option<String>,
    pub active_partner_id: Option<String>,
    pub link_setup_pending_partner_id: Option<String>,
    pub routine_sync: RoutineSync,
}

impl RelationshipSnapshot {
    pub fn of(profile: &Profile) -> Self {
        Self {
            partner_ids: profile.partner_ids.clone(),
            partners: profile.partners.clone(),
            partner_id: profile.partner_id.clone(),
            active_partner_id: profile.active_partner_id.clone(),
            link_setup_pending_partner_id: profile.link_setup_pending_partner_id.clone(),
            routine_sync: profile.routine_sync.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFinding {
    pub user_id: String,
    pub issues: Vec<String>,
    pub has_changes: bool,
    /// Field writes that bring the profile to the expected state.
    pub updates: Map<String, Value>,
    pub before: RelationshipSnapshot,
    pub after: RelationshipSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub scanned_count: usize,
    pub findings: Vec<AuditFinding>,
    pub fixable_count: usize,
}

impl AuditReport {
    pub fn fixable(&self) -> impl Iterator<Item = &AuditFinding> {
        self.findings.iter().filter(|f| f.has_changes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    DryRun,
    Apply,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    pub mode: ApplyMode,
    /// Profiles that would be (or were) written.
    pub planned: usize,
    pub written: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedPointSummary {
    pub passes: usize,
    pub written: usize,
    /// `false` when the pass limit stopped the run with fixes still pending.
    pub converged: bool,
    pub last_report: AuditReport,
}
