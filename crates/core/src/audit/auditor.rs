//! Reconciliation auditor.
//!
//! Recomputes each profile's relationship fields from the current dataset
//! alone (no event history) and proposes the writes that restore reciprocity.
//! Multi-partner drift is reported, never truncated.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use super::audit_model::{
    ApplyMode, ApplySummary, AuditFinding, AuditReport, FixedPointSummary, RelationshipSnapshot,
};
use crate::config::RelationshipPolicy;
use crate::errors::Result;
use crate::profiles::{
    all_profiles_query, normalize_profile, profile_path, user_id_from_profile_path, PartnerRef,
    Profile, RoutineSync,
};
use crate::store::{DocumentPatch, DocumentStore, PatchValue, WriteBatch};
use crate::time_utils::now_rfc3339;

/// Profiles keyed by user id, plus documents that could not be decoded.
pub struct Dataset {
    pub profiles: BTreeMap<String, Profile>,
    pub undecodable: BTreeMap<String, String>,
}

impl Dataset {
    pub fn from_profiles(profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.user_id.clone(), p))
                .collect(),
            undecodable: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.profiles.len() + self.undecodable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalized_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

fn normalized_partners(partners: &[PartnerRef]) -> Vec<PartnerRef> {
    let mut seen = HashSet::new();
    partners
        .iter()
        .filter_map(|p| {
            let id = p.id.trim();
            if id.is_empty() || !seen.insert(id.to_string()) {
                return None;
            }
            let mut partner = p.clone();
            partner.id = id.to_string();
            Some(partner)
        })
        .collect()
}

fn lists_back(candidate: &Profile, user_id: &str) -> bool {
    normalized_ids(candidate.partner_ids.iter().map(String::as_str))
        .iter()
        .any(|id| id == user_id)
        || candidate.partner_id.as_deref().map(str::trim) == Some(user_id)
}

fn keep_or_fallback(current: &Option<String>, expected: &[String]) -> Option<String> {
    match current.as_deref().map(str::trim) {
        Some(id) if expected.iter().any(|e| e == id) => Some(id.to_string()),
        _ => expected.first().cloned(),
    }
}

fn write_field(
    updates: &mut Map<String, Value>,
    issues: &mut Vec<String>,
    field: &str,
    before: Value,
    after: Value,
) {
    if before != after {
        issues.push(format!("{} changes from {} to {}", field, before, after));
        updates.insert(field.to_string(), after);
    }
}

/// Audits one profile against the dataset. `None` for a clean profile.
pub fn audit_profile(
    profile: &Profile,
    dataset: &Dataset,
    policy: &RelationshipPolicy,
    now: &str,
) -> Result<Option<AuditFinding>> {
    let user_id = profile.user_id.as_str();
    let mut issues = Vec::new();

    let stored_partners = normalized_partners(&profile.partners);
    let mut candidates = normalized_ids(profile.partner_ids.iter().map(String::as_str));
    let extra_sources = stored_partners
        .iter()
        .map(|p| ("partners[]", p.id.clone()))
        .chain(
            profile
                .partner_id
                .iter()
                .map(|id| ("partnerId", id.trim().to_string())),
        )
        .chain(
            profile
                .active_partner_id
                .iter()
                .map(|id| ("activePartnerId", id.trim().to_string())),
        );
    for (source, id) in extra_sources {
        if !id.is_empty() && !candidates.contains(&id) {
            issues.push(format!("{} references '{}' missing from partnerIds", source, id));
            candidates.push(id);
        }
    }

    let mut survivors = Vec::new();
    for candidate_id in candidates {
        if candidate_id == user_id {
            issues.push("profile lists itself as a partner".to_string());
            continue;
        }
        match dataset.profiles.get(&candidate_id) {
            None => issues.push(format!("partner '{}' has no profile", candidate_id)),
            Some(candidate) if !lists_back(candidate, user_id) => issues.push(format!(
                "partner '{}' does not list this user back",
                candidate_id
            )),
            Some(candidate) => survivors.push(candidate),
        }
    }

    if survivors.len() > policy.max_partners {
        issues.push(format!(
            "{} partners exceeds max partners ({})",
            survivors.len(),
            policy.max_partners
        ));
    }

    let expected_ids: Vec<String> = survivors.iter().map(|p| p.user_id.clone()).collect();
    let expected_partners: Vec<PartnerRef> = survivors
        .iter()
        .map(|candidate| {
            stored_partners
                .iter()
                .find(|p| p.id == candidate.user_id)
                .cloned()
                .unwrap_or_else(|| {
                    PartnerRef::new(
                        candidate.user_id.clone(),
                        candidate.alias.clone().unwrap_or_default(),
                        candidate.label(),
                    )
                })
        })
        .collect();

    let mut expected = profile.clone();
    expected.partner_ids = expected_ids.clone();
    expected.partners = expected_partners;
    expected.partner_id = keep_or_fallback(&profile.partner_id, &expected_ids);
    expected.active_partner_id = keep_or_fallback(&profile.active_partner_id, &expected_ids);
    expected.link_setup_pending_partner_id = profile
        .link_setup_pending_partner_id
        .as_deref()
        .map(str::trim)
        .filter(|id| expected_ids.iter().any(|e| e == id))
        .map(str::to_string);
    if let Some(sync_partner) = profile.routine_sync.partner_id.as_deref() {
        if !expected_ids.iter().any(|e| e == sync_partner) {
            expected.routine_sync = RoutineSync::disabled(Some(now.to_string()));
        }
    }

    let before = RelationshipSnapshot::of(profile);
    let after = RelationshipSnapshot::of(&expected);
    let mut updates = Map::new();
    write_field(
        &mut updates,
        &mut issues,
        "partnerIds",
        serde_json::to_value(&before.partner_ids)?,
        serde_json::to_value(&after.partner_ids)?,
    );
    write_field(
        &mut updates,
        &mut issues,
        "partners",
        serde_json::to_value(&before.partners)?,
        serde_json::to_value(&after.partners)?,
    );
    write_field(
        &mut updates,
        &mut issues,
        "partnerId",
        serde_json::to_value(&before.partner_id)?,
        serde_json::to_value(&after.partner_id)?,
    );
    write_field(
        &mut updates,
        &mut issues,
        "activePartnerId",
        serde_json::to_value(&before.active_partner_id)?,
        serde_json::to_value(&after.active_partner_id)?,
    );
    write_field(
        &mut updates,
        &mut issues,
        "linkSetupPendingPartnerId",
        serde_json::to_value(&before.link_setup_pending_partner_id)?,
        serde_json::to_value(&after.link_setup_pending_partner_id)?,
    );
    if !before.routine_sync.same_state(&after.routine_sync) {
        write_field(
            &mut updates,
            &mut issues,
            "routineSync",
            serde_json::to_value(&before.routine_sync)?,
            serde_json::to_value(&after.routine_sync)?,
        );
    }

    if updates.is_empty() && issues.is_empty() {
        return Ok(None);
    }
    Ok(Some(AuditFinding {
        user_id: user_id.to_string(),
        issues,
        has_changes: !updates.is_empty(),
        updates,
        before,
        after,
    }))
}

/// Audits every profile in `dataset`.
pub fn audit_dataset(
    dataset: &Dataset,
    policy: &RelationshipPolicy,
    now: &str,
) -> Result<AuditReport> {
    let mut findings = Vec::new();
    for (user_id, reason) in &dataset.undecodable {
        findings.push(AuditFinding {
            user_id: user_id.clone(),
            issues: vec![format!("profile could not be decoded: {}", reason)],
            has_changes: false,
            updates: Map::new(),
            before: RelationshipSnapshot::default(),
            after: RelationshipSnapshot::default(),
        });
    }
    for profile in dataset.profiles.values() {
        if let Some(finding) = audit_profile(profile, dataset, policy, now)? {
            findings.push(finding);
        }
    }
    findings.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    let fixable_count = findings.iter().filter(|f| f.has_changes).count();
    Ok(AuditReport {
        scanned_count: dataset.len(),
        findings,
        fixable_count,
    })
}

pub struct ReconciliationAuditor {
    store: Arc<dyn DocumentStore>,
    policy: RelationshipPolicy,
}

impl ReconciliationAuditor {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RelationshipPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn load_dataset(&self) -> Result<Dataset> {
        let docs = self.store.query(&all_profiles_query()).await?;
        let mut dataset = Dataset {
            profiles: BTreeMap::new(),
            undecodable: BTreeMap::new(),
        };
        for doc in docs {
            let Some(user_id) = user_id_from_profile_path(&doc.path) else {
                debug!("Skipping non-profile document {}", doc.path);
                continue;
            };
            match normalize_profile(user_id, &doc.data) {
                Ok(mut profile) => {
                    profile.user_id = user_id.to_string();
                    dataset.profiles.insert(user_id.to_string(), profile);
                }
                Err(err) => {
                    warn!("Profile {} could not be decoded: {}", user_id, err);
                    dataset
                        .undecodable
                        .insert(user_id.to_string(), err.to_string());
                }
            }
        }
        Ok(dataset)
    }

    pub async fn scan(&self) -> Result<AuditReport> {
        let dataset = self.load_dataset().await?;
        let report = audit_dataset(&dataset, &self.policy, &now_rfc3339())?;
        info!(
            "Audit scanned {} profile(s): {} finding(s), {} fixable",
            report.scanned_count,
            report.findings.len(),
            report.fixable_count
        );
        Ok(report)
    }

    /// Writes the proposed updates. Nothing is written in `DryRun`.
    pub async fn apply(&self, report: &AuditReport, mode: ApplyMode) -> Result<ApplySummary> {
        let fixable: Vec<&AuditFinding> = report.fixable().collect();
        let mut summary = ApplySummary {
            mode,
            planned: fixable.len(),
            written: 0,
            batches: 0,
        };
        if mode == ApplyMode::DryRun {
            info!("Dry run: {} profile(s) would be updated", summary.planned);
            return Ok(summary);
        }

        let now = now_rfc3339();
        for chunk in fixable.chunks(self.policy.effective_batch_limit()) {
            let mut batch = WriteBatch::new();
            for finding in chunk {
                let mut patch: DocumentPatch = finding
                    .updates
                    .iter()
                    .map(|(k, v)| (k.clone(), PatchValue::Set(v.clone())))
                    .collect();
                patch.set("updatedAt", now.clone());
                batch.update(profile_path(&finding.user_id)?, patch);
            }
            self.store.commit(batch).await?;
            summary.written += chunk.len();
            summary.batches += 1;
        }
        info!(
            "Audit applied {} update(s) in {} batch(es)",
            summary.written, summary.batches
        );
        Ok(summary)
    }

    /// Scans and applies until a scan finds nothing fixable or the pass limit
    /// is reached. A dry run stops after the first scan.
    pub async fn run_to_fixed_point(&self, mode: ApplyMode) -> Result<FixedPointSummary> {
        let max_passes = self.policy.audit_max_passes.max(1);
        let mut written = 0;
        let mut passes = 0;
        loop {
            let report = self.scan().await?;
            passes += 1;
            if report.fixable_count == 0 {
                return Ok(FixedPointSummary {
                    passes,
                    written,
                    converged: true,
                    last_report: report,
                });
            }
            if mode == ApplyMode::DryRun || passes >= max_passes {
                return Ok(FixedPointSummary {
                    passes,
                    written,
                    converged: false,
                    last_report: report,
                });
            }
            written += self.apply(&report, mode).await?.written;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::RoutineSyncMode;

    const NOW: &str = "2026-10-14T12:00:00.000Z";

    fn profile(id: &str, partners: &[&str]) -> Profile {
        let mut p = Profile::new(id, id.to_uppercase());
        p.partner_ids = partners.iter().map(|s| s.to_string()).collect();
        p.partners = partners
            .iter()
            .map(|s| PartnerRef::new(*s, *s, s.to_uppercase()))
            .collect();
        p.partner_id = partners.first().map(|s| s.to_string());
        p.active_partner_id = p.partner_id.clone();
        p
    }

    #[test]
    fn reciprocal_pair_is_clean() {
        let dataset = Dataset::from_profiles([profile("a", &["b"]), profile("b", &["a"])]);
        let report = audit_dataset(&dataset, &RelationshipPolicy::default(), NOW).unwrap();
        assert_eq!(report.scanned_count, 2);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn non_reciprocal_partner_is_dropped() {
        let mut a = profile("a", &["x"]);
        a.routine_sync = RoutineSync {
            enabled: true,
            partner_id: Some("x".into()),
            mode: RoutineSyncMode::Auto,
            sync_id: Some("s1".into()),
            updated_at: None,
        };
        let dataset = Dataset::from_profiles([a, profile("x", &[])]);
        let report = audit_dataset(&dataset, &RelationshipPolicy::default(), NOW).unwrap();
        assert_eq!(report.fixable_count, 1);
        let finding = &report.findings[0];
        assert_eq!(finding.user_id, "a");
        assert!(finding
            .issues
            .iter()
            .any(|i| i.contains("does not list this user back")));
        assert_eq!(finding.updates["partnerIds"], serde_json::json!([]));
        assert_eq!(finding.updates["partnerId"], Value::Null);
        assert_eq!(finding.updates["routineSync"]["enabled"], false);
        assert!(finding.after.partners.is_empty());
    }

    #[test]
    fn dirty_ids_are_normalized_and_missing_ids_recovered() {
        let mut a = profile("a", &[]);
        a.partner_ids = vec![" b ".into(), "".into(), "b".into()];
        a.partners = vec![PartnerRef::new("b", "bee", "Bee")];
        let mut b = profile("b", &[]);
        b.partner_id = Some("a".into());
        let dataset = Dataset::from_profiles([a, b]);
        let report = audit_dataset(&dataset, &RelationshipPolicy::default(), NOW).unwrap();

        let a_finding = report.findings.iter().find(|f| f.user_id == "a").unwrap();
        assert_eq!(a_finding.after.partner_ids, ["b"]);
        assert_eq!(a_finding.after.partners[0].display_name, "Bee");
        assert_eq!(a_finding.after.partner_id.as_deref(), Some("b"));

        let b_finding = report.findings.iter().find(|f| f.user_id == "b").unwrap();
        assert!(b_finding.issues.iter().any(|i| i.contains("missing from partnerIds")));
        assert_eq!(b_finding.after.partner_ids, ["a"]);
        assert_eq!(b_finding.after.partners[0].display_name, "A");
    }

    #[test]
    fn missing_profile_and_multi_partner_drift_are_reported() {
        let dataset = Dataset::from_profiles([
            profile("a", &["b", "c", "ghost"]),
            profile("b", &["a"]),
            profile("c", &["a"]),
        ]);
        let report = audit_dataset(&dataset, &RelationshipPolicy::default(), NOW).unwrap();
        let finding = report.findings.iter().find(|f| f.user_id == "a").unwrap();
        assert!(finding.issues.iter().any(|i| i.contains("has no profile")));
        assert!(finding.issues.iter().any(|i| i.contains("exceeds max partners")));
        assert_eq!(finding.after.partner_ids, ["b", "c"]);
    }

    #[test]
    fn stale_pending_marker_is_cleared_not_reassigned() {
        let mut a = profile("a", &["b"]);
        a.link_setup_pending_partner_id = Some("gone".into());
        let dataset = Dataset::from_profiles([a, profile("b", &["a"])]);
        let report = audit_dataset(&dataset, &RelationshipPolicy::default(), NOW).unwrap();
        assert_eq!(report.findings[0].after.link_setup_pending_partner_id, None);
    }
}
