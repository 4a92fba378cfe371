//! Profile aggregate as persisted at `users/{uid}/profile/main`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Treats an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reference to a linked partner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartnerRef {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub alias: String,
    #[serde(deserialize_with = "null_as_default")]
    pub display_name: String,
}

impl PartnerRef {
    pub fn new(
        id: impl Into<String>,
        alias: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            alias: alias.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutineSyncMode {
    #[default]
    Manual,
    Auto,
}

/// Routine sync channel state for one side of a partnership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutineSync {
    pub enabled: bool,
    pub partner_id: Option<String>,
    pub mode: RoutineSyncMode,
    pub sync_id: Option<String>,
    pub updated_at: Option<String>,
}

impl RoutineSync {
    pub fn disabled(updated_at: Option<String>) -> Self {
        Self {
            enabled: false,
            partner_id: None,
            mode: RoutineSyncMode::Manual,
            sync_id: None,
            updated_at,
        }
    }

    pub fn points_at(&self, partner_id: &str) -> bool {
        self.partner_id.as_deref() == Some(partner_id)
    }

    /// Same channel state ignoring the timestamp.
    pub fn same_state(&self, other: &RoutineSync) -> bool {
        self.enabled == other.enabled
            && self.partner_id == other.partner_id
            && self.mode == other.mode
            && self.sync_id == other.sync_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub sync_id: String,
    pub version: i64,
    pub updated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineExercise {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sets: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reps: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineDay {
    pub name: String,
    #[serde(default)]
    pub exercises: Vec<RoutineExercise>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub days: Vec<RoutineDay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_meta: Option<SyncMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Routine {
    /// Version this routine carries for `sync_id`, 0 when it belongs to another channel.
    pub fn version_for(&self, sync_id: &str) -> i64 {
        match &self.sync_meta {
            Some(meta) if meta.sync_id == sync_id => meta.version,
            _ => 0,
        }
    }

    /// Same body ignoring sync bookkeeping.
    pub fn same_content(&self, other: &Routine) -> bool {
        self.name == other.name && self.days == other.days && self.notes == other.notes
    }
}

/// Per-day tracking entry (workout status plus mood/energy log).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub display_name: String,
    pub alias: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub partners: Vec<PartnerRef>,
    #[serde(deserialize_with = "null_as_default")]
    pub partner_ids: Vec<String>,
    pub partner_id: Option<String>,
    pub active_partner_id: Option<String>,
    pub link_setup_pending_partner_id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub routine_sync: RoutineSync,
    pub routine: Option<Routine>,
    #[serde(deserialize_with = "null_as_default")]
    pub day_status: BTreeMap<String, DayStatus>,
    pub updated_at: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Profile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    /// Who this profile is linked to:
    /// `activePartnerId → partnerId → partnerIds[0] → partners[0].id`.
    pub fn linked_partner_id(&self) -> Option<&str> {
        non_empty(self.active_partner_id.as_deref())
            .or_else(|| non_empty(self.partner_id.as_deref()))
            .or_else(|| non_empty(self.partner_ids.first().map(String::as_str)))
            .or_else(|| non_empty(self.partners.first().map(|p| p.id.as_str())))
    }

    pub fn has_partner(&self, partner_id: &str) -> bool {
        self.partner_ids.iter().any(|id| id == partner_id)
            || self.partners.iter().any(|p| p.id == partner_id)
    }

    /// Only partner is `partner_id` and every mirror field agrees.
    pub fn is_exclusively_linked_to(&self, partner: &PartnerRef) -> bool {
        self.partners.len() == 1
            && self.partners[0] == *partner
            && self.partner_ids == [partner.id.clone()]
            && self.partner_id.as_deref() == Some(partner.id.as_str())
            && self.active_partner_id.as_deref() == Some(partner.id.as_str())
    }

    /// Short name used when no display name is stored.
    pub fn label(&self) -> String {
        if !self.display_name.trim().is_empty() {
            return self.display_name.trim().to_string();
        }
        fallback_display_name(&self.user_id)
    }
}

/// First 8 characters of the id.
pub fn fallback_display_name(user_id: &str) -> String {
    user_id.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn linked_partner_follows_precedence_chain() {
        let mut profile = Profile::new("a", "A");
        assert_eq!(profile.linked_partner_id(), None);

        profile.partners = vec![PartnerRef::new("p4", "", "")];
        assert_eq!(profile.linked_partner_id(), Some("p4"));
        profile.partner_ids = vec!["p3".into()];
        assert_eq!(profile.linked_partner_id(), Some("p3"));
        profile.partner_id = Some("p2".into());
        assert_eq!(profile.linked_partner_id(), Some("p2"));
        profile.active_partner_id = Some("p1".into());
        assert_eq!(profile.linked_partner_id(), Some("p1"));

        profile.active_partner_id = Some("  ".into());
        assert_eq!(profile.linked_partner_id(), Some("p2"));
    }

    #[test]
    fn routine_omits_absent_optional_fields() {
        let routine = Routine {
            name: "Push".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&routine).unwrap();
        assert_eq!(value, json!({ "name": "Push", "days": [] }));
    }

    #[test]
    fn version_is_scoped_to_sync_id() {
        let routine = Routine {
            sync_meta: Some(SyncMeta {
                sync_id: "s1".into(),
                version: 3,
                updated_by: "a".into(),
                updated_at: None,
            }),
            ..Default::default()
        };
        assert_eq!(routine.version_for("s1"), 3);
        assert_eq!(routine.version_for("s2"), 0);
    }

    #[test]
    fn fallback_name_is_id_prefix() {
        assert_eq!(fallback_display_name("abcdefghijkl"), "abcdefgh");
        assert_eq!(Profile::new("xyz", " ").label(), "xyz");
    }
}
