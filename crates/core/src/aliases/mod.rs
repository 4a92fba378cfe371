//! Alias index (`userAliases/{alias}`), kept alongside the profile alias.

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Error, ErrorCode, Result};
use crate::profiles::{profile_path, require_profile, validate_user_id};
use crate::store::{DocPath, DocumentPatch, DocumentStore, TxDecision, TxOutcome, WriteBatch};
use crate::time_utils::now_rfc3339;

pub const USER_ALIASES_COLLECTION: &str = "userAliases";
pub const MIN_ALIAS_LEN: usize = 3;
pub const MAX_ALIAS_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasEntry {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub created_at: String,
}

/// Lowercases and validates an alias: 3 to 24 chars of `[a-z0-9_]`.
pub fn normalize_alias(alias: &str) -> Result<String> {
    let alias = alias.trim().to_lowercase();
    let valid_chars = alias
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    let len = alias.chars().count();
    if !valid_chars || !(MIN_ALIAS_LEN..=MAX_ALIAS_LEN).contains(&len) {
        return Err(Error::code(
            ErrorCode::InvalidAlias,
            format!(
                "alias must be {}-{} characters of a-z, 0-9 or _",
                MIN_ALIAS_LEN, MAX_ALIAS_LEN
            ),
        ));
    }
    Ok(alias)
}

fn alias_path(alias: &str) -> Result<DocPath> {
    Ok(DocPath::doc(USER_ALIASES_COLLECTION, alias)?)
}

/// Claims `alias` for `user_id` and moves the profile over to it.
/// Returns the normalized alias.
pub async fn claim_alias(
    store: &dyn DocumentStore,
    user_id: &str,
    alias: &str,
    display_name: &str,
) -> Result<String> {
    let user_id = validate_user_id(user_id, ErrorCode::InvalidUserId)?.to_string();
    let alias = normalize_alias(alias)?;
    let profile = require_profile(store, &user_id).await?;

    let entry = serde_json::to_value(AliasEntry {
        user_id: user_id.clone(),
        display_name: display_name.trim().to_string(),
        created_at: now_rfc3339(),
    })?;
    let owner = user_id.clone();
    let outcome = store
        .transact(
            &alias_path(&alias)?,
            Box::new(move |current: Option<&Value>| {
                match current
                    .and_then(|doc| doc.get("userId"))
                    .and_then(Value::as_str)
                {
                    Some(existing) if existing != owner => {
                        TxDecision::Abort(format!("owned by {}", existing))
                    }
                    Some(_) => TxDecision::Abort("already owned".to_string()),
                    None => TxDecision::Set(entry),
                }
            }),
        )
        .await?;

    match outcome {
        TxOutcome::Committed => {}
        TxOutcome::Aborted(reason) if reason == "already owned" => {}
        TxOutcome::Aborted(_) => {
            return Err(Error::code(
                ErrorCode::AliasTaken,
                format!("alias '{}' is taken", alias),
            ))
        }
    }

    let mut batch = WriteBatch::new();
    batch.update(
        profile_path(&user_id)?,
        DocumentPatch::new()
            .with("alias", alias.clone())
            .with("updatedAt", now_rfc3339()),
    );
    if let Some(previous) = profile.alias.as_deref().map(str::trim) {
        if !previous.is_empty() && previous != alias {
            if let Ok(path) = alias_path(previous) {
                batch.delete(path);
            }
        }
    }
    store.commit(batch).await?;
    info!("User {} claimed alias {}", user_id, alias);
    Ok(alias)
}

/// Looks up who owns `alias`.
pub async fn resolve_alias(store: &dyn DocumentStore, alias: &str) -> Result<Option<AliasEntry>> {
    let alias = normalize_alias(alias)?;
    match store.get(&alias_path(&alias)?).await? {
        Some(doc) => Ok(Some(doc.decode()?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{create_profile, Profile};
    use crate::store::InMemoryDocumentStore;

    #[test]
    fn alias_rules() {
        assert_eq!(normalize_alias(" Gym_Rat9 ").unwrap(), "gym_rat9");
        let too_long = "x".repeat(25);
        for bad in ["ab", "has space", "dash-ed", too_long.as_str()] {
            assert!(normalize_alias(bad).unwrap_err().is_code(ErrorCode::InvalidAlias));
        }
    }

    #[tokio::test]
    async fn claim_moves_alias_and_rejects_others() {
        let store = InMemoryDocumentStore::new();
        create_profile(&store, &Profile::new("u1", "Uma")).await.unwrap();
        create_profile(&store, &Profile::new("u2", "Ugo")).await.unwrap();

        assert_eq!(claim_alias(&store, "u1", "Lifter", "Uma").await.unwrap(), "lifter");
        assert_eq!(claim_alias(&store, "u1", "lifter", "Uma").await.unwrap(), "lifter");
        let err = claim_alias(&store, "u2", "lifter", "Ugo").await.unwrap_err();
        assert!(err.is_code(ErrorCode::AliasTaken));

        claim_alias(&store, "u1", "squatter", "Uma").await.unwrap();
        assert!(resolve_alias(&store, "lifter").await.unwrap().is_none());
        let entry = resolve_alias(&store, "squatter").await.unwrap().unwrap();
        assert_eq!(entry.user_id, "u1");
        assert_eq!(
            require_profile(&store, "u1").await.unwrap().alias.as_deref(),
            Some("squatter")
        );

        claim_alias(&store, "u2", "lifter", "Ugo").await.unwrap();
    }
}
