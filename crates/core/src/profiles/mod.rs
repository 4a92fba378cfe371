//! Profile aggregate, payload codec and profile document access.

pub mod codec;
mod profile_model;

pub use codec::{
    autosave_patch, diff_patch, normalize_profile, to_comparable_payload, to_sync_payload,
    SyncPayload,
};
pub use profile_model::*;

use log::debug;
use serde_json::Value;

use crate::errors::{Error, ErrorCode, Result};
use crate::store::{DocPath, DocumentStore, Query, SetOptions};
use crate::time_utils::now_rfc3339;

pub const USERS_COLLECTION: &str = "users";
pub const PROFILE_COLLECTION_ID: &str = "profile";
pub const PROFILE_DOC_ID: &str = "main";

pub fn validate_user_id(user_id: &str, code: ErrorCode) -> Result<&str> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(Error::code(code, format!("invalid user id '{}'", user_id)));
    }
    Ok(trimmed)
}

pub fn profile_path(user_id: &str) -> Result<DocPath> {
    let user_id = validate_user_id(user_id, ErrorCode::InvalidUserId)?;
    Ok(DocPath::parse(format!(
        "{}/{}/{}/{}",
        USERS_COLLECTION, user_id, PROFILE_COLLECTION_ID, PROFILE_DOC_ID
    ))?)
}

/// User id for a `users/{uid}/profile/main` path.
pub fn user_id_from_profile_path(path: &DocPath) -> Option<&str> {
    let segments: Vec<&str> = path.segments().collect();
    match segments.as_slice() {
        [USERS_COLLECTION, uid, PROFILE_COLLECTION_ID, PROFILE_DOC_ID] => Some(*uid),
        _ => None,
    }
}

/// Query over every profile document.
pub fn all_profiles_query() -> Query {
    Query::collection_group(PROFILE_COLLECTION_ID)
}

pub async fn load_profile(store: &dyn DocumentStore, user_id: &str) -> Result<Option<Profile>> {
    let path = profile_path(user_id)?;
    match store.get(&path).await? {
        Some(doc) => Ok(Some(normalize_profile(user_id, &doc.data)?)),
        None => Ok(None),
    }
}

/// Loads a profile or fails with `PROFILE_NOT_FOUND`.
pub async fn require_profile(store: &dyn DocumentStore, user_id: &str) -> Result<Profile> {
    load_profile(store, user_id).await?.ok_or_else(|| {
        Error::code(
            ErrorCode::ProfileNotFound,
            format!("no profile for user '{}'", user_id),
        )
    })
}

/// Creates the profile document at signup.
pub async fn create_profile(store: &dyn DocumentStore, profile: &Profile) -> Result<()> {
    let path = profile_path(&profile.user_id)?;
    let mut stored = profile.clone();
    stored.updated_at = Some(now_rfc3339());
    store
        .set(
            &path,
            Value::Object(to_sync_payload(&stored)?),
            SetOptions::overwrite(),
        )
        .await?;
    Ok(())
}

/// Persists `next` as the owner's own profile, writing only changed fields.
/// Returns whether anything was written.
pub async fn save_own_profile(
    store: &dyn DocumentStore,
    prev: &Profile,
    next: &Profile,
) -> Result<bool> {
    let Some(patch) = autosave_patch(prev, next, &now_rfc3339())? else {
        debug!("No profile changes to save for user {}", next.user_id);
        return Ok(false);
    };
    debug!(
        "Saving {} profile field(s) for user {}",
        patch.len(),
        next.user_id
    );
    store.update(&profile_path(&next.user_id)?, patch).await?;
    Ok(true)
}
