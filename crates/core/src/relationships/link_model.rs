//! Link request documents (`linkRequests/{id}`).

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::profiles::{fallback_display_name, PartnerRef};
use crate::store::Document;
use crate::time_utils::first_timestamp_ms;

pub const LINK_REQUESTS_COLLECTION: &str = "linkRequests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkRequestStatus {
    Pending,
    Accepted,
    Declined,
}

impl LinkRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRequest {
    #[serde(skip)]
    pub id: String,
    pub requester_id: String,
    pub requester_alias: String,
    pub recipient_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_alias: Option<String>,
    pub status: LinkRequestStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

impl LinkRequest {
    pub fn from_document(doc: &Document) -> Result<Self> {
        let mut request: LinkRequest = doc.decode()?;
        request.id = doc.id().to_string();
        Ok(request)
    }

    /// Acceptance instant: `resolvedAt`, else `createdAt`, else 0.
    pub fn accepted_at_ms(&self) -> i64 {
        first_timestamp_ms([self.resolved_at.as_deref(), Some(self.created_at.as_str())])
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.requester_id == user_id || self.recipient_id == user_id
    }

    /// The party that is not `user_id`.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.requester_id == user_id {
            Some(&self.recipient_id)
        } else if self.recipient_id == user_id {
            Some(&self.requester_id)
        } else {
            None
        }
    }

    /// Partner reference for `user_id`'s side, built from what the request
    /// carries. Display names default to the alias.
    pub fn partner_ref_for(&self, user_id: &str) -> Option<PartnerRef> {
        let (id, alias) = if self.requester_id == user_id {
            (
                self.recipient_id.clone(),
                self.recipient_alias.clone().unwrap_or_default(),
            )
        } else if self.recipient_id == user_id {
            (self.requester_id.clone(), self.requester_alias.clone())
        } else {
            return None;
        };
        let display_name = if alias.trim().is_empty() {
            fallback_display_name(&id)
        } else {
            alias.clone()
        };
        Some(PartnerRef {
            id,
            alias,
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocPath;
    use serde_json::json;

    fn request(resolved_at: Option<&str>, created_at: &str) -> LinkRequest {
        LinkRequest {
            id: "r1".into(),
            requester_id: "a".into(),
            requester_alias: "ann".into(),
            recipient_id: "b".into(),
            recipient_alias: None,
            status: LinkRequestStatus::Accepted,
            created_at: created_at.into(),
            resolved_at: resolved_at.map(Into::into),
        }
    }

    #[test]
    fn accepted_at_prefers_resolved_then_created() {
        assert_eq!(
            request(Some("1970-01-01T00:00:02Z"), "1970-01-01T00:00:01Z").accepted_at_ms(),
            2000
        );
        assert_eq!(request(None, "1970-01-01T00:00:01Z").accepted_at_ms(), 1000);
        assert_eq!(request(Some("bad"), "also bad").accepted_at_ms(), 0);
    }

    #[test]
    fn partner_ref_is_the_other_side() {
        let req = request(None, "x");
        assert_eq!(req.partner_ref_for("b").unwrap().id, "a");
        assert_eq!(req.partner_ref_for("b").unwrap().display_name, "ann");
        let for_requester = req.partner_ref_for("a").unwrap();
        assert_eq!(for_requester.id, "b");
        assert_eq!(for_requester.display_name, "b");
        assert!(req.partner_ref_for("c").is_none());
    }

    #[test]
    fn decodes_document_and_keeps_id() {
        let doc = Document {
            path: DocPath::parse("linkRequests/abc").unwrap(),
            data: json!({
                "requesterId": "a",
                "requesterAlias": "ann",
                "recipientId": "b",
                "status": "pending",
                "createdAt": "2026-10-14T10:00:00.000Z"
            }),
        };
        let req = LinkRequest::from_document(&doc).unwrap();
        assert_eq!(req.id, "abc");
        assert_eq!(req.status, LinkRequestStatus::Pending);
        assert!(req.recipient_alias.is_none());
    }
}
