//! Partner relationships: link requests, relationship actions, the event
//! resolver and the link/unlink protocols.

pub mod action_model;
pub mod link_model;
pub mod link_service;
pub mod partner_update;
pub mod reconcile;
pub mod resolver;
pub mod unlink_service;

pub use action_model::{
    create_action, ActionStatus, ActionType, RelationshipAction, RELATIONSHIP_ACTIONS_COLLECTION,
};
pub use link_model::{LinkRequest, LinkRequestStatus, LINK_REQUESTS_COLLECTION};
pub use link_service::{
    partner_ref_from_profile, upsert_own_partner, LinkAccepted, LinkService, SendLinkOutcome,
    SendLinkRequest,
};
pub use partner_update::{
    plan_partner_removal, plan_partner_upsert, plan_resolved_partners, UpsertPlan,
};
pub use reconcile::{reconcile_own_partners, ReconcileOutcome};
pub use resolver::{resolve_active_partners, AcceptedLinkEvent, UnlinkEvent};
pub use unlink_service::{process_unlink_action, UnlinkReceipt, UnlinkService};
