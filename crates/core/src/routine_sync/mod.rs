//! Routine sync channel: pure state transitions and the client service.

mod service;
pub mod state;

pub use service::RoutineSyncService;
pub use state::{
    auto_propagation_candidate, effective_channel, new_sync_id, plan_auto_propagation,
    plan_break_sync, plan_disable_sync, plan_enable_sync, plan_set_mode, plan_sync_now,
    stamp_routine_edit, SyncChannel,
};
