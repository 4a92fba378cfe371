//! Routine copy requests between partners, with TTL and exactly-once apply.

mod routine_request_model;
mod service;

pub use routine_request_model::*;
pub use service::{
    can_exchange_routines, load_routine_request, routine_request_path, ApplyOutcome,
    NewRoutineRequest, RoutineRequestService,
};
