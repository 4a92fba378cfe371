//! Asynchronous trigger handlers over the store change feed.

mod dispatcher;

pub use dispatcher::{TriggerDispatcher, TriggerOutcome};
