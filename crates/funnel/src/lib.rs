//! Funnel scheduling: staged drip campaigns triggered by audience-group
//! entry, with per-campaign re-entry policies and a periodic dispatch sweep.

pub mod audience;
pub mod engine;
pub mod scheduler;
pub mod selector;
pub mod state_machine;
pub mod store;
pub mod time;
pub mod tracker;
pub mod types;

pub use engine::{BulkRow, BulkRowResult, FunnelEngine};
pub use scheduler::{Scheduler, SweepReport};
pub use selector::{DuePair, DueSetSelector};
pub use time::TimeCalculator;
pub use tracker::EnrollmentTracker;
