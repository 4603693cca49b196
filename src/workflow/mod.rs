//! Per-file decision workflows: the correlation store that tracks where
//! each file sits in its lifecycle, and the correlator that moves files
//! through it one event at a time.

pub mod engine;
pub mod store;

pub use engine::{action_for, choices_for, Correlator, WorkflowEvent};
pub use store::{CandidateFile, CorrelationEntry, CorrelationStore, Stage, StoreError, StoreHooks};
