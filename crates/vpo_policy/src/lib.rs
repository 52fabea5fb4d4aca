//! Policy evaluation and planning.
//!
//! A policy is a versioned, phased document describing how a media library
//! should look. This crate owns its in-memory form (`types`), structural
//! validation (`validation`), the pure condition algebra (`conditions`),
//! track filtering with fallbacks (`filtering`), audio synthesis planning
//! (`synthesis`), video transcode analysis (`video`), conditional actions
//! (`actions`), and the per-phase planner (`planner`) that reduces all of it
//! to an ordered list of concrete operations.
//!
//! Everything here is pure: no I/O, no clocks, no database. The workflow
//! crate feeds in tracks and sidecar metadata and executes what comes out.

pub mod actions;
pub mod codecs;
pub mod conditions;
pub mod error;
pub mod filtering;
pub mod planner;
pub mod synthesis;
pub mod types;
pub mod validation;
pub mod video;

pub use error::PolicyError;
pub use planner::{plan_phase, PhaseGate, Plan, PlannedOperation};
pub use types::{Condition, ConditionalAction, Phase, PolicyDocument};
