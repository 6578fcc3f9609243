//! Per-target batch planning.
//!
//! A [`BatchPlanner`] first bootstraps its target (defense to minimum, value
//! to maximum) and then, once per tick, schedules a cycle of four overlapping
//! job batches timed to complete in the order Extract, Suppress, Replenish,
//! Suppress.

pub mod formulas;
pub mod statemachine;

pub use statemachine::{BatchPlanner, CyclePlan, PlannerState, Step};
