//! Answer verification and telemetry rollups for the task-mining analytics
//! assistant.
//!
//! Generated answers are checked by extracting their numeric claims,
//! recomputing each one from the event data and comparing within tolerance.
//! Every request leaves a trace record; traces roll up into daily KPI panels.

pub mod claims;
pub mod columns;
pub mod error;
pub mod metrics;
pub mod recompute;
pub mod rollup;
pub mod routing;
pub mod schema;
pub mod stats;
pub mod table;
pub mod trace;
pub mod verify;
pub mod views;
