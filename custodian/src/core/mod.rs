//! Pure, deterministic logic for the repair engine.
//!
//! Nothing in this module performs I/O or logging. Classification, report
//! invariants, plan validation, and prompt-context formatting are all plain
//! functions over values so they can be tested in isolation.

pub mod classifier;
pub mod failure_context;
pub mod plan;
pub mod report;
