//! Automated repository custodian: plans a small change, verifies it with the
//! repository's own commands, repairs classified failures within strict
//! bounds, and commits only when verification passes. A durable run state and
//! an exclusive lock make unattended scheduling safe.

pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repair;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
