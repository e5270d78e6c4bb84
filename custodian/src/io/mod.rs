//! Side-effecting operations: filesystem, subprocesses, git.

pub mod apply;
pub mod capability;
pub mod config;
pub mod git;
pub mod planner;
pub mod policy;
pub mod process;
pub mod run_state;
pub mod verify;
