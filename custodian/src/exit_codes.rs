//! Process exit codes, chosen by downcasting the run error.

use crate::core::report::CommandFailure;
use crate::io::run_state::LockHeld;

/// The run completed.
pub const OK: i32 = 0;
/// Any failure without a more specific code.
pub const FAILURE: i32 = 1;
/// Another run holds the lock.
pub const LOCK_HELD: i32 = 2;
/// Verification failed and could not be repaired.
pub const VERIFY_FAILED: i32 = 3;

pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<LockHeld>().is_some() {
        return LOCK_HELD;
    }
    if err.downcast_ref::<CommandFailure>().is_some() {
        return VERIFY_FAILED;
    }
    FAILURE
}
