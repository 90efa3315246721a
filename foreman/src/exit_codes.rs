//! Stable exit codes for foreman CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/state or other errors.
pub const INVALID: i32 = 1;
/// `foreman tick` found no claimable story.
pub const NOTHING_TO_DO: i32 = 2;
/// The driven job ended `blocked`.
pub const BLOCKED: i32 = 3;
