//! Shared constants between the runtime and its front ends.

/// Execution exit-code conventions.
pub mod exit {
    /// Exit code reported when a command could not be started at all.
    ///
    /// Real exit statuses fit in 0..=255 and signal deaths are reported as
    /// the negative signal number, so this value never collides with either.
    pub const SPAWN_FAILED: i32 = i32::MIN;

    /// Exit code a front end uses when an execution ended without a status.
    pub const UNKNOWN: i32 = -1;
}

/// Stop/shutdown timeout conventions at the boundary (seconds).
pub mod timeout {
    /// Timeout value meaning "use the runtime's default grace period".
    pub const DEFAULT: i32 = 0;

    /// Timeout value meaning "wait indefinitely, never force-terminate".
    pub const INDEFINITE: i32 = -1;
}
