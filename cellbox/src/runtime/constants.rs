//! Constants for the Cellbox runtime
//!
//! Centralized location for hardcoded values, paths, and defaults.

pub use cellbox_shared::constants::{exit, timeout};

pub mod envs {
    pub const CELLBOX_HOME: &str = "CELLBOX_HOME";
}

/// Container images used by the runtime
pub mod images {
    /// Default container image when none is specified
    pub const DEFAULT: &str = "alpine:latest";

    /// Registry used to qualify references when none is configured
    pub const DEFAULT_REGISTRY: &str = "docker.io";
}

/// Default resources for boxes that do not specify them
pub mod box_defaults {
    pub const CPUS: u8 = 1;
    pub const MEMORY_MIB: u32 = 512;

    /// Grace period applied when a stop asks for the default timeout.
    pub const GRACE_PERIOD_SECS: u64 = 10;

    /// Maximum length of a user-supplied box name.
    pub const NAME_MAX_LEN: usize = 63;
}

pub mod filenames {
    /// Prefix of the daily rolling runtime log file
    pub const LOG_FILE: &str = "cellbox.log";
}
