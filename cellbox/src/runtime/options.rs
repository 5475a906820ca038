//! Configuration for Cellbox.

use crate::runtime::constants::{box_defaults, envs as const_envs};
use crate::runtime::layout::dirs as const_dirs;
use cellbox_shared::errors::{CellboxError, CellboxResult};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Runtime Options
// ============================================================================

/// What a second lifecycle call on a busy box does.
///
/// Lifecycle transitions (start, stop, remove) on one box are serialized.
/// This decides how a caller that arrives while another transition is in
/// flight is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Block until the in-flight transition completes, then proceed.
    #[default]
    Wait,
    /// Fail immediately with `InvalidState`.
    FailFast,
}

/// Configuration options for CellboxRuntime.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CellboxOptions {
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,
    /// Registries used to qualify unqualified image references.
    ///
    /// - Empty list (default): docker.io is the implicit registry
    /// - Non-empty list: the first entry qualifies bare references
    /// - Fully qualified refs (e.g., `"quay.io/foo"`) bypass this list
    #[serde(default)]
    pub image_registries: Vec<String>,
    /// Grace period used when a stop requests the default timeout.
    #[serde(default = "default_grace_period", with = "duration_secs")]
    pub default_grace_period: Duration,
    #[serde(default)]
    pub contention: ContentionPolicy,
}

fn default_home_dir() -> PathBuf {
    std::env::var(const_envs::CELLBOX_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(const_dirs::CELLBOX_DIR);
            path
        })
}

fn default_grace_period() -> Duration {
    Duration::from_secs(box_defaults::GRACE_PERIOD_SECS)
}

impl Default for CellboxOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            image_registries: Vec::new(),
            default_grace_period: default_grace_period(),
            contention: ContentionPolicy::default(),
        }
    }
}

impl CellboxOptions {
    /// Options rooted at `home_dir`, everything else defaulted.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Stop Timeout
// ============================================================================

/// How long a stop waits for voluntary exit before forcing termination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopTimeout {
    /// Use the runtime's configured default grace period.
    #[default]
    Default,
    /// Wait this long, then force-terminate.
    After(Duration),
    /// Wait indefinitely; never force-terminate.
    Indefinite,
}

impl StopTimeout {
    /// Concrete grace period, or `None` for an unbounded wait.
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            StopTimeout::Default => Some(default),
            StopTimeout::After(d) => Some(d),
            StopTimeout::Indefinite => None,
        }
    }
}

impl From<i32> for StopTimeout {
    /// Seconds as used at the boundary: 0 is the default, negative is
    /// indefinite.
    fn from(secs: i32) -> Self {
        match secs {
            0 => StopTimeout::Default,
            s if s < 0 => StopTimeout::Indefinite,
            s => StopTimeout::After(Duration::from_secs(s as u64)),
        }
    }
}

impl From<Duration> for StopTimeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            StopTimeout::Default
        } else {
            StopTimeout::After(d)
        }
    }
}

// ============================================================================
// Box Options
// ============================================================================

/// Options used when constructing a box.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxOptions {
    /// Optional human-readable name, unique among registered boxes.
    pub name: Option<String>,
    pub rootfs: RootfsSpec,
    pub cpus: Option<u8>,
    pub memory_mib: Option<u32>,
    /// Environment applied to every command run in the box.
    pub env: Vec<(String, String)>,
    /// Working directory for commands, relative to the box root.
    pub working_dir: Option<String>,
}

impl BoxOptions {
    /// Options for an image with explicit resources.
    pub fn image(reference: impl Into<String>) -> Self {
        Self {
            rootfs: RootfsSpec::Image(reference.into()),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cpus(mut self, cpus: u8) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = Some(memory_mib);
        self
    }

    /// CPU count after applying defaults.
    pub fn effective_cpus(&self) -> u8 {
        self.cpus.unwrap_or(box_defaults::CPUS)
    }

    /// Memory ceiling after applying defaults.
    pub fn effective_memory_mib(&self) -> u32 {
        self.memory_mib.unwrap_or(box_defaults::MEMORY_MIB)
    }

    /// Validate option values.
    ///
    /// Runs before any image resolution or registry mutation, so a rejected
    /// request leaves nothing behind.
    pub fn sanitize(&self) -> CellboxResult<()> {
        if self.cpus == Some(0) {
            return Err(CellboxError::InvalidArgument(
                "cpus must be a positive integer".to_string(),
            ));
        }

        if self.memory_mib == Some(0) {
            return Err(CellboxError::InvalidArgument(
                "memory_mib must be a positive integer".to_string(),
            ));
        }

        if self.rootfs.reference().trim().is_empty() {
            return Err(CellboxError::InvalidArgument(
                "rootfs reference must not be empty".to_string(),
            ));
        }

        if let Some(name) = &self.name {
            validate_name(name)?;
        }

        if let Some(key) = self.env.iter().map(|(k, _)| k).find(|k| !valid_env_key(k)) {
            return Err(CellboxError::InvalidArgument(format!(
                "invalid environment variable name: {:?}",
                key
            )));
        }

        Ok(())
    }
}

fn validate_name(name: &str) -> CellboxResult<()> {
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !first_ok || !rest_ok || name.len() > box_defaults::NAME_MAX_LEN {
        return Err(CellboxError::InvalidArgument(format!(
            "invalid box name {:?}: expected 1-{} characters of [A-Za-z0-9_.-] starting with a letter or digit",
            name,
            box_defaults::NAME_MAX_LEN
        )));
    }
    Ok(())
}

fn valid_env_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0')
}

/// How to populate the box root filesystem.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootfsSpec {
    /// Resolve this registry image reference.
    Image(String),
    /// Use an already prepared rootfs at the given host path.
    RootfsPath(String),
}

impl RootfsSpec {
    /// The raw reference or path string.
    pub fn reference(&self) -> &str {
        match self {
            RootfsSpec::Image(r) | RootfsSpec::RootfsPath(r) => r,
        }
    }
}

impl Default for RootfsSpec {
    fn default() -> Self {
        Self::Image(crate::runtime::constants::images::DEFAULT.into())
    }
}
