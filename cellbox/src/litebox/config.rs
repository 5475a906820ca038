//! Static box configuration.

use crate::BoxID;
use crate::images::RootfsHandle;
use crate::isolation::ResourceLimits;
use crate::runtime::options::BoxOptions;

/// Everything fixed at creation time.
///
/// Never changes after the box is registered; dynamic data lives in
/// `BoxState`.
#[derive(Clone, Debug)]
pub(crate) struct BoxConfig {
    pub(crate) id: BoxID,
    pub(crate) name: Option<String>,
    pub(crate) options: BoxOptions,
    pub(crate) rootfs: RootfsHandle,
    pub(crate) limits: ResourceLimits,
}

impl BoxConfig {
    pub(crate) fn new(options: BoxOptions, rootfs: RootfsHandle) -> Self {
        let limits = ResourceLimits {
            cpus: options.effective_cpus(),
            memory_mib: options.effective_memory_mib(),
        };
        Self {
            id: BoxID::new(),
            name: options.name.clone(),
            options,
            rootfs,
            limits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_applies_resource_defaults() {
        let config = BoxConfig::new(
            BoxOptions::image("alpine").with_name("web"),
            RootfsHandle::new("docker.io/alpine:latest", "/tmp/root"),
        );
        assert_eq!(config.name.as_deref(), Some("web"));
        assert_eq!(config.limits.cpus, 1);
        assert_eq!(config.limits.memory_mib, 512);
    }
}
