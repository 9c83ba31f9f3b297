use {
    serde::{Deserialize, Serialize},
    std::path::PathBuf,
};

/// How the current CPU/node query is answered.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FastPathMode {
    /// Use the vDSO routine when the CPU supports it and the symbol resolved
    #[default]
    Auto,
    /// Always trap into the kernel
    Disabled,
}

/// Startup configuration for [`crate::Numa`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumaConfig {
    /// Mount point of sysfs, read for `devices/system/{node,cpu}`
    pub sysfs_root: PathBuf,
    /// Mount point of procfs, read for `self/status`, `self/auxv`, `self/maps` and `cpuinfo`
    pub procfs_root: PathBuf,
    pub fast_path: FastPathMode,
}

impl Default for NumaConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            procfs_root: PathBuf::from("/proc"),
            fast_path: FastPathMode::Auto,
        }
    }
}

impl NumaConfig {
    pub(crate) fn node_dir(&self) -> PathBuf {
        self.sysfs_root.join("devices/system/node")
    }

    pub(crate) fn cpu_dir(&self) -> PathBuf {
        self.sysfs_root.join("devices/system/cpu")
    }

    pub(crate) fn self_status(&self) -> PathBuf {
        self.procfs_root.join("self/status")
    }

    pub(crate) fn self_auxv(&self) -> PathBuf {
        self.procfs_root.join("self/auxv")
    }

    pub(crate) fn self_maps(&self) -> PathBuf {
        self.procfs_root.join("self/maps")
    }

    pub(crate) fn cpuinfo(&self) -> PathBuf {
        self.procfs_root.join("cpuinfo")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let config = NumaConfig::default();
        assert_eq!(config.node_dir(), PathBuf::from("/sys/devices/system/node"));
        assert_eq!(config.cpu_dir(), PathBuf::from("/sys/devices/system/cpu"));
        assert_eq!(config.self_status(), PathBuf::from("/proc/self/status"));
        assert_eq!(config.self_auxv(), PathBuf::from("/proc/self/auxv"));
        assert_eq!(config.self_maps(), PathBuf::from("/proc/self/maps"));
        assert_eq!(config.cpuinfo(), PathBuf::from("/proc/cpuinfo"));
        assert_eq!(config.fast_path, FastPathMode::Auto);
    }

    #[test]
    fn test_config_from_toml() {
        let config: NumaConfig = toml::from_str(
            r#"
            sysfs_root = "/tmp/fixture/sys"
            fast_path = "Disabled"
            "#,
        )
        .unwrap();
        assert_eq!(config.sysfs_root, PathBuf::from("/tmp/fixture/sys"));
        assert_eq!(config.procfs_root, PathBuf::from("/proc"));
        assert_eq!(config.fast_path, FastPathMode::Disabled);

        let empty: NumaConfig = toml::from_str("").unwrap();
        assert_eq!(empty, NumaConfig::default());

        let round_trip: NumaConfig = toml::from_str(&toml::to_string(&config).unwrap()).unwrap();
        assert_eq!(round_trip, config);
    }
}
