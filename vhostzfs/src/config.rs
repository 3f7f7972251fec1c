use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

fn default_target_root() -> String {
    "/sys/kernel/config/target".to_string()
}

fn default_pool() -> String {
    "tank".to_string()
}

fn default_volume() -> String {
    "test-zvol".to_string()
}

fn default_target() -> String {
    "test_iblock".to_string()
}

fn default_volume_size() -> u64 {
    60 * 1024 * 1024 * 1024
}

fn default_volume_blocksize() -> u64 {
    16 * 1024
}

/// Per-invocation provisioning parameters. Defaults match the historical
/// bench setup but every field is explicit, overridable configuration; the
/// orchestrator never substitutes values behind the caller's back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default = "default_target_root")]
    target_root: String,
    #[serde(default = "default_pool")]
    pool: String,
    #[serde(default = "default_volume")]
    volume: String,
    #[serde(default = "default_volume_size")]
    volume_size: u64,
    #[serde(default = "default_volume_blocksize")]
    volume_blocksize: u64,
    #[serde(default = "default_target")]
    target: String,
    /// Device node exported for the volume. When unset, the zvol node
    /// derived from pool and volume is used.
    #[serde(default)]
    device: Option<String>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        ProvisionConfig {
            target_root: default_target_root(),
            pool: default_pool(),
            volume: default_volume(),
            volume_size: default_volume_size(),
            volume_blocksize: default_volume_blocksize(),
            target: default_target(),
            device: None,
        }
    }
}

impl ProvisionConfig {
    /// create `ProvisionConfig` from yaml string
    pub fn from(s: &str) -> Result<ProvisionConfig> {
        let config = serde_yml::from_str::<ProvisionConfig>(s)?;
        Ok(config)
    }

    /// create `ProvisionConfig` from yaml file
    pub fn read<S: AsRef<Path>>(filename: S) -> Result<ProvisionConfig> {
        let s = fs::read_to_string(filename)?;
        ProvisionConfig::from(&s)
    }

    /// encodes `ProvisionConfig` to yaml string
    pub fn to_yml(&self) -> Result<String> {
        let s = serde_yml::to_string(self)?;
        Ok(s)
    }

    /// echo `ProvisionConfig` yaml string to the file
    pub fn write_to<S: AsRef<Path>>(&self, filename: S) -> Result<()> {
        let yml = self.to_yml()?;
        fs::write(filename, yml)?;

        Ok(())
    }

    pub fn target_root(&self) -> &str {
        &self.target_root
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn volume_name(&self) -> &str {
        &self.volume
    }

    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    pub fn volume_blocksize(&self) -> u64 {
        self.volume_blocksize
    }

    pub fn target_name(&self) -> &str {
        &self.target
    }

    /// Exported device node: the configured override, or the zvol node
    /// derived from pool and volume.
    pub fn device(&self) -> String {
        match &self.device {
            Some(dev) => dev.clone(),
            None => format!("/dev/zvol/{}/{}", self.pool, self.volume),
        }
    }

    pub fn set_target_root<S: AsRef<str>>(&mut self, root: S) {
        self.target_root = root.as_ref().to_string();
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::ProvisionConfig;

    #[test]
    fn test_config_from_yaml() -> Result<()> {
        let s = r#"
pool: bench
volume: vol0
volume_size: 1073741824
target: bench_iblock
"#;

        let config = ProvisionConfig::from(s)?;
        assert_eq!(config.pool_name(), "bench");
        assert_eq!(config.volume_name(), "vol0");
        assert_eq!(config.volume_size(), 1 << 30);
        assert_eq!(config.target_name(), "bench_iblock");
        // omitted fields fall back to defaults
        assert_eq!(config.target_root(), "/sys/kernel/config/target");
        assert_eq!(config.volume_blocksize(), 16 * 1024);
        Ok(())
    }

    #[test]
    fn device_derives_from_pool_and_volume() -> Result<()> {
        let config = ProvisionConfig::default();
        assert_eq!(config.device(), "/dev/zvol/tank/test-zvol");

        let config = ProvisionConfig::from("device: /dev/vdb")?;
        assert_eq!(config.device(), "/dev/vdb");
        Ok(())
    }

    #[test]
    fn yaml_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("provision.yml");

        let config = ProvisionConfig::default();
        config.write_to(&path)?;

        let config = ProvisionConfig::read(&path)?;
        assert_eq!(config.pool_name(), "tank");
        assert_eq!(config.volume_size(), 60 * 1024 * 1024 * 1024);
        Ok(())
    }
}
