use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::info;

use crate::{read_fl, wait_for_entry, write_fl, VhostError, WaitPolicy};

/// NAA vendor prefix used by rtslib-fb for generated unit serials.
pub static NAA_PREFIX: &str = "5001405";

/// Which kernel backend a backstore binds its device to. A closed set; the
/// LUN link name and the core subdirectory both derive from it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum BackstoreKind {
    #[default]
    IBlock,
}

impl BackstoreKind {
    /// Subdirectory of `core/` holding backstores of this kind.
    pub fn core_dir(&self) -> &'static str {
        match self {
            BackstoreKind::IBlock => "iblock_0",
        }
    }

    /// Name of the LUN symlink pointing back at the backstore directory.
    pub fn link_name(&self) -> &'static str {
        match self {
            BackstoreKind::IBlock => "iblock",
        }
    }
}

/// Generates a unit serial: the fixed vendor prefix plus nine zero-padded
/// hex digits drawn from a random u32. Operationally unique, not
/// cryptographic.
pub fn generate_serial() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}{:09x}", NAA_PREFIX, suffix)
}

/// Registers block devices as named backstore entries under the configfs
/// core tree.
#[derive(Debug)]
pub struct BackstoreRegistry {
    root: PathBuf,
    kind: BackstoreKind,
    wait: WaitPolicy,
}

impl BackstoreRegistry {
    pub fn new<P: AsRef<Path>>(target_root: P) -> Self {
        BackstoreRegistry {
            root: target_root.as_ref().join("core"),
            kind: BackstoreKind::default(),
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn kind(&self) -> BackstoreKind {
        self.kind
    }

    /// Control-tree directory owned by the named backstore.
    pub fn target_dir<S: AsRef<str>>(&self, target: S) -> PathBuf {
        self.root.join(self.kind.core_dir()).join(target.as_ref())
    }

    /// Creates the backstore directory, binds the device, writes the serial
    /// and enables the entry. Each step aborts the call with context naming
    /// the step that failed.
    pub fn create<S: AsRef<str>>(&self, device: S, target: S, serial: S) -> Result<()> {
        let target_ref = target.as_ref();
        let device_ref = device.as_ref();
        let dir = self.target_dir(target_ref);
        let fail = |step: &'static str| VhostError::BackstoreCreate {
            target: target_ref.to_string(),
            step,
        };

        info!(backstore = target_ref, device = device_ref, "registering backstore");
        fs::create_dir_all(&dir).context(fail("mkdir"))?;
        // the kernel populates the directory asynchronously after mkdir
        wait_for_entry(dir.join("control"), self.wait).context(fail("wait control"))?;
        write_fl(dir.join("control"), format!("udev_path={}", device_ref))
            .context(fail("control"))?;
        write_fl(dir.join("wwn").join("vpd_unit_serial"), serial.as_ref())
            .context(fail("vpd_unit_serial"))?;
        write_fl(dir.join("enable"), "1").context(fail("enable"))?;

        Ok(())
    }

    /// Reads back the unit serial of a backstore. The kernel stores it as a
    /// human-readable line ("T10 VPD Unit Serial Number: <hex>"); only the
    /// trailing token is returned.
    pub fn serial<S: AsRef<str>>(&self, target: S) -> Result<String> {
        let target_ref = target.as_ref();
        let attr = self.target_dir(target_ref).join("wwn").join("vpd_unit_serial");
        if !attr.exists() {
            anyhow::bail!(VhostError::SerialNotFound(target_ref.to_string()))
        }

        let line = read_fl(&attr)
            .with_context(|| format!("reading serial of backstore '{}'", target_ref))?;
        match line.trim().split_whitespace().last() {
            Some(token) => Ok(token.to_string()),
            None => anyhow::bail!(VhostError::SerialEmpty(target_ref.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use regex::Regex;

    use super::*;

    fn fast_registry(root: &Path) -> BackstoreRegistry {
        BackstoreRegistry::new(root).with_wait(WaitPolicy {
            initial: Duration::from_millis(2),
            ceiling: Duration::from_millis(20),
        })
    }

    /// Pre-creates the entries the kernel would populate after mkdir.
    fn seed_backstore(registry: &BackstoreRegistry, target: &str) {
        let dir = registry.target_dir(target);
        fs::create_dir_all(dir.join("wwn")).unwrap();
        fs::write(dir.join("control"), "").unwrap();
    }

    #[test]
    fn serial_format() {
        let re = Regex::new(r"^5001405[0-9a-f]{9}$").unwrap();
        for _ in 0..100 {
            let serial = generate_serial();
            assert!(re.is_match(&serial), "bad serial '{}'", serial);
        }
    }

    #[test]
    fn serials_are_distinct() {
        let serials: HashSet<String> = (0..5000).map(|_| generate_serial()).collect();
        assert_eq!(serials.len(), 5000);
    }

    #[test]
    fn create_writes_all_attributes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = fast_registry(dir.path());
        seed_backstore(&registry, "test_iblock");

        registry.create("/dev/zvol/tank/test-zvol", "test_iblock", "5001405abc123de")?;

        let target_dir = registry.target_dir("test_iblock");
        assert_eq!(
            read_fl(target_dir.join("control"))?,
            "udev_path=/dev/zvol/tank/test-zvol"
        );
        assert_eq!(read_fl(target_dir.join("enable"))?, "1");
        assert_eq!(registry.serial("test_iblock")?, "5001405abc123de");
        Ok(())
    }

    #[test]
    fn create_fails_when_control_never_appears() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fast_registry(dir.path());

        let err = registry
            .create("/dev/sdb", "test_iblock", "5001405abc123de")
            .unwrap_err();
        match err.downcast_ref::<VhostError>() {
            Some(VhostError::BackstoreCreate { target, step }) => {
                assert_eq!(target, "test_iblock");
                assert_eq!(*step, "wait control");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn serial_takes_trailing_token() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = fast_registry(dir.path());
        seed_backstore(&registry, "test_iblock");

        let attr = registry
            .target_dir("test_iblock")
            .join("wwn")
            .join("vpd_unit_serial");
        fs::write(&attr, "  T10 VPD Unit Serial Number: 5001405043a8fbf4  \n")?;
        assert_eq!(registry.serial("test_iblock")?, "5001405043a8fbf4");
        Ok(())
    }

    #[test]
    fn missing_serial_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fast_registry(dir.path());

        let err = registry.serial("test_iblock").unwrap_err();
        match err.downcast_ref::<VhostError>() {
            Some(VhostError::SerialNotFound(target)) => assert_eq!(target, "test_iblock"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn blank_serial_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = fast_registry(dir.path());
        seed_backstore(&registry, "test_iblock");

        let attr = registry
            .target_dir("test_iblock")
            .join("wwn")
            .join("vpd_unit_serial");
        fs::write(&attr, "   \n").unwrap();

        let err = registry.serial("test_iblock").unwrap_err();
        match err.downcast_ref::<VhostError>() {
            Some(VhostError::SerialEmpty(target)) => assert_eq!(target, "test_iblock"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
