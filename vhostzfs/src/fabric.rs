use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::{wait_for_entry, write_fl, BackstoreKind, BackstoreRegistry, VhostError, WaitPolicy};

/// Fixed SCSI addressing for the single exported LUN.
static LUN_CONTROL: &str = "scsi_host_id=1,scsi_channel_id=0,scsi_target_id=0,scsi_lun_id=0";

/// A backstore serial deterministically names its endpoint.
pub fn wwn_for_serial<S: AsRef<str>>(serial: S) -> String {
    format!("naa.{}", serial.as_ref())
}

/// Creates and deletes vhost-scsi fabric endpoints under the configfs vhost
/// tree. An endpoint owns one LUN, linked (not owned) to a backstore.
#[derive(Debug)]
pub struct VhostFabric {
    root: PathBuf,
    wait: WaitPolicy,
}

impl VhostFabric {
    pub fn new<P: AsRef<Path>>(target_root: P) -> Self {
        VhostFabric {
            root: target_root.as_ref().join("vhost"),
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    fn tpg_dir(&self, wwn: &str) -> PathBuf {
        self.root.join(wwn).join("tpgt_1")
    }

    fn lun_dir(&self, wwn: &str) -> PathBuf {
        self.tpg_dir(wwn).join("lun").join("lun_0")
    }

    /// Whether an endpoint is already linked to the named backstore. A
    /// backstore without a serial has no endpoint yet, which is an answer,
    /// not an error; only a failing serial lookup is propagated.
    pub fn endpoint_exists<S: AsRef<str>>(
        &self,
        registry: &BackstoreRegistry,
        target: S,
    ) -> Result<bool> {
        let target_ref = target.as_ref();
        let serial = match registry.serial(target_ref) {
            Ok(serial) => serial,
            Err(e) => {
                if matches!(
                    e.downcast_ref::<VhostError>(),
                    Some(VhostError::SerialNotFound(_))
                ) {
                    return Ok(false);
                }
                return Err(e.context(format!("checking vhost endpoint for '{}'", target_ref)));
            }
        };

        let link = self
            .lun_dir(&wwn_for_serial(serial))
            .join(registry.kind().link_name());
        Ok(link.exists())
    }

    /// Builds the endpoint for `wwn` and links its LUN to the backstore.
    /// The backstore directory must already exist. Each step aborts the
    /// call with context naming the step that failed.
    pub fn create_endpoint(
        &self,
        registry: &BackstoreRegistry,
        target: &str,
        wwn: &str,
    ) -> Result<()> {
        let fail = |step: &'static str| VhostError::EndpointCreate {
            wwn: wwn.to_string(),
            step,
        };

        let wwn_re = Regex::new(r"^naa\.[0-9a-f]+$")?;
        if !wwn_re.is_match(wwn) {
            return Err(anyhow::anyhow!("'{}' is not a naa wwn", wwn)).context(fail("wwn format"));
        }

        let backstore_dir = registry.target_dir(target);
        if !backstore_dir.exists() {
            return Err(anyhow::anyhow!(
                "backstore '{}' missing at '{}'",
                target,
                backstore_dir.display()
            ))
            .context(fail("backstore access"));
        }

        info!(wwn, backstore = target, "creating vhost endpoint");
        let tpg = self.tpg_dir(wwn);
        let lun = self.lun_dir(wwn);
        fs::create_dir_all(&lun).context(fail("mkdir lun"))?;
        write_fl(backstore_dir.join("control"), LUN_CONTROL).context(fail("control"))?;
        wait_for_entry(tpg.join("nexus"), self.wait).context(fail("wait nexus"))?;
        write_fl(tpg.join("nexus"), wwn).context(fail("nexus"))?;

        let link = lun.join(registry.kind().link_name());
        if fs::symlink_metadata(&link).is_err() {
            symlink(&backstore_dir, &link).context(fail("link lun"))?;
        }

        Ok(())
    }

    /// Removes the endpoint tree for `wwn`, children before parents. Every
    /// removal is attempted even after a failure; the failures are
    /// concatenated into one report.
    pub fn delete_endpoint<S: AsRef<str>>(&self, kind: BackstoreKind, wwn: S) -> Result<()> {
        let wwn_ref = wwn.as_ref();
        let wwn_dir = self.root.join(wwn_ref);
        let tpg = self.tpg_dir(wwn_ref);
        let lun = self.lun_dir(wwn_ref);
        if !lun.exists() {
            anyhow::bail!(VhostError::EndpointNotFound(wwn_ref.to_string()))
        }

        info!(wwn = wwn_ref, "deleting vhost endpoint");
        let mut failures = Vec::new();
        if let Err(e) = fs::remove_file(lun.join(kind.link_name())) {
            failures.push(format!("unlink {}: {}", kind.link_name(), e));
        }
        if let Err(e) = fs::remove_dir_all(&lun) {
            failures.push(format!("remove lun: {}", e));
        }
        if let Err(e) = fs::remove_dir_all(&tpg) {
            failures.push(format!("remove tpg: {}", e));
        }
        if let Err(e) = fs::remove_dir_all(&wwn_dir) {
            failures.push(format!("remove wwn: {}", e));
        }

        if !failures.is_empty() {
            anyhow::bail!(VhostError::EndpointDelete {
                wwn: wwn_ref.to_string(),
                reasons: failures.join("; "),
            })
        }

        Ok(())
    }
}
