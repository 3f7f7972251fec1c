use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::{
    generate_serial, wwn_for_serial, BackstoreRegistry, PoolManager, ProvisionConfig, VhostError,
    VhostFabric, Volume, ZpoolCommand, ZpoolEngine,
};

/// Where the provisioning chain currently stands. `Failed` is terminal and
/// reachable from every step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    #[default]
    Unprovisioned,
    PoolReady,
    VolumeReady,
    BackstoreReady,
    EndpointReady,
    Failed,
}

/// Drives the full volume-to-target chain: pool, zvol, backstore, vhost
/// endpoint. Constructed per invocation; callers serialize provisioning
/// attempts for the same target, the control tree offers no locking.
pub struct Provisioner<E = ZpoolCommand> {
    config: ProvisionConfig,
    pools: PoolManager<E>,
    backstores: BackstoreRegistry,
    fabric: VhostFabric,
    state: ProvisionState,
}

impl Provisioner<ZpoolCommand> {
    pub fn new(config: ProvisionConfig) -> Self {
        let backstores = BackstoreRegistry::new(config.target_root());
        let fabric = VhostFabric::new(config.target_root());
        Provisioner {
            config,
            pools: PoolManager::new(),
            backstores,
            fabric,
            state: ProvisionState::Unprovisioned,
        }
    }
}

impl<E: ZpoolEngine> Provisioner<E> {
    pub fn with_parts(
        config: ProvisionConfig,
        pools: PoolManager<E>,
        backstores: BackstoreRegistry,
        fabric: VhostFabric,
    ) -> Self {
        Provisioner {
            config,
            pools,
            backstores,
            fabric,
            state: ProvisionState::Unprovisioned,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    fn step<T>(&mut self, res: Result<T>) -> Result<T> {
        if res.is_err() {
            self.state = ProvisionState::Failed;
        }
        res
    }

    /// Creates the backing pool on `device` and the reserved zvol inside it.
    pub fn setup_disk<S: AsRef<str>>(&mut self, device: S) -> Result<Volume> {
        let res = self.pools.create_pool(self.config.pool_name(), device.as_ref());
        self.step(res)?;
        self.state = ProvisionState::PoolReady;

        let res = self.pools.create_volume(
            self.config.pool_name(),
            self.config.volume_name(),
            self.config.volume_size(),
            self.config.volume_blocksize(),
        );
        let volume = self.step(res)?;
        self.state = ProvisionState::VolumeReady;

        info!(device = %volume.device_path().display(), "volume provisioned");
        Ok(volume)
    }

    /// Registers `device` as a backstore under `target` and exposes it as a
    /// vhost endpoint, returning the endpoint wwn. A `None` device falls
    /// back to the configured zvol node. When endpoint creation fails the
    /// partially built endpoint is deleted before the combined error is
    /// returned.
    ///
    /// ```no_run
    /// use vhostzfs::{ProvisionConfig, Provisioner};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = ProvisionConfig::default();
    /// let target = config.target_name().to_string();
    /// let mut provisioner = Provisioner::new(config);
    /// let wwn = provisioner.setup_vhost(None, &target)?;
    /// println!("{}", wwn);
    /// # Ok(())
    /// # }
    /// ```
    pub fn setup_vhost(&mut self, device: Option<&str>, target: &str) -> Result<String> {
        let device = match device {
            Some(dev) => dev.to_string(),
            None => self.config.device(),
        };
        let serial = generate_serial();
        let wwn = wwn_for_serial(&serial);

        let res = self
            .backstores
            .create(device.as_str(), target, serial.as_str());
        self.step(res)
            .with_context(|| format!("registering backstore '{}' for '{}'", target, device))?;
        self.state = ProvisionState::BackstoreReady;

        let res = self.fabric.endpoint_exists(&self.backstores, target);
        let exists = self.step(res)?;
        if !exists {
            if let Err(create_err) = self.fabric.create_endpoint(&self.backstores, target, &wwn) {
                self.state = ProvisionState::Failed;
                let mut reasons = format!("{:#}", create_err);
                warn!(wwn = %wwn, "endpoint creation failed, rolling back");
                if let Err(delete_err) =
                    self.fabric.delete_endpoint(self.backstores.kind(), &wwn)
                {
                    reasons = format!("{}; rollback: {:#}", reasons, delete_err);
                }
                anyhow::bail!(VhostError::SetupFailed {
                    target: target.to_string(),
                    wwn,
                    reasons,
                })
            }
        }

        self.state = ProvisionState::EndpointReady;
        info!(wwn = %wwn, backstore = target, "vhost endpoint ready");
        Ok(wwn)
    }

    /// Deletes the endpoint belonging to `target`, resolving its wwn from
    /// the registered serial.
    pub fn teardown_vhost(&mut self, target: &str) -> Result<()> {
        let res = self.backstores.serial(target);
        let serial = self.step(res)?;
        let wwn = wwn_for_serial(serial);

        let res = self.fabric.delete_endpoint(self.backstores.kind(), &wwn);
        self.step(res)?;
        self.state = ProvisionState::Unprovisioned;

        Ok(())
    }

    /// Destroys the backing pool and everything in it.
    pub fn teardown_disk(&mut self) -> Result<()> {
        let res = self.pools.destroy_pool(self.config.pool_name());
        self.step(res)?;
        self.state = ProvisionState::Unprovisioned;

        Ok(())
    }
}
