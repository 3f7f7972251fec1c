use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::VhostError;

/// Parameters for structured pool creation: a single top-level vdev wrapping
/// the raw device, mounting suppressed, compression enabled on the root
/// dataset.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    name: String,
    device: String,
    compression: String,
}

impl PoolSpec {
    pub fn new<S: AsRef<str>>(name: S, device: S) -> Self {
        PoolSpec {
            name: name.as_ref().to_string(),
            device: device.as_ref().to_string(),
            compression: "lz4".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn compression(&self) -> &str {
        &self.compression
    }
}

/// Parameters for zvol creation. The reservation always equals the logical
/// size so the exported device can never run out of backing space.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pool: String,
    name: String,
    size: u64,
    blocksize: u64,
}

impl VolumeSpec {
    pub fn new<S: AsRef<str>>(pool: S, name: S, size: u64, blocksize: u64) -> Self {
        VolumeSpec {
            pool: pool.as_ref().to_string(),
            name: name.as_ref().to_string(),
            size,
            blocksize,
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocksize(&self) -> u64 {
        self.blocksize
    }

    pub fn reservation(&self) -> u64 {
        self.size
    }

    pub fn dataset(&self) -> String {
        format!("{}/{}", self.pool, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Pool {
    name: String,
}

impl Pool {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone)]
pub struct Volume {
    pool: String,
    name: String,
}

impl Volume {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device node the kernel exposes for the zvol.
    pub fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/zvol/{}/{}", self.pool, self.name))
    }
}

/// Capability seam over the pool engine. Structured and basic creation are
/// separate strategies so the manager can fall back from one to the other,
/// and tests can swap the whole engine out.
pub trait ZpoolEngine {
    fn create_pool(&self, spec: &PoolSpec) -> Result<()>;

    fn create_pool_basic(&self, name: &str, device: &str) -> Result<()>;

    fn pool_exists(&self, name: &str) -> Result<bool>;

    fn destroy_pool(&self, name: &str) -> Result<()>;

    fn create_volume(&self, spec: &VolumeSpec) -> Result<()>;
}

/// Production engine driving the `zpool`/`zfs` command line tools.
#[derive(Debug, Default)]
pub struct ZpoolCommand;

impl ZpoolCommand {
    pub fn new() -> Self {
        ZpoolCommand
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "running pool engine command");
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("spawning '{}'", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("'{} {}' failed: {}", program, args.join(" "), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ZpoolEngine for ZpoolCommand {
    fn create_pool(&self, spec: &PoolSpec) -> Result<()> {
        let compression = format!("compression={}", spec.compression());
        self.run(
            "zpool",
            &[
                "create",
                "-f",
                "-m",
                "none",
                "-O",
                &compression,
                "-O",
                "atime=off",
                spec.name(),
                spec.device(),
            ],
        )?;

        Ok(())
    }

    fn create_pool_basic(&self, name: &str, device: &str) -> Result<()> {
        self.run("zpool", &["create", name, "-f", device])?;

        Ok(())
    }

    fn pool_exists(&self, name: &str) -> Result<bool> {
        let status = Command::new("zpool")
            .args(["list", "-H", "-o", "name", name])
            .output()
            .context("spawning 'zpool'")?;

        Ok(status.status.success())
    }

    fn destroy_pool(&self, name: &str) -> Result<()> {
        self.run("zpool", &["destroy", name])?;

        Ok(())
    }

    fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        let size = spec.size().to_string();
        let blocksize = spec.blocksize().to_string();
        let reservation = format!("reservation={}", spec.reservation());
        self.run(
            "zfs",
            &[
                "create",
                "-V",
                &size,
                "-b",
                &blocksize,
                "-o",
                &reservation,
                &spec.dataset(),
            ],
        )?;

        Ok(())
    }
}

/// Creates and destroys the backing pool and its zvols. Holds no state
/// between calls; every operation goes straight through the engine.
#[derive(Debug, Default)]
pub struct PoolManager<E = ZpoolCommand> {
    engine: E,
}

impl PoolManager<ZpoolCommand> {
    pub fn new() -> Self {
        PoolManager {
            engine: ZpoolCommand::new(),
        }
    }
}

impl<E: ZpoolEngine> PoolManager<E> {
    pub fn with_engine(engine: E) -> Self {
        PoolManager { engine }
    }

    /// Creates the pool with the full property set, falling back to a basic
    /// name-plus-device creation when the structured path fails. Reports a
    /// combined error carrying both causes when the fallback fails too.
    pub fn create_pool<S: AsRef<str>>(&self, name: S, device: S) -> Result<Pool> {
        let name_ref = name.as_ref();
        let device_ref = device.as_ref();
        let spec = PoolSpec::new(name_ref, device_ref);

        info!(pool = name_ref, device = device_ref, "creating pool");
        if let Err(primary) = self.engine.create_pool(&spec) {
            warn!(
                pool = name_ref,
                error = %primary,
                "structured pool creation failed, trying basic creation"
            );
            if let Err(fallback) = self.engine.create_pool_basic(name_ref, device_ref) {
                anyhow::bail!(VhostError::PoolCreate {
                    name: name_ref.to_string(),
                    reasons: format!("{:#}; fallback: {:#}", primary, fallback),
                });
            }
        }

        Ok(Pool {
            name: name_ref.to_string(),
        })
    }

    pub fn destroy_pool<S: AsRef<str>>(&self, name: S) -> Result<()> {
        let name_ref = name.as_ref();
        if !self.engine.pool_exists(name_ref)? {
            anyhow::bail!(VhostError::PoolNotFound(name_ref.to_string()))
        }

        info!(pool = name_ref, "destroying pool");
        self.engine
            .destroy_pool(name_ref)
            .context(VhostError::PoolDestroy(name_ref.to_string()))?;

        Ok(())
    }

    pub fn create_volume<S: AsRef<str>>(
        &self,
        pool: S,
        name: S,
        size: u64,
        blocksize: u64,
    ) -> Result<Volume> {
        let spec = VolumeSpec::new(pool.as_ref(), name.as_ref(), size, blocksize);

        info!(
            dataset = %spec.dataset(),
            size,
            blocksize,
            "creating volume"
        );
        self.engine
            .create_volume(&spec)
            .context(VhostError::VolumeCreate(spec.dataset()))?;

        Ok(Volume {
            pool: pool.as_ref().to_string(),
            name: name.as_ref().to_string(),
        })
    }
}
