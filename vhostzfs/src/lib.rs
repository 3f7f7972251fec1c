use std::cmp;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

mod backstore;
mod config;
mod fabric;
mod pool;
mod provision;

pub use backstore::*;
pub use config::*;
pub use fabric::*;
pub use pool::*;
pub use provision::*;

#[derive(Error, Debug)]
pub enum VhostError {
    #[error("A fatal error occured. See \"dmesg\" for more information.")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),

    #[error("Failed to create pool '{name}': {reasons}")]
    PoolCreate { name: String, reasons: String },
    #[error("No such pool '{0}' exists.")]
    PoolNotFound(String),
    #[error("Failed to destroy pool '{0}'. See \"zpool status\" for more information.")]
    PoolDestroy(String),
    #[error("Failed to create volume '{0}'.")]
    VolumeCreate(String),

    #[error("Failed to create backstore '{target}' at step '{step}'.")]
    BackstoreCreate { target: String, step: &'static str },
    #[error("No serial registered for backstore '{0}'.")]
    SerialNotFound(String),
    #[error("Serial attribute of backstore '{0}' is empty.")]
    SerialEmpty(String),

    #[error("Failed to create vhost endpoint '{wwn}' at step '{step}'.")]
    EndpointCreate { wwn: String, step: &'static str },
    #[error("No vhost endpoint exists for wwn '{0}'.")]
    EndpointNotFound(String),
    #[error("Failed to delete vhost endpoint '{wwn}': {reasons}")]
    EndpointDelete { wwn: String, reasons: String },

    #[error("Failed to set up vhost endpoint '{wwn}' for target '{target}': {reasons}")]
    SetupFailed {
        target: String,
        wwn: String,
        reasons: String,
    },

    #[error("Timed out after {waited:?} waiting for '{path}' to appear.")]
    WaitTimeout { path: String, waited: Duration },
}

/// Backoff schedule for configfs entries the kernel registers asynchronously.
///
/// The delay starts at `initial`, doubles after every miss and is capped at
/// `ceiling`; the poll fails once the accumulated wait exceeds `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(5),
        }
    }
}

/// Blocks until `path` exists, sleeping between existence checks according
/// to `policy`. Fails with [`VhostError::WaitTimeout`] once the accumulated
/// wait exceeds the policy ceiling.
pub fn wait_for_entry<P: AsRef<Path>>(path: P, policy: WaitPolicy) -> Result<()> {
    let path_ref = path.as_ref();
    let mut delay = policy.initial;
    let mut waited = Duration::ZERO;
    loop {
        thread::sleep(delay);
        waited += delay;
        if path_ref.exists() {
            return Ok(());
        }
        if waited > policy.ceiling {
            anyhow::bail!(VhostError::WaitTimeout {
                path: path_ref.display().to_string(),
                waited,
            });
        }
        delay = cmp::min(delay * 2, policy.ceiling);
    }
}

pub(crate) fn read_fl<P: AsRef<Path>>(path: P) -> Result<String> {
    let text = fs::read_to_string(path)?
        .split('\n')
        .next()
        .unwrap_or("")
        .to_string();

    Ok(text)
}

pub(crate) fn write_fl<P: AsRef<Path>, S: AsRef<str>>(path: P, value: S) -> Result<()> {
    let path_ref = path.as_ref();
    fs::write(path_ref, value.as_ref().as_bytes())
        .with_context(|| format!("writing attribute '{}'", path_ref.display()))?;

    Ok(())
}
