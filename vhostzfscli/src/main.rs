use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use vhostzfs::{ProvisionConfig, Provisioner};

#[derive(Parser)]
#[command(name = "vhostzfscli", about = "Provision zfs-backed vhost-scsi targets")]
struct Cli {
    /// YAML provisioning config; built-in defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the pool, volume, backstore and vhost endpoint
    Setup {
        /// raw block device backing the pool
        device: String,
        /// backstore target name override
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Delete the vhost endpoint and destroy the pool
    Teardown {
        /// backstore target name override
        #[arg(short, long)]
        target: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ProvisionConfig::read(path)?,
        None => ProvisionConfig::default(),
    };

    let mut provisioner = Provisioner::new(config.clone());
    match cli.command {
        Command::Setup { device, target } => {
            let target = target.unwrap_or_else(|| config.target_name().to_string());
            let volume = provisioner.setup_disk(&device)?;
            info!(device = %volume.device_path().display(), "disk ready");
            let wwn = provisioner.setup_vhost(None, &target)?;
            println!("{}", wwn);
        }
        Command::Teardown { target } => {
            let target = target.unwrap_or_else(|| config.target_name().to_string());
            provisioner.teardown_vhost(&target)?;
            provisioner.teardown_disk()?;
            info!(backstore = %target, "torn down");
        }
    }

    Ok(())
}
