//! Daemon command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use color_eyre::eyre::{Result, eyre};

use rbdock::cluster::DeviceType;
use rbdock::dev::Context;
use rbdock::driver::{DriverConfig, RbdDriver, SHUTDOWN_TIMEOUT};
use rbdock_common::{ImageSize, parse_duration};

/// rbdock - Ceph RBD volumes for Docker
#[derive(Parser, Debug)]
#[command(name = "rbdock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pool holding the volumes
    #[arg(long, env = "RBD_POOL", default_value = "docker")]
    pub pool: String,

    /// Size of volumes created without a size option
    #[arg(long, default_value = "20G", value_parser = ImageSize::parse)]
    pub default_size: ImageSize,

    /// Filesystem of volumes created without an fs option
    #[arg(long, env = "RBD_DEFAULT_FS", default_value = "xfs")]
    pub default_filesystem: String,

    /// Directory volumes are mounted under
    #[arg(long, env = "RBD_VOLUME_DIR", default_value = "/var/lib/docker-volumes/rbd")]
    pub mountpoint: PathBuf,

    /// Lock TTL, refreshed at half of it (0 takes locks that never expire)
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub lock_ttl: Duration,

    /// Reap idle mapped volumes every interval (0 disables)
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub reap: Duration,

    /// Block device driver for mappings (nbd or krbd)
    #[arg(long, default_value = "nbd")]
    pub device_type: DeviceType,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Driver configuration from the flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool name is invalid.
    pub fn config(&self) -> Result<DriverConfig> {
        Ok(DriverConfig::default()
            .with_pool(&self.pool)?
            .with_default_size(self.default_size)
            .with_default_filesystem(self.default_filesystem.clone())
            .with_mount_root(self.mountpoint.clone())
            .with_lock_ttl(self.lock_ttl)
            .with_reap_interval(self.reap))
    }

    /// Run the driver until SIGINT or SIGTERM.
    pub async fn execute(self) -> Result<()> {
        if !rustix::process::getuid().is_root() {
            return Err(eyre!("rbdock must run as root"));
        }

        let config = self.config()?;
        let hostname = rbdock::system::hostname()?;
        let ctx = Context::host(self.device_type, config.paths.proc_root())?;
        config.paths.create_dirs()?;

        tracing::info!(
            pool = %config.pool,
            hostname,
            mount_root = %config.paths.mount_root.display(),
            device_type = self.device_type.as_str(),
            "Starting rbdock"
        );

        let reap_interval = config.reap_interval;
        let driver = Arc::new(RbdDriver::new(config, ctx, hostname));

        let recovering = Arc::clone(&driver);
        match tokio::task::spawn_blocking(move || recovering.recover()).await? {
            Ok(recovered) => tracing::info!(recovered, "Recovered mapped volumes"),
            Err(e) => tracing::warn!(error = %e, "Some volumes could not be recovered"),
        }

        let reaper = (!reap_interval.is_zero()).then(|| tokio::spawn(reap_loop(Arc::clone(&driver), reap_interval)));

        wait_for_signal().await?;
        if let Some(reaper) = reaper {
            reaper.abort();
        }

        let draining = Arc::clone(&driver);
        let idle = tokio::task::spawn_blocking(move || draining.shutdown(SHUTDOWN_TIMEOUT)).await?;
        tracing::info!(clean = idle, "Stopped");
        Ok(())
    }
}

async fn reap_loop(driver: Arc<RbdDriver>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let cutoff = SystemTime::now() - interval;
        let reaping = Arc::clone(&driver);
        match tokio::task::spawn_blocking(move || reaping.reap(cutoff)).await {
            Ok(Ok(reaped)) => tracing::debug!(reaped, "Reap pass complete"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Reap pass failed"),
            Err(e) => tracing::error!(error = %e, "Reap task panicked"),
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    tracing::info!("Shutdown requested");
    Ok(())
}
