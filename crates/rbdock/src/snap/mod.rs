//! Filesystem-consistent snapshot batches.
//!
//! Every operation takes `pool/glob` patterns, lists each pattern's pool
//! and runs per image on its own thread; pruning also runs per snapshot. Failures of single patterns,
//! images or snapshots are collected and reported together once the whole
//! batch has run.

mod pattern;

use std::path::Path;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rbdock_common::{RbdError, RbdResult, SnapName};
use rustix::mount::MountFlags;

pub use pattern::{PoolPattern, snapshot_created, snapshot_name};

use crate::cluster::SnapEntry;
use crate::dev::{Context, Dev, Image, Pool};
use crate::driver::DeviceLocks;

/// Default snapshot name prefix.
pub const DEFAULT_PREFIX: &str = "rbd-snap";

/// Options of a snapshot batch.
#[derive(Debug, Clone)]
pub struct SnapOptions {
    /// Snapshot name, or its prefix when a timestamp is appended.
    pub prefix: String,
    /// Append `_<RFC3339 timestamp>` to the name.
    pub timestamp: bool,
    /// Skip unmapped images instead of snapshotting them unfrozen.
    pub only_mapped: bool,
}

impl Default for SnapOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            timestamp: true,
            only_mapped: false,
        }
    }
}

/// Counts of a batch that finished without errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Items acted on.
    pub completed: usize,
    /// Items left alone.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct Collector {
    report: Mutex<BatchReport>,
    errors: Mutex<Vec<RbdError>>,
}

impl Collector {
    fn completed(&self) {
        self.report.lock().completed += 1;
    }

    fn skipped(&self) {
        self.report.lock().skipped += 1;
    }

    fn fail(&self, error: RbdError) {
        self.errors.lock().push(error);
    }

    fn finish(self) -> RbdResult<BatchReport> {
        let report = self.report.into_inner();
        RbdError::from_batch(self.errors.into_inner())?;
        Ok(report)
    }
}

/// Runs snapshot, prune and mount batches against a cluster.
#[derive(Debug)]
pub struct SnapshotOrchestrator {
    ctx: Context,
    devices: DeviceLocks,
}

impl SnapshotOrchestrator {
    /// Orchestrator over `ctx`.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            devices: DeviceLocks::new(),
        }
    }

    /// Snapshot every image matching `patterns`.
    ///
    /// Mounted filesystems are frozen for the snapshot. Mapped images
    /// mounted only in other namespaces fail. Unmapped images are skipped
    /// with `only_mapped`, otherwise snapshotted as they are.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::PartialBatchFailure`] with every failure.
    pub fn snap<S: AsRef<str> + Sync>(&self, patterns: &[S], options: &SnapOptions) -> RbdResult<BatchReport> {
        let name = SnapName::new(snapshot_name(&options.prefix, options.timestamp, Utc::now()))?;
        tracing::info!(snapshot = %name, "Creating snapshots");

        self.fan_out(patterns, |image, collector| {
            let created = match image.create_consistent_snapshot(name.clone()) {
                Err(RbdError::NotMapped { .. }) if options.only_mapped => {
                    tracing::debug!(image = %image.name(), "Skipping unmapped image");
                    collector.skipped();
                    return;
                }
                Err(RbdError::NotMapped { .. }) => image.create_snapshot(name.clone()),
                other => other,
            };
            match created {
                Ok(snapshot) => {
                    tracing::info!(snapshot = %snapshot.name(), "Snapshot complete");
                    collector.completed();
                }
                Err(e) => {
                    tracing::error!(image = %image.name(), error = %e, "Failed to create snapshot");
                    collector.fail(e);
                }
            }
        })
    }

    /// Remove snapshots named with `prefix` created more than `older_than`
    /// ago.
    ///
    /// # Errors
    ///
    /// See [`SnapshotOrchestrator::prune_before`].
    pub fn prune<S: AsRef<str> + Sync>(
        &self,
        patterns: &[S],
        prefix: &str,
        older_than: Duration,
    ) -> RbdResult<BatchReport> {
        let age = chrono::Duration::from_std(older_than).map_err(|_| RbdError::InvalidQuantity {
            value: format!("{older_than:?}"),
        })?;
        self.prune_before(patterns, prefix, Utc::now() - age)
    }

    /// Remove snapshots named with `prefix` created before `cutoff`.
    ///
    /// Each snapshot is unmounted and unmapped before removal. One mounted
    /// elsewhere, or whose device cannot be unmapped, is not removed.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::PartialBatchFailure`] with every failure,
    /// including snapshots whose creation time cannot be determined.
    pub fn prune_before<S: AsRef<str> + Sync>(
        &self,
        patterns: &[S],
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> RbdResult<BatchReport> {
        tracing::info!(before = %cutoff, prefix, "Pruning snapshots");

        self.fan_out(patterns, |image, collector| {
            let entries = match image.snapshot_entries() {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(image = %image.name(), error = %e, "Failed to list snapshots");
                    collector.fail(e);
                    return;
                }
            };

            thread::scope(|s| {
                for entry in entries.iter().filter(|e| e.name.starts_with(prefix)) {
                    s.spawn(move || prune_snapshot(image, entry, prefix, cutoff, collector));
                }
            });
        })
    }

    /// Mount the newest `prefix` snapshot of each matched image read-only
    /// at `<mount_root>/<image>`.
    ///
    /// Whatever is mounted there from the image itself or an older
    /// snapshot is unmounted and unmapped first. Probes the filesystem
    /// when `fstype` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::PartialBatchFailure`] with every failure; an
    /// image without a matching snapshot fails with
    /// [`RbdError::NotFound`].
    pub fn mount_latest<S: AsRef<str> + Sync>(
        &self,
        patterns: &[S],
        prefix: &str,
        mount_root: &Path,
        fstype: Option<&str>,
    ) -> RbdResult<BatchReport> {
        self.fan_out(patterns, |image, collector| {
            let mountpoint = mount_root.join(image.name().image_name().as_str());
            match mount_latest_at(image, prefix, &mountpoint, fstype) {
                Ok(()) => collector.completed(),
                Err(e) => {
                    tracing::error!(
                        image = %image.name(),
                        mountpoint = %mountpoint.display(),
                        error = %e,
                        "Failed to mount latest snapshot"
                    );
                    collector.fail(e);
                }
            }
        })
    }

    /// Run `action` on every image matching any of `patterns`, one thread
    /// per pattern and one per image.
    fn fan_out<S, F>(&self, patterns: &[S], action: F) -> RbdResult<BatchReport>
    where
        S: AsRef<str> + Sync,
        F: Fn(&Image, &Collector) + Sync,
    {
        let collector = Collector::default();
        let collector_ref = &collector;
        let action = &action;

        thread::scope(|s| {
            for raw in patterns {
                s.spawn(move || {
                    let pattern: PoolPattern = match raw.as_ref().parse() {
                        Ok(pattern) => pattern,
                        Err(e) => {
                            tracing::error!(error = %e, "Skipping pattern");
                            collector_ref.fail(e);
                            return;
                        }
                    };
                    let images = match Pool::new(self.ctx.clone(), pattern.pool().clone()).images() {
                        Ok(images) => images,
                        Err(e) => {
                            tracing::error!(pool = %pattern.pool(), error = %e, "Failed to list images");
                            collector_ref.fail(e);
                            return;
                        }
                    };

                    thread::scope(|s| {
                        for image in images {
                            if !pattern.matches(image.name().image_name()) {
                                continue;
                            }
                            s.spawn(move || {
                                let _guard = self.devices.lock(image.name());
                                action(&image, collector_ref);
                            });
                        }
                    });
                });
            }
        });

        let report = collector.finish()?;
        tracing::info!(completed = report.completed, skipped = report.skipped, "Batch complete");
        Ok(report)
    }
}

fn prune_snapshot(image: &Image, entry: &SnapEntry, prefix: &str, cutoff: DateTime<Utc>, collector: &Collector) {
    let Some(created) = snapshot_created(entry, prefix) else {
        collector.fail(RbdError::Parse {
            what: "snapshot creation time".to_string(),
            message: format!("{}@{} has no usable timestamp", image.name(), entry.name),
        });
        return;
    };
    if created >= cutoff {
        tracing::debug!(image = %image.name(), snapshot = %entry.name, %created, "Keeping newer snapshot");
        collector.skipped();
        return;
    }

    let pruned = SnapName::new(entry.name.as_str()).and_then(|snap| {
        let snapshot = image.snapshot(snap);
        snapshot.unmount_and_unmap(None)?;
        snapshot.remove()
    });
    match pruned {
        Ok(()) => {
            tracing::info!(image = %image.name(), snapshot = %entry.name, %created, "Pruned");
            collector.completed();
        }
        Err(e) => {
            tracing::error!(image = %image.name(), snapshot = %entry.name, error = %e, "Failed to prune");
            collector.fail(e);
        }
    }
}

fn mount_latest_at(image: &Image, prefix: &str, mountpoint: &Path, fstype: Option<&str>) -> RbdResult<()> {
    image.unmount_and_unmap(Some(mountpoint))?;

    let snapshots: Vec<_> = image
        .snapshots()?
        .into_iter()
        .filter(|s| s.snap_name().starts_with(prefix))
        .collect();
    let Some((latest, older)) = snapshots.split_last() else {
        return Err(RbdError::NotFound {
            kind: "snapshot",
            name: format!("{}@{prefix}*", image.name()),
        });
    };

    for snapshot in older {
        snapshot.unmount_and_unmap(Some(mountpoint))?;
    }

    latest.map_and_mount(mountpoint, fstype, MountFlags::RDONLY)?;
    tracing::info!(
        snapshot = %latest.name(),
        mountpoint = %mountpoint.display(),
        "Mounted latest snapshot"
    );
    Ok(())
}
