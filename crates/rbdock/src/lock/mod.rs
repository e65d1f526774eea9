//! TTL based cooperative locks.
//!
//! A volume is locked by adding a shared advisory lock entry whose id is a
//! [`LockLabel`]: the owning host and an expiry. While held, a background
//! thread adds a fresh entry every half TTL and prunes the entries it
//! supersedes, so at rest each holder has exactly one unexpired entry.
//! Any client that sees an expired entry may remove it.

mod label;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use rbdock_common::{DevName, RbdError, RbdResult};

pub use label::{LockLabel, never};

use crate::cluster::{Cluster, LockEntry};

/// Refresh interval as a percentage of the TTL.
pub const REFRESH_PERCENT: u32 = 50;

/// Consecutive idle refresh cycles before a lock releases itself.
pub const DEFAULT_IDLE_GRACE: u32 = 3;

/// Reports the number of active users of a locked volume.
pub type UsageProbe = Arc<dyn Fn() -> usize + Send + Sync>;

/// Acquires and inspects cooperative locks for this host.
#[derive(Clone)]
pub struct LockManager {
    cluster: Arc<dyn Cluster>,
    hostname: String,
    tag: String,
    idle_grace: u32,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("hostname", &self.hostname)
            .field("tag", &self.tag)
            .field("idle_grace", &self.idle_grace)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// Locks owned by `hostname`, tagged with `tag`.
    #[must_use]
    pub fn new(cluster: Arc<dyn Cluster>, hostname: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            cluster,
            hostname: hostname.into(),
            tag: tag.into(),
            idle_grace: DEFAULT_IDLE_GRACE,
        }
    }

    /// Set the idle grace. Zero disables idle release.
    #[must_use]
    pub const fn with_idle_grace(mut self, cycles: u32) -> Self {
        self.idle_grace = cycles;
        self
    }

    /// Host that owns the locks of this manager.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Lock `dev` unless any unexpired entry exists.
    ///
    /// A zero `ttl` takes a fixed lock that never expires and is never
    /// refreshed. Entries whose id is not a lock label are treated as held.
    ///
    /// # Errors
    ///
    /// Returns [`RbdError::LockContention`] if the volume is locked, or the
    /// cluster error if the lock cannot be listed or added.
    pub fn acquire(&self, dev: &DevName, ttl: Duration, usage: Option<UsageProbe>) -> RbdResult<Lock> {
        let now = Utc::now();
        for entry in self.cluster.lock_list(dev)? {
            match entry.id.parse::<LockLabel>() {
                Ok(label) if label.is_expired(now) => {
                    tracing::debug!(dev = %dev, id = %entry.id, "Ignoring expired lock entry");
                }
                Ok(label) => {
                    return Err(RbdError::LockContention {
                        dev: dev.to_string(),
                        holder: label.holder,
                        expires: label.expires_at.to_rfc3339(),
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        dev = %dev,
                        id = %entry.id,
                        locker = %entry.locker,
                        "Unrecognised lock entry, treating volume as locked"
                    );
                    return Err(RbdError::LockContention {
                        dev: dev.to_string(),
                        holder: entry.locker,
                        expires: "unknown".to_string(),
                    });
                }
            }
        }

        self.start(dev, ttl, usage)
    }

    /// Lock `dev` forever.
    ///
    /// # Errors
    ///
    /// See [`LockManager::acquire`].
    pub fn acquire_fixed(&self, dev: &DevName) -> RbdResult<Lock> {
        self.acquire(dev, Duration::ZERO, None)
    }

    /// Take over a lock this host already holds, e.g. after a restart.
    ///
    /// Skips the contention check, adds a fresh entry and removes every
    /// older entry of this host.
    ///
    /// # Errors
    ///
    /// Returns the cluster error if the entry cannot be added or listed.
    pub fn inherit(&self, dev: &DevName, ttl: Duration, usage: Option<UsageProbe>) -> RbdResult<Lock> {
        tracing::info!(dev = %dev, "Inheriting lock");
        self.start(dev, ttl, usage)
    }

    fn start(&self, dev: &DevName, ttl: Duration, usage: Option<UsageProbe>) -> RbdResult<Lock> {
        let shared = Arc::new(Shared {
            dev: dev.clone(),
            cluster: Arc::clone(&self.cluster),
            hostname: self.hostname.clone(),
            tag: self.tag.clone(),
            ttl,
            idle_grace: self.idle_grace,
            usage,
            released: AtomicBool::new(false),
            stop: Mutex::new(None),
            cycle: Mutex::new(()),
        });

        shared.refresh()?;
        let lock = Lock { shared };

        if !ttl.is_zero() {
            let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
            *lock.shared.stop.lock() = Some(stop_tx);

            let worker = Arc::clone(&lock.shared);
            let interval = (ttl * REFRESH_PERCENT / 100).max(Duration::from_millis(1));
            let spawned = std::thread::Builder::new()
                .name(format!("lock-{}", dev.image_name()))
                .spawn(move || worker.run(&stop_rx, interval));

            if let Err(e) = spawned {
                lock.release()?;
                return Err(e.into());
            }
        }

        tracing::info!(dev = %dev, ttl = ?ttl, "Acquired lock");
        Ok(lock)
    }

    /// An unexpired entry of another host, if any.
    ///
    /// # Errors
    ///
    /// Returns the cluster error if the lock list cannot be read.
    pub fn foreign_holder(&self, dev: &DevName) -> RbdResult<Option<LockLabel>> {
        let now = Utc::now();
        Ok(self
            .cluster
            .lock_list(dev)?
            .into_iter()
            .filter_map(|entry| entry.id.parse::<LockLabel>().ok())
            .find(|label| label.holder != self.hostname && !label.is_expired(now)))
    }

    /// Remove every expired entry of any host. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the cluster error if the lock list cannot be read.
    pub fn reap(&self, dev: &DevName) -> RbdResult<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in self.cluster.lock_list(dev)? {
            let Ok(label) = entry.id.parse::<LockLabel>() else {
                continue;
            };
            if label.is_expired(now) && remove_entry(self.cluster.as_ref(), dev, &entry, "expired") {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// A held cooperative lock.
///
/// Clones share the same lock. Dropping a handle does not release it.
#[derive(Clone)]
pub struct Lock {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("dev", &self.shared.dev)
            .field("ttl", &self.shared.ttl)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Lock {
    /// The locked device.
    #[must_use]
    pub fn dev(&self) -> &DevName {
        &self.shared.dev
    }

    /// Lock TTL, zero for fixed locks.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// True once released, explicitly or for idleness.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Run one refresh cycle now. No-op once released.
    ///
    /// # Errors
    ///
    /// Returns the cluster error of the failed step.
    pub fn refresh(&self) -> RbdResult<()> {
        self.shared.refresh()
    }

    /// Stop refreshing and remove this host's entries. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the cluster error if the lock list cannot be read; entries
    /// left behind then expire on their own.
    pub fn release(&self) -> RbdResult<()> {
        self.shared.release()
    }
}

struct Shared {
    dev: DevName,
    cluster: Arc<dyn Cluster>,
    hostname: String,
    tag: String,
    ttl: Duration,
    idle_grace: u32,
    usage: Option<UsageProbe>,
    released: AtomicBool,
    stop: Mutex<Option<Sender<()>>>,
    // serializes refresh cycles with release
    cycle: Mutex<()>,
}

impl Shared {
    fn label(&self) -> RbdResult<LockLabel> {
        if self.ttl.is_zero() {
            return Ok(LockLabel::fixed(&self.hostname));
        }
        let ttl = chrono::Duration::from_std(self.ttl).map_err(|e| RbdError::Config {
            message: format!("lock TTL out of range: {e}"),
        })?;
        Ok(LockLabel::new(&self.hostname, Utc::now() + ttl))
    }

    fn refresh(&self) -> RbdResult<()> {
        let _cycle = self.cycle.lock();
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }

        let label = self.label()?;
        let id = label.encode();
        self.cluster.lock_add(&self.dev, &id, &self.tag)?;
        tracing::debug!(dev = %self.dev, %id, "Added lock entry");

        let now = Utc::now();
        for entry in self.cluster.lock_list(&self.dev)? {
            if entry.id == id {
                continue;
            }
            match entry.id.parse::<LockLabel>() {
                Ok(old) if old.holder == self.hostname => {
                    remove_entry(self.cluster.as_ref(), &self.dev, &entry, "superseded");
                }
                Ok(old) if old.is_expired(now) => {
                    remove_entry(self.cluster.as_ref(), &self.dev, &entry, "expired");
                }
                Ok(other) => {
                    tracing::error!(
                        dev = %self.dev,
                        holder = %other.holder,
                        expires = %other.expires_at,
                        "Another host holds an unexpired lock on a volume locked by this host"
                    );
                }
                Err(_) => {
                    tracing::debug!(dev = %self.dev, id = %entry.id, "Ignoring unrecognised lock entry");
                }
            }
        }

        Ok(())
    }

    fn release(&self) -> RbdResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.stop.lock().take());

        let _cycle = self.cycle.lock();
        for entry in self.cluster.lock_list(&self.dev)? {
            match entry.id.parse::<LockLabel>() {
                Ok(label) if label.holder == self.hostname => {
                    remove_entry(self.cluster.as_ref(), &self.dev, &entry, "released");
                }
                Ok(other) => {
                    tracing::error!(
                        dev = %self.dev,
                        holder = %other.holder,
                        "Found another host's lock entry while releasing ours"
                    );
                }
                Err(_) => {}
            }
        }

        tracing::info!(dev = %self.dev, "Released lock");
        Ok(())
    }

    fn run(&self, stop: &Receiver<()>, interval: Duration) {
        let ticker = crossbeam_channel::tick(interval);
        let mut idle = 0u32;

        loop {
            crossbeam_channel::select! {
                recv(stop) -> _ => break,
                recv(ticker) -> _ => {
                    if self.released.load(Ordering::SeqCst) {
                        break;
                    }

                    if let Some(usage) = &self.usage {
                        idle = if usage() == 0 { idle + 1 } else { 0 };
                        if self.idle_grace > 0 && idle >= self.idle_grace {
                            tracing::info!(dev = %self.dev, cycles = idle, "Releasing idle lock");
                            if let Err(e) = self.release() {
                                tracing::warn!(dev = %self.dev, error = %e, "Failed to release idle lock");
                            }
                            break;
                        }
                    }

                    if let Err(e) = self.refresh() {
                        tracing::warn!(dev = %self.dev, error = %e, "Lock refresh failed, retrying next tick");
                    }
                }
            }
        }

        tracing::debug!(dev = %self.dev, "Lock refresh stopped");
    }
}

fn remove_entry(cluster: &dyn Cluster, dev: &DevName, entry: &LockEntry, why: &str) -> bool {
    match cluster.lock_remove(dev, &entry.id, &entry.locker) {
        Ok(()) => {
            tracing::debug!(dev = %dev, id = %entry.id, why, "Removed lock entry");
            true
        }
        Err(e) => {
            tracing::warn!(dev = %dev, id = %entry.id, why, error = %e, "Failed to remove lock entry");
            false
        }
    }
}
