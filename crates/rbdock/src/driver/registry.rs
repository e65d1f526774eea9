//! Per-driver shared state: device serialization, mount users and the
//! in-flight operation counter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Condvar, Mutex, RawMutex, RwLock};
use rbdock_common::DevName;

use crate::lock::UsageProbe;

/// User registered for volumes found mounted at startup.
pub const RECOVERED_USER: &str = "<recovered>";

/// One mutex per device identity.
///
/// Every map, mount, unmount, unmap and remove sequence on a device runs
/// while holding its mutex.
#[derive(Debug, Default)]
pub struct DeviceLocks {
    locks: RwLock<HashMap<DevName, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `dev` is free and hold it until the guard drops.
    pub fn lock(&self, dev: &DevName) -> ArcMutexGuard<RawMutex, ()> {
        let existing = self.locks.read().get(dev).cloned();
        let mutex = match existing {
            Some(mutex) => mutex,
            None => Arc::clone(self.locks.write().entry(dev.clone()).or_default()),
        };
        mutex.lock_arc()
    }

    /// Number of devices seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    /// True if no device was locked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}

/// Container ids using each mounted volume.
#[derive(Debug, Default)]
pub struct MountUsers {
    users: DashMap<DevName, HashSet<String>>,
}

impl MountUsers {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`. Returns true if it is the first user.
    pub fn add(&self, dev: &DevName, id: &str) -> bool {
        let mut users = self.users.entry(dev.clone()).or_default();
        let first = users.is_empty();
        users.insert(id.to_string());
        first
    }

    /// Unregister `id` and return the number of users left.
    ///
    /// A recovered user stands in for ids from before a restart, so it is
    /// dropped as soon as it is the only user left.
    pub fn remove(&self, dev: &DevName, id: &str) -> usize {
        let remaining = match self.users.get_mut(dev) {
            Some(mut users) => {
                if !users.remove(id) {
                    tracing::debug!(dev = %dev, id, "Unknown mount user");
                }
                if users.len() == 1 && users.contains(RECOVERED_USER) {
                    users.clear();
                }
                users.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.users.remove_if(dev, |_, users| users.is_empty());
        }
        remaining
    }

    /// Number of users of `dev`.
    #[must_use]
    pub fn count(&self, dev: &DevName) -> usize {
        self.users.get(dev).map_or(0, |users| users.len())
    }

    /// Usage probe for the cooperative lock of `dev`.
    #[must_use]
    pub fn probe(self: &Arc<Self>, dev: &DevName) -> UsageProbe {
        let users = Arc::clone(self);
        let dev = dev.clone();
        Arc::new(move || users.count(&dev))
    }
}

/// Counts running volume operations so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Marks one running operation until dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
}

impl InFlight {
    /// Create an idle counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an operation.
    pub fn enter(&self) -> InFlightGuard<'_> {
        *self.count.lock() += 1;
        InFlightGuard { owner: self }
    }

    /// Operations currently running.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no operation runs. Returns false on timeout.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.owner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.owner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dev(s: &str) -> DevName {
        s.parse().unwrap()
    }

    #[test]
    fn device_lock_serializes() {
        let locks = DeviceLocks::new();
        let inside = AtomicUsize::new(0);
        let overlaps = AtomicUsize::new(0);
        let data = dev("docker/data");

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let _guard = locks.lock(&data);
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn device_locks_are_independent() {
        let locks = DeviceLocks::new();
        let _a = locks.lock(&dev("docker/a"));
        let _b = locks.lock(&dev("docker/b"));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn guard_outlives_registry() {
        let data = dev("docker/data");
        let guard: ArcMutexGuard<RawMutex, ()> = {
            let locks = DeviceLocks::new();
            locks.lock(&data)
        };
        assert!(ArcMutexGuard::mutex(&guard).is_locked());
        drop(guard);
    }

    #[test]
    fn mount_user_counting() {
        let users = MountUsers::new();
        let data = dev("docker/data");

        assert!(users.add(&data, "c1"));
        assert!(!users.add(&data, "c2"));
        assert!(!users.add(&data, "c2"));
        assert_eq!(users.count(&data), 2);

        assert_eq!(users.remove(&data, "c1"), 1);
        assert_eq!(users.remove(&data, "c9"), 1);
        assert_eq!(users.remove(&data, "c2"), 0);
        assert_eq!(users.count(&data), 0);
        assert_eq!(users.remove(&data, "c2"), 0);
    }

    #[test]
    fn recovered_user_yields_to_any_unmount() {
        let users = MountUsers::new();
        let data = dev("docker/data");

        users.add(&data, RECOVERED_USER);
        assert_eq!(users.remove(&data, "from-before-restart"), 0);

        users.add(&data, RECOVERED_USER);
        users.add(&data, "c2");
        assert_eq!(users.remove(&data, "c1"), 2);
        assert_eq!(users.remove(&data, "c2"), 0);
    }

    #[test]
    fn probe_tracks_users() {
        let users = Arc::new(MountUsers::new());
        let data = dev("docker/data");
        let probe = users.probe(&data);

        assert_eq!(probe(), 0);
        users.add(&data, "c1");
        assert_eq!(probe(), 1);
    }

    #[test]
    fn in_flight_wait() {
        let in_flight = InFlight::new();
        assert!(in_flight.wait_idle(Duration::ZERO));

        std::thread::scope(|s| {
            let guard = in_flight.enter();
            assert_eq!(in_flight.count(), 1);
            assert!(!in_flight.wait_idle(Duration::from_millis(20)));

            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                drop(guard);
            });
            assert!(in_flight.wait_idle(Duration::from_secs(5)));
        });
        assert_eq!(in_flight.count(), 0);
    }
}
