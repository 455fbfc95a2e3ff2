//! Per-path locking
//!
//! Mutations of one virtual path are serialized; disjoint paths never contend.
//! Locks are taken with a bounded number of timed attempts and released when
//! the guard drops, including on early return or unwind.

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::vpath::VirtualPath;

/// Default time to wait for a single lock attempt
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Default number of lock attempts before reporting busy
pub const DEFAULT_LOCK_RETRIES: u32 = 8;

type LockMap = DashMap<VirtualPath, Arc<Mutex<()>>>;

/// Table of per-path mutexes
pub struct PathLocks {
    locks: Arc<LockMap>,
    timeout: Duration,
    retries: u32,
}

impl PathLocks {
    pub fn new(timeout: Duration, retries: u32) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
            retries: retries.max(1),
        }
    }

    /// Lock a single path
    pub fn lock(&self, path: &VirtualPath) -> Result<PathGuard> {
        let mutex = self
            .locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        for attempt in 1..=self.retries {
            if let Some(guard) = Mutex::try_lock_arc_for(&mutex, self.timeout) {
                return Ok(PathGuard {
                    path: path.clone(),
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                });
            }
            debug!("lock {} busy, attempt {}/{}", path, attempt, self.retries);
        }

        warn!("Giving up on lock for {} after {} attempts", path, self.retries);
        Err(Error::Busy(path.clone()))
    }

    /// Lock several paths in a canonical order, so concurrent callers locking
    /// overlapping sets cannot deadlock
    pub fn lock_many(&self, paths: &[&VirtualPath]) -> Result<Vec<PathGuard>> {
        let mut ordered: Vec<&VirtualPath> = paths.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for path in ordered {
            guards.push(self.lock(path)?);
        }
        Ok(guards)
    }

    /// Number of paths that currently have a lock entry
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Default for PathLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_RETRIES)
    }
}

/// Held lock on one virtual path
pub struct PathGuard {
    path: VirtualPath,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    locks: Arc<LockMap>,
}

impl PathGuard {
    pub fn path(&self) -> &VirtualPath {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Drop the table entry once nobody else holds or waits on it
        self.locks
            .remove_if(&self.path, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    #[test]
    fn test_lock_and_release() {
        let locks = PathLocks::default();
        {
            let guard = locks.lock(&vp("a")).unwrap();
            assert_eq!(guard.path(), &vp("a"));
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_same_path_times_out_busy() {
        let locks = PathLocks::new(Duration::from_millis(5), 2);
        let _held = locks.lock(&vp("a")).unwrap();
        let err = locks.lock(&vp("a")).err().unwrap();
        assert!(matches!(err, Error::Busy(_)));
        assert_eq!(err.to_errno(), libc::EBUSY);
    }

    #[test]
    fn test_disjoint_paths_do_not_contend() {
        let locks = PathLocks::new(Duration::from_millis(5), 1);
        let _a = locks.lock(&vp("a")).unwrap();
        let _b = locks.lock(&vp("b")).unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[test]
    fn test_lock_many_dedups() {
        let locks = PathLocks::default();
        let a = vp("a");
        let guards = locks.lock_many(&[&a, &a]).unwrap();
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let locks = Arc::new(PathLocks::new(Duration::from_millis(5), 2));
        let inner = Arc::clone(&locks);
        let result = thread::spawn(move || {
            let _guard = inner.lock(&vp("p")).unwrap();
            panic!("mid-operation failure");
        })
        .join();
        assert!(result.is_err());
        assert!(locks.lock(&vp("p")).is_ok());
    }

    #[test]
    fn test_serializes_same_path() {
        let locks = Arc::new(PathLocks::new(Duration::from_secs(5), 4));
        let inside = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let _guard = locks.lock(&vp("shared")).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(locks.active(), 0);
    }
}
