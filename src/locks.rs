//! Per-sector mutual exclusion.
//!
//! The world is partitioned into 16×16 sectors; a sector lock is the only
//! resource shared across agents. Locks are created lazily on first access
//! (creation serialized through the manager's own mutex so two agents cannot
//! race a lock into existence twice), acquisition is timeout-bounded and
//! never raises, and `release_all` is the shutdown sweep that guarantees no
//! lock outlives an abnormally terminated holder.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

/// Side length of a sector in world coordinates.
pub const SECTOR_SIZE: i32 = 16;

/// A 16×16 cell of the world, the unit of mutual exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sector {
    pub x: i32,
    pub z: i32,
}

impl Sector {
    /// Sector containing the given block coordinates. Uses euclidean
    /// division so negative coordinates map correctly.
    pub fn containing(x: i32, z: i32) -> Self {
        Self {
            x: x.div_euclid(SECTOR_SIZE),
            z: z.div_euclid(SECTOR_SIZE),
        }
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

struct SectorLock {
    permit: Semaphore,
    held: AtomicBool,
}

/// Lazily populated table of per-sector locks.
///
/// The `held` flag mirrors the original manager semantics: `release` frees
/// the sector no matter who acquired it, and releasing an unheld sector is a
/// no-op. Holders are expected to release within the same cycle that
/// acquired; `release_all` covers abnormal exits.
pub struct SectorLockManager {
    locks: Mutex<HashMap<Sector, Arc<SectorLock>>>,
}

impl SectorLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Try to acquire the sector lock, waiting at most `timeout`.
    /// Returns false on timeout; never an error.
    pub async fn acquire(&self, sector: Sector, timeout: Duration) -> bool {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(sector).or_insert_with(|| {
                Arc::new(SectorLock {
                    permit: Semaphore::new(1),
                    held: AtomicBool::new(false),
                })
            }))
        };
        let acquired = tokio::time::timeout(timeout, lock.permit.acquire()).await;
        match acquired {
            Ok(Ok(permit)) => {
                permit.forget();
                lock.held.store(true, Ordering::SeqCst);
                true
            }
            // the semaphore is never closed
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(%sector, "sector lock acquisition timed out");
                false
            }
        }
    }

    /// Release the sector if it is currently held; otherwise a no-op.
    pub async fn release(&self, sector: Sector) {
        let lock = self.locks.lock().await.get(&sector).cloned();
        if let Some(lock) = lock {
            if lock.held.swap(false, Ordering::SeqCst) {
                lock.permit.add_permits(1);
                debug!(%sector, "sector released");
            }
        }
    }

    /// Force-release every held lock. Invoked during shutdown sweeps.
    pub async fn release_all(&self) {
        let locks = self.locks.lock().await;
        let mut released = 0usize;
        for lock in locks.values() {
            if lock.held.swap(false, Ordering::SeqCst) {
                lock.permit.add_permits(1);
                released += 1;
            }
        }
        if released > 0 {
            info!(released, "force-released sector locks");
        }
    }

    /// Number of sectors currently held.
    pub async fn held_count(&self) -> usize {
        let locks = self.locks.lock().await;
        locks
            .values()
            .filter(|l| l.held.load(Ordering::SeqCst))
            .count()
    }
}

impl Default for SectorLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_sector_containing() {
        assert_eq!(Sector::containing(0, 0), Sector { x: 0, z: 0 });
        assert_eq!(Sector::containing(15, 15), Sector { x: 0, z: 0 });
        assert_eq!(Sector::containing(16, 31), Sector { x: 1, z: 1 });
        assert_eq!(Sector::containing(-1, -16), Sector { x: -1, z: -1 });
        assert_eq!(Sector::containing(-17, 5), Sector { x: -2, z: 0 });
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let mgr = SectorLockManager::new();
        let s = Sector::containing(3, 3);
        assert!(mgr.acquire(s, Duration::from_millis(50)).await);
        assert_eq!(mgr.held_count().await, 1);
        mgr.release(s).await;
        assert_eq!(mgr.held_count().await, 0);
        assert!(mgr.acquire(s, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out_within_bound() {
        let mgr = SectorLockManager::new();
        let s = Sector { x: 0, z: 0 };
        assert!(mgr.acquire(s, Duration::from_millis(50)).await);
        let start = Instant::now();
        assert!(!mgr.acquire(s, Duration::from_millis(80)).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_distant_sectors_do_not_contend() {
        let mgr = SectorLockManager::new();
        assert!(mgr.acquire(Sector { x: 0, z: 0 }, Duration::from_millis(10)).await);
        assert!(mgr.acquire(Sector { x: 5, z: -3 }, Duration::from_millis(10)).await);
        assert_eq!(mgr.held_count().await, 2);
    }

    #[tokio::test]
    async fn test_release_unheld_is_noop() {
        let mgr = SectorLockManager::new();
        let s = Sector { x: 1, z: 1 };
        mgr.release(s).await;
        mgr.release(s).await;
        assert!(mgr.acquire(s, Duration::from_millis(10)).await);
        mgr.release(s).await;
        mgr.release(s).await;
        // double release must not mint extra permits
        assert!(mgr.acquire(s, Duration::from_millis(10)).await);
        assert!(!mgr.acquire(s, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_release_all_clears_everything() {
        let mgr = SectorLockManager::new();
        for i in 0..4 {
            assert!(mgr.acquire(Sector { x: i, z: 0 }, Duration::from_millis(10)).await);
        }
        mgr.release(Sector { x: 0, z: 0 }).await;
        mgr.release_all().await;
        assert_eq!(mgr.held_count().await, 0);
        for i in 0..4 {
            assert!(mgr.acquire(Sector { x: i, z: 0 }, Duration::from_millis(10)).await);
        }
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let mgr = Arc::new(SectorLockManager::new());
        let s = Sector { x: 2, z: 2 };
        assert!(mgr.acquire(s, Duration::from_millis(10)).await);
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire(s, Duration::from_millis(500)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.release(s).await;
        assert!(waiter.await.unwrap());
    }
}
