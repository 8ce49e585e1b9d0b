use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::PrimaryKey;

/// Serializes mutating operations per room.
///
/// Locks are created lazily on first use and evicted once a room has been
/// quiet long enough, so the registry doesn't grow with every room ever
/// touched.
pub struct RoomLocks {
    idle_ttl: Duration,
    locks: DashMap<PrimaryKey, RoomLock>,
}

struct RoomLock {
    mutex: Arc<Mutex<()>>,
    last_used: AtomicCell<Instant>,
}

impl RoomLocks {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            idle_ttl,
            locks: DashMap::new(),
        }
    }

    /// Acquires the lock for a room, waiting for any other mutating call on
    /// the same room to finish first
    pub async fn acquire(&self, room_id: PrimaryKey) -> OwnedMutexGuard<()> {
        self.evict_idle();

        let mutex = {
            let lock = self.locks.entry(room_id).or_insert_with(|| RoomLock {
                mutex: Arc::new(Mutex::new(())),
                last_used: AtomicCell::new(Instant::now()),
            });

            lock.last_used.store(Instant::now());
            lock.mutex.clone()
            // The map shard guard drops here, before waiting on the mutex
        };

        mutex.lock_owned().await
    }

    /// Drops locks for rooms with no recent activity. A lock that is still
    /// held or queued on is never evicted.
    fn evict_idle(&self) {
        self.locks.retain(|_, lock| {
            Arc::strong_count(&lock.mutex) > 1 || lock.last_used.load().elapsed() < self.idle_ttl
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn serializes_callers_on_the_same_room() {
        let locks = Arc::new(RoomLocks::new(Duration::from_secs(60)));

        let guard = locks.acquire(1).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
            })
        };

        // The contender cannot finish while the guard is held
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn evicts_idle_locks_but_keeps_held_ones() {
        let locks = RoomLocks::new(Duration::from_millis(0));

        let held = locks.acquire(1).await;
        drop(locks.acquire(2).await);
        assert_eq!(locks.len(), 2);

        // Room 2 is idle and gets dropped on the next acquire, room 1 is held
        drop(locks.acquire(3).await);
        assert!(locks.len() <= 2);

        drop(held);
    }
}
