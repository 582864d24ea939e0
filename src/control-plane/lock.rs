use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::warn;
use tokio::sync::OwnedMutexGuard;

use arkctrl::schema::LockStatus;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
struct Held {
    reason: String,
    acquired_at: DateTime<Utc>,
}

/// Process-wide exclusive update lock. Acquisition is FIFO (tokio's mutex is
/// fair). While held, an advisory sentinel file exists under the base
/// directory so generated start scripts can observe the lock from outside
/// the process.
pub struct UpdateLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    state: Arc<Mutex<Option<Held>>>,
    sentinel: PathBuf,
    /// Guard slot for the manual lock endpoints.
    manual: Mutex<Option<UpdateLockGuard>>,
}

impl UpdateLock {
    pub fn new(sentinel: PathBuf) -> UpdateLock {
        // A sentinel left behind by a crashed process would deadlock every
        // generated script; the in-process lock is authoritative.
        if sentinel.exists() {
            warn!("removing stale update lock sentinel at {}", sentinel.display());
            let _ = std::fs::remove_file(&sentinel);
        }
        UpdateLock {
            inner: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(Mutex::new(None)),
            sentinel,
            manual: Mutex::new(None),
        }
    }

    /// Waits in FIFO order until the lock is free.
    pub async fn acquire(&self, reason: &str) -> UpdateLockGuard {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        self.on_acquired(reason);
        UpdateLockGuard {
            _guard: guard,
            state: Arc::clone(&self.state),
            sentinel: self.sentinel.clone(),
        }
    }

    /// Non-blocking variant used by the manual lock endpoint.
    pub fn try_acquire(&self, reason: &str) -> Result<UpdateLockGuard> {
        match Arc::clone(&self.inner).try_lock_owned() {
            Ok(guard) => {
                self.on_acquired(reason);
                Ok(UpdateLockGuard {
                    _guard: guard,
                    state: Arc::clone(&self.state),
                    sentinel: self.sentinel.clone(),
                })
            }
            Err(_) => Err(Error::LockContended),
        }
    }

    pub fn status(&self) -> LockStatus {
        match self.state.lock().unwrap().as_ref() {
            Some(held) => LockStatus {
                locked: true,
                reason: Some(held.reason.clone()),
                acquired_at: Some(held.acquired_at),
            },
            None => LockStatus {
                locked: false,
                reason: None,
                acquired_at: None,
            },
        }
    }

    /// Manually take the lock (`POST /api/lock-status`).
    pub fn hold_manual(&self, reason: &str) -> Result<()> {
        let guard = self.try_acquire(reason)?;
        *self.manual.lock().unwrap() = Some(guard);
        Ok(())
    }

    /// Release a manually-held lock (`DELETE /api/lock-status`).
    pub fn release_manual(&self) -> Result<()> {
        match self.manual.lock().unwrap().take() {
            Some(_guard) => Ok(()),
            None => Err(Error::Precondition(
                "update lock is not manually held".to_owned(),
            )),
        }
    }

    fn on_acquired(&self, reason: &str) {
        *self.state.lock().unwrap() = Some(Held {
            reason: reason.to_owned(),
            acquired_at: Utc::now(),
        });
        if let Err(e) = std::fs::write(&self.sentinel, reason) {
            warn!("failed to write update lock sentinel: {:?}", e);
        }
    }
}

pub struct UpdateLockGuard {
    _guard: OwnedMutexGuard<()>,
    state: Arc<Mutex<Option<Held>>>,
    sentinel: PathBuf,
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        *self.state.lock().unwrap() = None;
        if let Err(e) = std::fs::remove_file(&self.sentinel) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove update lock sentinel: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_sentinel() -> PathBuf {
        std::env::temp_dir().join(format!("arkctrl-lock-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn status_tracks_guard_lifetime() {
        let lock = UpdateLock::new(temp_sentinel());
        assert!(!lock.status().locked);

        let guard = lock.acquire("installing").await;
        let status = lock.status();
        assert!(status.locked);
        assert_eq!(status.reason.as_deref(), Some("installing"));
        assert!(lock.sentinel.exists());

        drop(guard);
        assert!(!lock.status().locked);
        assert!(!lock.sentinel.exists());
    }

    #[tokio::test]
    async fn try_acquire_reports_contention() {
        let lock = UpdateLock::new(temp_sentinel());
        let _guard = lock.acquire("first").await;
        assert!(matches!(
            lock.try_acquire("second"),
            Err(Error::LockContended)
        ));
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let lock = Arc::new(UpdateLock::new(temp_sentinel()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = lock.acquire("holder").await;

        // Stagger arrival so the queue order is deterministic
        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire("waiter").await;
                order.lock().unwrap().push(i);
            }));
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn manual_hold_and_release() {
        let lock = UpdateLock::new(temp_sentinel());
        lock.hold_manual("maintenance").unwrap();
        assert!(lock.status().locked);
        assert!(matches!(lock.hold_manual("again"), Err(Error::LockContended)));
        lock.release_manual().unwrap();
        assert!(!lock.status().locked);
        assert!(matches!(lock.release_manual(), Err(Error::Precondition(_))));
    }
}
