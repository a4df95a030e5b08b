//! Commit lock manager.
//!
//! One execution at a time may run for a (repository, commit). The lock is a
//! row in the lock store carrying the owning execution's trace id; it goes
//! stale when not refreshed within the timeout and may then be taken over.

use cbuild_config::system::MAX_LOCK_TIMEOUT_SECONDS;
use cbuild_core::clock::Clock;
use cbuild_core::id::{LockId, TraceId};
use cbuild_core::store::{AcquireOutcome, LockRecord, LockStore};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};

pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    stale_after_secs: u64,
}

impl LockManager {
    /// `stale_after_secs` is capped at [`MAX_LOCK_TIMEOUT_SECONDS`].
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, stale_after_secs: u64) -> Self {
        Self {
            store,
            clock,
            stale_after_secs: stale_after_secs.min(MAX_LOCK_TIMEOUT_SECONDS),
        }
    }

    pub fn stale_after_secs(&self) -> u64 {
        self.stale_after_secs
    }

    /// Take the lock for `owner`. Returns the stale lock that was overwritten, if any.
    pub async fn acquire(&self, id: &LockId, owner: &TraceId) -> SchedulerResult<Option<LockRecord>> {
        let now = self.clock.now();
        let record = LockRecord {
            id: id.clone(),
            owner: *owner,
            last_update: now,
        };
        let stale_before = now - Duration::seconds(self.stale_after_secs as i64);

        debug!(lock = %id, owner = %owner, "Acquiring lock");
        match self
            .store
            .acquire(&record, stale_before)
            .await
            .map_err(SchedulerError::Store)?
        {
            AcquireOutcome::Acquired { replaced } => {
                if let Some(previous) = &replaced {
                    warn!(
                        lock = %id,
                        previous_owner = %previous.owner,
                        last_update = %previous.last_update,
                        "Overwrote lock that was not cleaned up"
                    );
                }
                info!(lock = %id, owner = %owner, "Lock acquired");
                Ok(replaced)
            }
            AcquireOutcome::Held(existing) => {
                info!(lock = %id, owner = %existing.owner, "Lock already held");
                Err(SchedulerError::LockHeld {
                    lock_id: id.clone(),
                    owner: existing.owner,
                    stale_after_secs: self.stale_after_secs,
                })
            }
        }
    }

    /// Touch the lock. Fails with `LockLost` when `owner` no longer holds it.
    pub async fn refresh(&self, id: &LockId, owner: &TraceId) -> SchedulerResult<()> {
        let held = self
            .store
            .refresh(id, owner, self.clock.now())
            .await
            .map_err(SchedulerError::Store)?;
        if held {
            Ok(())
        } else {
            Err(SchedulerError::LockLost { lock_id: id.clone() })
        }
    }

    /// Release the lock. Failures are logged, never returned.
    pub async fn release(&self, id: &LockId, owner: &TraceId) {
        match self.store.release(id, owner).await {
            Ok(true) => info!(lock = %id, "Lock released"),
            Ok(false) => warn!(lock = %id, owner = %owner, "Lock was not held at release"),
            Err(e) => error!(lock = %id, error = %e, "Failed to release lock"),
        }
    }
}
