use super::{ContentionPolicy, RangeStore, RangeTxn, check_bounds};
use crate::{Error, Range, RangeId, RangeStatus, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One stored row: the committed state plus the row lock claim transactions
/// hold while they read and advance it.
struct Slot {
    lock: Arc<Mutex<()>>,
    committed: RwLock<Range>,
}

impl Slot {
    fn read(&self) -> Range {
        self.committed.read().clone()
    }
}

struct Inner {
    slots: RwLock<Vec<Arc<Slot>>>,
    next_id: AtomicI64,
    policy: ContentionPolicy,
}

/// A process-local [`RangeStore`].
///
/// Each row carries its own async mutex. `try_lock` plays the role of
/// `FOR UPDATE SKIP LOCKED`; writes are staged in the transaction and only
/// become visible on commit, so a dropped or rolled back transaction leaves
/// the row untouched.
///
/// Cloning is cheap and all clones share the same rows.
#[derive(Clone)]
pub struct MemoryRangeStore {
    inner: Arc<Inner>,
}

impl Default for MemoryRangeStore {
    fn default() -> Self {
        Self::new(ContentionPolicy::default())
    }
}

impl MemoryRangeStore {
    pub fn new(policy: ContentionPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: RwLock::new(Vec::new()),
                next_id: AtomicI64::new(1),
                policy,
            }),
        }
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.inner.policy
    }

    /// Inserts a fresh active range covering `[start, end)`.
    pub fn provision(&self, start: i64, end: i64) -> Result<Range> {
        self.provision_resumed(start, end, 0)
    }

    /// Inserts a range whose cursor resumes at `current`.
    ///
    /// A cursor that already sits at the upper bound is stored as exhausted.
    pub fn provision_resumed(&self, start: i64, end: i64, current: i64) -> Result<Range> {
        check_bounds(start, end, current)?;
        let status = if start + current >= end {
            RangeStatus::Exhausted
        } else {
            RangeStatus::Active
        };
        let range = Range {
            id: RangeId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)),
            start,
            end,
            current,
            status,
            updated_at: Utc::now(),
        };
        self.inner.slots.write().push(Arc::new(Slot {
            lock: Arc::new(Mutex::new(())),
            committed: RwLock::new(range.clone()),
        }));
        Ok(range)
    }

    /// Committed state of every row, ordered by id.
    pub fn snapshot(&self) -> Vec<Range> {
        self.inner.slots.read().iter().map(|s| s.read()).collect()
    }

    pub fn get(&self, id: RangeId) -> Option<Range> {
        self.inner
            .slots
            .read()
            .iter()
            .map(|s| s.read())
            .find(|r| r.id == id)
    }
}

impl RangeStore for MemoryRangeStore {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<MemoryTxn> {
        Ok(MemoryTxn {
            slots: self.inner.slots.read().clone(),
            policy: self.inner.policy,
            held: None,
        })
    }
}

struct Held {
    slot: Arc<Slot>,
    _guard: OwnedMutexGuard<()>,
    staged: Option<Range>,
}

/// Transaction handle for [`MemoryRangeStore`].
pub struct MemoryTxn {
    slots: Vec<Arc<Slot>>,
    policy: ContentionPolicy,
    held: Option<Held>,
}

fn hold(held: &mut Option<Held>, slot: Arc<Slot>, guard: OwnedMutexGuard<()>) -> Range {
    let row = slot.read();
    *held = Some(Held {
        slot,
        _guard: guard,
        staged: None,
    });
    row
}

impl RangeTxn for MemoryTxn {
    async fn select_eligible_range(&mut self, required: i64) -> Result<Option<Range>> {
        if self.held.is_some() {
            return Err(Error::corrupt(
                "select",
                "transaction already holds a range lock",
            ));
        }

        loop {
            let mut contended = None;
            let mut locked_elsewhere = 0_usize;
            for slot in &self.slots {
                let eligible = slot.read().has_capacity(required);
                if !eligible {
                    continue;
                }
                match Arc::clone(&slot.lock).try_lock_owned() {
                    Ok(guard) => {
                        // re-check under the lock, a commit may have landed
                        // between the read and the lock
                        let still_eligible = slot.read().has_capacity(required);
                        if still_eligible {
                            let slot = Arc::clone(slot);
                            return Ok(Some(hold(&mut self.held, slot, guard)));
                        }
                    }
                    Err(_) => {
                        locked_elsewhere += 1;
                        if contended.is_none() {
                            contended = Some(Arc::clone(slot));
                        }
                    }
                }
            }

            let Some(slot) = contended else {
                return Ok(None);
            };
            // only a sole locked candidate is waited on
            if self.policy == ContentionPolicy::Skip || locked_elsewhere > 1 {
                return Ok(None);
            }

            let guard = Arc::clone(&slot.lock).lock_owned().await;
            let eligible = slot.read().has_capacity(required);
            if eligible {
                return Ok(Some(hold(&mut self.held, slot, guard)));
            }
            // the holder drained it, rescan
        }
    }

    async fn advance_range(&mut self, id: RangeId, delta: i64) -> Result<Range> {
        let held = self
            .held
            .as_mut()
            .ok_or_else(|| Error::corrupt("advance", "no range locked by this transaction"))?;
        let base = match &held.staged {
            Some(staged) => staged.clone(),
            None => held.slot.read(),
        };
        if base.id != id {
            return Err(Error::corrupt(
                "advance",
                format!("range {id} is not the range locked by this transaction"),
            ));
        }
        let next = base.advanced(delta, Utc::now()).ok_or_else(|| {
            Error::corrupt(
                "advance",
                format!(
                    "range {id} cannot advance by {delta} (remaining {})",
                    base.remaining()
                ),
            )
        })?;
        held.staged = Some(next.clone());
        Ok(next)
    }

    async fn commit(mut self) -> Result<()> {
        if let Some(held) = self.held.take() {
            if let Some(staged) = held.staged {
                *held.slot.committed.write() = staged;
            }
            // row lock released when `held` drops
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
