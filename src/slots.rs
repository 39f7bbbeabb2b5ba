//! Per-account concurrency admission.
//!
//! Each account has a configured cap; a request holds exactly one slot for
//! its lifetime. Release is idempotent and runs on drop, so a slot cannot
//! leak on any termination path (success, client disconnect, panic,
//! upstream error).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWaitError {
    /// The wait queue is already at `max_waiters`.
    Saturated,
    /// The deadline elapsed before a slot freed up.
    Timeout,
}

#[derive(Debug)]
struct AccountSlots {
    in_use: AtomicU32,
    waiters: AtomicU32,
    freed: Notify,
}

/// One unit of admitted concurrency on an account. Decrements exactly once,
/// on explicit `release()` or on drop, whichever comes first.
#[derive(Debug)]
pub struct SlotToken {
    slots: Arc<AccountSlots>,
    released: AtomicBool,
}

impl SlotToken {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.slots.in_use.fetch_sub(1, Ordering::AcqRel);
        self.slots.freed.notify_one();
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
pub struct SlotAllocator {
    accounts: DashMap<i64, Arc<AccountSlots>>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, account_id: i64) -> Arc<AccountSlots> {
        self.accounts
            .entry(account_id)
            .or_insert_with(|| {
                Arc::new(AccountSlots {
                    in_use: AtomicU32::new(0),
                    waiters: AtomicU32::new(0),
                    freed: Notify::new(),
                })
            })
            .clone()
    }

    /// Non-blocking acquire. CAS loop keeps `in_use <= cap` under races.
    pub fn try_acquire(&self, account_id: i64, cap: u32) -> Option<SlotToken> {
        let slots = self.slots(account_id);
        let mut current = slots.in_use.load(Ordering::Acquire);
        loop {
            if current >= cap {
                return None;
            }
            match slots.in_use.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotToken {
                        slots,
                        released: AtomicBool::new(false),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Acquire, waiting up to `timeout` behind at most `max_waiters` peers.
    pub async fn acquire_with_wait(
        &self,
        account_id: i64,
        cap: u32,
        timeout: Duration,
        max_waiters: u32,
    ) -> Result<SlotToken, SlotWaitError> {
        if let Some(token) = self.try_acquire(account_id, cap) {
            return Ok(token);
        }

        let slots = self.slots(account_id);
        if slots
            .waiters
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                (w < max_waiters).then_some(w + 1)
            })
            .is_err()
        {
            return Err(SlotWaitError::Saturated);
        }
        let _waiter = WaiterGuard(slots.clone());

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Arm the wakeup before re-checking, so a release between the
            // check and the await is not lost.
            let freed = slots.freed.notified();
            if let Some(token) = self.try_acquire(account_id, cap) {
                return Ok(token);
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(SlotWaitError::Timeout);
            }
        }
    }

    pub fn in_use_count(&self, account_id: i64) -> u32 {
        self.accounts
            .get(&account_id)
            .map(|s| s.in_use.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn waiting_count(&self, account_id: i64) -> u32 {
        self.accounts
            .get(&account_id)
            .map(|s| s.waiters.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Load as a percentage of the cap. 100.0 means fully occupied.
    pub fn load_rate(&self, account_id: i64, cap: u32) -> f64 {
        let cap = cap.max(1);
        self.in_use_count(account_id) as f64 * 100.0 / cap as f64
    }

    /// Batch fetch used by the scheduler's load-aware layer.
    pub fn load_rates(&self, accounts: &[(i64, u32)]) -> HashMap<i64, f64> {
        accounts
            .iter()
            .map(|&(id, cap)| (id, self.load_rate(id, cap)))
            .collect()
    }
}

struct WaiterGuard(Arc<AccountSlots>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_up_to_cap_only() {
        let alloc = SlotAllocator::new();
        let t1 = alloc.try_acquire(1, 2).unwrap();
        let _t2 = alloc.try_acquire(1, 2).unwrap();
        assert!(alloc.try_acquire(1, 2).is_none());
        assert_eq!(alloc.in_use_count(1), 2);

        t1.release();
        assert_eq!(alloc.in_use_count(1), 1);
        assert!(alloc.try_acquire(1, 2).is_some());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let alloc = SlotAllocator::new();
        let t = alloc.try_acquire(1, 1).unwrap();
        t.release();
        t.release();
        drop(t);
        assert_eq!(alloc.in_use_count(1), 0);
    }

    #[tokio::test]
    async fn drop_releases_the_slot() {
        let alloc = SlotAllocator::new();
        {
            let _t = alloc.try_acquire(1, 1).unwrap();
            assert_eq!(alloc.in_use_count(1), 1);
        }
        assert_eq!(alloc.in_use_count(1), 0);
    }

    #[tokio::test]
    async fn wait_queue_saturates() {
        let alloc = Arc::new(SlotAllocator::new());
        let _held = alloc.try_acquire(1, 1).unwrap();

        // One waiter parks; queue cap 1 means the next is refused.
        let a = alloc.clone();
        let parked = tokio::spawn(async move {
            a.acquire_with_wait(1, 1, Duration::from_secs(5), 1).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alloc.waiting_count(1), 1);

        let refused = alloc
            .acquire_with_wait(1, 1, Duration::from_millis(50), 1)
            .await;
        assert_eq!(refused.unwrap_err(), SlotWaitError::Saturated);

        drop(_held);
        let token = parked.await.unwrap().unwrap();
        drop(token);
        assert_eq!(alloc.in_use_count(1), 0);
        assert_eq!(alloc.waiting_count(1), 0);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let alloc = SlotAllocator::new();
        let _held = alloc.try_acquire(1, 1).unwrap();
        let err = alloc
            .acquire_with_wait(1, 1, Duration::from_millis(30), 4)
            .await
            .unwrap_err();
        assert_eq!(err, SlotWaitError::Timeout);
        assert_eq!(alloc.waiting_count(1), 0);
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_cap() {
        let alloc = Arc::new(SlotAllocator::new());
        let cap = 4u32;
        let mut handles = Vec::new();
        for _ in 0..64 {
            let a = alloc.clone();
            handles.push(tokio::spawn(async move {
                if let Some(t) = a.try_acquire(9, cap) {
                    assert!(a.in_use_count(9) <= cap);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    drop(t);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Quiescence: everything released.
        assert_eq!(alloc.in_use_count(9), 0);
    }

    #[tokio::test]
    async fn load_rates_reflect_in_use() {
        let alloc = SlotAllocator::new();
        let _a = alloc.try_acquire(1, 4).unwrap();
        let _b = alloc.try_acquire(1, 4).unwrap();
        let rates = alloc.load_rates(&[(1, 4), (2, 2)]);
        assert_eq!(rates[&1], 50.0);
        assert_eq!(rates[&2], 0.0);
    }
}
