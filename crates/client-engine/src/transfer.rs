//! Process-wide upload concurrency budget.
//!
//! Large files benefit from multi-part parallelism, but uncoordinated
//! per-upload parallelism saturates the uplink and starves the rest of the
//! batch. Every upload asks the coordinator for an integer number of transfer
//! slots based on its file size; the semaphore guarantees the sum of
//! in-flight slots never exceeds the budget.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const MIB: u64 = 1024 * 1024;

#[derive(Debug)]
pub(crate) struct TransferCoordinator {
    budget: u32,
    multi_part: bool,
    sem: Arc<Semaphore>,
}

/// Slots held for one in-flight upload; returned to the budget on drop.
#[derive(Debug)]
pub(crate) struct TransferSlots {
    _permit: OwnedSemaphorePermit,
    pub(crate) slots: u32,
}

impl TransferCoordinator {
    pub(crate) fn new(budget: usize, multi_part: bool) -> Self {
        let budget = budget.clamp(1, u32::MAX as usize) as u32;
        Self {
            budget,
            multi_part,
            sem: Arc::new(Semaphore::new(budget as usize)),
        }
    }

    /// Slot count for a file of `size` bytes, capped by the global budget.
    pub(crate) fn slots_for(&self, size: u64) -> u32 {
        if !self.multi_part {
            return 1;
        }
        let wanted = if size < 64 * MIB {
            1
        } else if size < 256 * MIB {
            2
        } else if size < 1024 * MIB {
            4
        } else {
            8
        };
        wanted.min(self.budget)
    }

    /// Block until `slots_for(size)` slots are free, then take them.
    pub(crate) async fn acquire(&self, size: u64) -> anyhow::Result<TransferSlots> {
        let slots = self.slots_for(size);
        let permit = self
            .sem
            .clone()
            .acquire_many_owned(slots)
            .await
            .map_err(|_| anyhow::anyhow!("transfer budget semaphore closed"))?;
        Ok(TransferSlots {
            _permit: permit,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_counts_follow_size_buckets() {
        let coord = TransferCoordinator::new(16, true);
        assert_eq!(coord.slots_for(0), 1);
        assert_eq!(coord.slots_for(64 * MIB - 1), 1);
        assert_eq!(coord.slots_for(64 * MIB), 2);
        assert_eq!(coord.slots_for(256 * MIB), 4);
        assert_eq!(coord.slots_for(1024 * MIB), 8);
    }

    #[test]
    fn single_part_mode_always_gets_one_slot() {
        let coord = TransferCoordinator::new(16, false);
        assert_eq!(coord.slots_for(4096 * MIB), 1);
    }

    #[test]
    fn budget_caps_the_bucket_value() {
        let coord = TransferCoordinator::new(2, true);
        assert_eq!(coord.slots_for(1024 * MIB), 2);
    }

    #[tokio::test]
    async fn in_flight_slots_never_exceed_the_budget() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let coord = Arc::new(TransferCoordinator::new(4, true));
        let in_flight = Arc::new(AtomicI64::new(0));
        let peak = Arc::new(AtomicI64::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..12 {
            let coord = coord.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let held = coord.acquire(300 * MIB).await.unwrap();
                let now = in_flight.fetch_add(held.slots as i64, Ordering::SeqCst)
                    + held.slots as i64;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(held.slots as i64, Ordering::SeqCst);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn dropping_the_handle_returns_slots() {
        let coord = TransferCoordinator::new(4, true);
        let held = coord.acquire(2048 * MIB).await.unwrap();
        assert_eq!(held.slots, 4);
        drop(held);
        let held = coord.acquire(2048 * MIB).await.unwrap();
        assert_eq!(held.slots, 4);
    }
}
