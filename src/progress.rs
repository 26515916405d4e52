use tokio::sync::watch;

/// Consistent view of aggregate session progress.
///
/// `total_bytes` is `None` once any registered task has an unknown size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            completed: 0,
            total: 0,
            bytes_transferred: 0,
            total_bytes: Some(0),
        }
    }
}

/// Aggregates counters across all active workers and pushes every change
/// to subscribers over a watch channel. Slow subscribers see last-value-wins
/// semantics; updates never queue and never stall a worker.
pub struct ProgressAggregator {
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        *self.tx.borrow()
    }

    pub(crate) fn register_task(&self, expected_size: Option<u64>) {
        self.tx.send_modify(|snapshot| {
            snapshot.total += 1;
            match expected_size {
                Some(size) => {
                    if let Some(total) = snapshot.total_bytes.as_mut() {
                        *total += size;
                    }
                }
                None => snapshot.total_bytes = None,
            }
        });
    }

    /// Undo a registration whose task was never enqueued.
    pub(crate) fn deregister_task(&self, expected_size: Option<u64>) {
        self.tx.send_modify(|snapshot| {
            snapshot.total = snapshot.total.saturating_sub(1);
            if let (Some(total), Some(size)) = (snapshot.total_bytes.as_mut(), expected_size) {
                *total = total.saturating_sub(size);
            }
        });
    }

    pub(crate) fn record_bytes(&self, count: u64) {
        self.tx
            .send_modify(|snapshot| snapshot.bytes_transferred += count);
    }

    pub(crate) fn task_completed(&self) {
        self.tx.send_modify(|snapshot| snapshot.completed += 1);
    }
}

impl Default for ProgressAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let aggregator = ProgressAggregator::new();
        aggregator.register_task(Some(100));
        aggregator.register_task(Some(50));
        aggregator.record_bytes(100);
        aggregator.task_completed();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.total_bytes, Some(150));
        assert_eq!(snapshot.bytes_transferred, 100);
        assert_eq!(snapshot.completed, 1);
    }

    #[test]
    fn unknown_size_makes_total_unbounded() {
        let aggregator = ProgressAggregator::new();
        aggregator.register_task(Some(100));
        aggregator.register_task(None);
        aggregator.register_task(Some(25));
        assert_eq!(aggregator.snapshot().total_bytes, None);
    }

    #[test]
    fn subscribers_observe_the_latest_value() {
        let aggregator = ProgressAggregator::new();
        let rx = aggregator.subscribe();
        aggregator.register_task(Some(10));
        aggregator.record_bytes(4);
        aggregator.record_bytes(6);
        let seen = *rx.borrow();
        assert_eq!(seen.bytes_transferred, 10);
        assert_eq!(seen.total, 1);
    }
}
