use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

/// Wakeup channel between job producers and the local worker. A sequence
/// counter makes wakeups level-triggered so a signal sent between `seq()`
/// and `wait_for_change()` is never lost.
#[derive(Default)]
pub(crate) struct QueueSignals {
    seq: AtomicU64,
    notify: Notify,
}

impl QueueSignals {
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn wake(&self) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Wait until the sequence advances past `seen`, or the timeout elapses.
    pub async fn wait_for_change(&self, seen: u64, timeout: Duration) {
        if self.seq() != seen {
            return;
        }
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.seq() != seen {
                    return;
                }
                notified.await;
                if self.seq() != seen {
                    return;
                }
            }
        })
        .await;
    }
}
