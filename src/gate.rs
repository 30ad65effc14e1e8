//! Counted lock that shutdown drains before running its stages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, Copy)]
struct GateState {
    holders: usize,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct Gate {
    state: watch::Sender<GateState>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self { state }
    }

    /// Take a hold unless the gate has been closed. Never blocks.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<GateGuard> {
        let acquired = self.state.send_if_modified(|state| {
            if state.closed {
                return false;
            }
            state.holders += 1;
            true
        });
        acquired.then(|| GateGuard {
            gate: Arc::clone(self),
        })
    }

    fn release(&self) {
        self.state.send_modify(|state| {
            debug_assert!(state.holders > 0, "gate released more often than acquired");
            state.holders = state.holders.saturating_sub(1);
        });
    }

    /// Reject all further acquisitions. Existing holders keep their hold.
    pub(crate) fn close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }

    pub(crate) fn holders(&self) -> usize {
        self.state.borrow().holders
    }

    /// Wait until every holder has released, for at most `limit`.
    ///
    /// Returns false when the limit elapsed with holders remaining.
    pub(crate) async fn drain(&self, limit: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let drained = async move { rx.wait_for(|state| state.holders == 0).await.is_ok() };
        match tokio::time::timeout(limit, drained).await {
            Ok(drained) => {
                debug!("shutdown gate drained");
                drained
            }
            Err(_) => {
                warn!(
                    holders = self.holders(),
                    timeout = %humantime::format_duration(limit),
                    "timeout waiting for shutdown lock holders, forcing shutdown"
                );
                false
            }
        }
    }
}

/// A hold on the shutdown gate.
///
/// While any guard is alive, shutdown will not begin its stages (up to the
/// configured timeout). The hold is released on [`GateGuard::unlock`] or drop.
#[must_use = "the shutdown lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<Gate>,
}

impl GateGuard {
    /// Release the hold.
    pub fn unlock(self) {}
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::Gate;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn counts_holders_until_closed() {
        let gate = Arc::new(Gate::new());
        let a = gate.try_acquire().expect("open gate grants a hold");
        let b = gate.try_acquire().expect("holds nest");
        assert_eq!(gate.holders(), 2);

        gate.close();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.holders(), 2);

        a.unlock();
        drop(b);
        assert_eq!(gate.holders(), 0);
    }

    #[tokio::test]
    async fn drain_is_immediate_without_holders() {
        let gate = Gate::new();
        assert!(gate.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_waits_for_release() {
        let gate = Arc::new(Gate::new());
        let guard = gate.try_acquire().expect("hold");
        gate.close();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            guard.unlock();
        });

        let start = std::time::Instant::now();
        assert!(gate.drain(Duration::from_secs(2)).await);
        assert!(start.elapsed() >= Duration::from_millis(25));
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn drain_gives_up_after_limit() {
        let gate = Arc::new(Gate::new());
        let _forgotten = gate.try_acquire().expect("hold");
        gate.close();

        assert!(!gate.drain(Duration::from_millis(20)).await);
        assert_eq!(gate.holders(), 1);
    }
}
