//! One-shot handles handed to shutdown waiters.
//!
//! A [`Notifier`] resolves once, when its stage fires, with a [`Completion`].
//! The waiter performs its cleanup and then resolves the completion, either
//! with [`Completion::done`] or by dropping it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::stage::Stage;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a registration, used to cancel it.
///
/// Unique across every coordinator in the process, so a notifier handed to
/// a coordinator that did not issue it never matches one of its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(pub(crate) u64);

impl NotifierId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NotifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle given to a registered waiter.
///
/// Resolves to `Some(Completion)` when the stage fires and to `None` if the
/// registration was cancelled before shutdown started.
#[derive(Debug)]
pub struct Notifier {
    id: NotifierId,
    stage: Stage,
    rx: Option<oneshot::Receiver<Completion>>,
}

impl Notifier {
    pub(crate) fn channel(id: NotifierId, stage: Stage) -> (oneshot::Sender<Completion>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                id,
                stage,
                rx: Some(rx),
            },
        )
    }

    /// A notifier that has already fired. Nobody waits on its completion.
    pub(crate) fn fulfilled(id: NotifierId, stage: Stage) -> Self {
        let (tx, notifier) = Self::channel(id, stage);
        let _ = tx.send(Completion::detached());
        notifier
    }

    pub fn id(&self) -> NotifierId {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Wait for the stage to fire.
    ///
    /// Yields the completion token at most once; later calls return `None`.
    /// Cancel safe: dropping the future leaves the notifier armed.
    pub async fn notified(&mut self) -> Option<Completion> {
        let rx = self.rx.as_mut()?;
        let received = rx.await.ok();
        self.rx = None;
        received
    }

    /// Non-blocking poll of [`Notifier::notified`].
    pub fn try_notified(&mut self) -> Option<Completion> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(completion) => {
                self.rx = None;
                Some(completion)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }
}

/// Token a waiter resolves once its shutdown work is finished.
///
/// Dropping the token reports completion as well.
#[must_use = "dropping a completion immediately reports the waiter as done"]
pub struct Completion {
    tx: Option<oneshot::Sender<()>>,
}

impl Completion {
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub(crate) fn detached() -> Self {
        Self { tx: None }
    }

    /// Report that this waiter finished its shutdown work.
    pub fn done(self) {}
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("awaited", &self.tx.is_some())
            .finish()
    }
}
