//! Per-stage lists of pending waiters.

use std::any::Any;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::notifier::{Completion, Notifier, NotifierId};
use crate::stage::Stage;

pub(crate) struct Waiter {
    pub(crate) id: NotifierId,
    pub(crate) tx: oneshot::Sender<Completion>,
}

pub(crate) struct FunctionWaiter {
    pub(crate) id: NotifierId,
    pub(crate) internal: oneshot::Sender<Completion>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct StageQueue {
    waiters: Vec<Waiter>,
    functions: Vec<FunctionWaiter>,
}

#[derive(Default)]
struct RegistryState {
    sealed: bool,
    stages: [StageQueue; 3],
}

/// Everything registered for one stage at the moment it fired.
#[derive(Default)]
pub(crate) struct StageBatch {
    pub(crate) waiters: Vec<Waiter>,
    pub(crate) functions: Vec<FunctionWaiter>,
}

#[derive(Default)]
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Nothing panics while holding the lock, but a poisoned list is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, stage: Stage) -> Notifier {
        let id = NotifierId::next();
        let mut state = self.lock();
        if state.sealed {
            drop(state);
            debug!(%stage, %id, "late registration; notifier fires immediately");
            return Notifier::fulfilled(id, stage);
        }
        let (tx, notifier) = Notifier::channel(id, stage);
        state.stages[stage.index()].waiters.push(Waiter { id, tx });
        drop(state);
        debug!(%stage, %id, "registered shutdown waiter");
        notifier
    }

    /// Register `callback(arg)` to run when `stage` fires.
    ///
    /// Must be called from within a tokio runtime; the callback task is
    /// spawned immediately and parked until the stage fires or the
    /// registration is cancelled.
    pub(crate) fn register_func<F, Fut, T>(&self, stage: Stage, callback: F, arg: T) -> Notifier
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        let id = NotifierId::next();
        let (client_tx, client) = Notifier::channel(id, stage);
        let (internal_tx, internal_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_function(
            stage,
            id,
            internal_rx,
            client_tx,
            cancel.clone(),
            callback,
            arg,
        ));

        let mut state = self.lock();
        if state.sealed {
            drop(state);
            debug!(%stage, %id, "late function registration; running immediately");
            let _ = internal_tx.send(Completion::detached());
            return client;
        }
        state.stages[stage.index()].functions.push(FunctionWaiter {
            id,
            internal: internal_tx,
            cancel,
        });
        drop(state);
        debug!(%stage, %id, "registered shutdown function");
        client
    }

    /// Remove a registration by identity.
    ///
    /// Returns false when it is no longer pending or the registry is sealed.
    pub(crate) fn cancel(&self, id: NotifierId) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }
        for queue in &mut state.stages {
            if let Some(pos) = queue.waiters.iter().position(|w| w.id == id) {
                // Dropping the sender resolves the notifier to `None`.
                queue.waiters.remove(pos);
                debug!(%id, "cancelled shutdown waiter");
                return true;
            }
            if let Some(pos) = queue.functions.iter().position(|f| f.id == id) {
                let function = queue.functions.remove(pos);
                function.cancel.cancel();
                debug!(%id, "cancelled shutdown function");
                return true;
            }
        }
        false
    }

    /// Turn every later registration into an already fired one and refuse
    /// cancellation. Irreversible.
    pub(crate) fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Snapshot and clear the lists of `stage`.
    pub(crate) fn take(&self, stage: Stage) -> StageBatch {
        let mut state = self.lock();
        let queue = &mut state.stages[stage.index()];
        StageBatch {
            waiters: std::mem::take(&mut queue.waiters),
            functions: std::mem::take(&mut queue.functions),
        }
    }

    /// Drop anything left in the lists. The seal stays in place.
    pub(crate) fn reset(&self) {
        let mut state = self.lock();
        for queue in &mut state.stages {
            *queue = StageQueue::default();
        }
    }

    /// Pending (plain, function) registrations for `stage`.
    pub(crate) fn pending(&self, stage: Stage) -> (usize, usize) {
        let state = self.lock();
        let queue = &state.stages[stage.index()];
        (queue.waiters.len(), queue.functions.len())
    }
}

async fn run_function<F, Fut, T>(
    stage: Stage,
    id: NotifierId,
    internal: oneshot::Receiver<Completion>,
    client: oneshot::Sender<Completion>,
    cancel: CancellationToken,
    callback: F,
    arg: T,
) where
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    T: Send + 'static,
{
    let completion = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        fired = internal => match fired {
            Ok(completion) => completion,
            // Registry dropped the entry without firing it.
            Err(_) => return,
        },
    };

    let _ = client.send(Completion::detached());

    // Run on its own task so a panic, synchronous or not, stops at the JoinHandle.
    let outcome = tokio::spawn(async move { callback(arg).await }).await;
    if let Err(err) = outcome {
        if err.is_panic() {
            let payload = err.into_panic();
            error!(
                %stage,
                %id,
                panic = panic_message(payload.as_ref()),
                "panic in shutdown function"
            );
        } else {
            error!(%stage, %id, error = %err, "shutdown function was aborted");
        }
    }
    completion.done();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
