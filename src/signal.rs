//! Binds OS termination signals to the shutdown sequence.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::config::TermSignal;
use crate::coordinator::Coordinator;
use crate::error::{Error, Result};

impl From<TermSignal> for SignalKind {
    fn from(sig: TermSignal) -> Self {
        match sig {
            TermSignal::Interrupt => SignalKind::interrupt(),
            TermSignal::Terminate => SignalKind::terminate(),
            TermSignal::Hangup => SignalKind::hangup(),
            TermSignal::Quit => SignalKind::quit(),
            TermSignal::UserDefined1 => SignalKind::user_defined1(),
            TermSignal::UserDefined2 => SignalKind::user_defined2(),
        }
    }
}

impl Coordinator {
    /// Shut down and exit with `exit_code` when any of `signals` arrives.
    ///
    /// Install once per signal set, from within a tokio runtime. Typical use
    /// is `on_signal(0, &[TermSignal::Interrupt, TermSignal::Terminate])`.
    pub fn on_signal(&self, exit_code: i32, signals: &[TermSignal]) -> Result<JoinHandle<()>> {
        self.on_signal_with(signals, move || {
            info!(code = exit_code, "exiting");
            std::process::exit(exit_code)
        })
    }

    /// Like [`Coordinator::on_signal`], but runs `then` after the shutdown
    /// sequence instead of exiting the process.
    ///
    /// Repeated deliveries while shutdown runs are absorbed; the sequence
    /// itself runs at most once. The signal listeners end as soon as the
    /// first delivery arrives.
    pub fn on_signal_with<F>(&self, signals: &[TermSignal], then: F) -> Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = Listeners::install(signals)?;
        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            let Some(sig) = listeners.first().await else {
                warn!("signal listeners ended before any signal arrived");
                return;
            };
            info!(signal = sig.name(), "received signal; initiating shutdown");
            coordinator.shutdown().await;
            then();
        }))
    }
}

/// One task per signal, fanned into a single channel.
struct Listeners {
    tasks: JoinSet<()>,
    rx: mpsc::Receiver<TermSignal>,
}

impl Listeners {
    fn install(signals: &[TermSignal]) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<TermSignal>(1);
        // Dropping the set on an early return aborts what was already spawned.
        let mut tasks = JoinSet::new();
        for &sig in signals {
            let mut stream = signal(sig.into()).map_err(|source| Error::Signal {
                signal: sig.name().to_string(),
                source,
            })?;
            let tx = tx.clone();
            tasks.spawn(async move {
                while stream.recv().await.is_some() {
                    // Full means a delivery is already queued.
                    let _ = tx.try_send(sig);
                }
            });
        }
        Ok(Self { tasks, rx })
    }

    /// Wait for the first delivery, then stop every listener.
    async fn first(&mut self) -> Option<TermSignal> {
        let received = self.rx.recv().await;
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        received
    }
}
