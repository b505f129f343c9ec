//! At-most-one in-flight operation, shared by every concurrent caller.
//!
//! The first caller installs a `watch` receiver under the lock and spawns the
//! work once the lock is released; later callers clone that receiver and wait.
//! The work runs on its own task, so dropping a waiter never cancels the
//! attempt the others observe.
//!
//! [`SingleFlight::exclusive`] holds the same slot for an inline operation.
//! Callers arriving meanwhile do not share its result: they wait it out and
//! then start (or join) a regular operation.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::Level;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::logging::log_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlightError {
    #[error("no tokio runtime is running on this thread")] NoRuntime,
    #[error("in-flight operation ended without an outcome")] Abandoned,
}

struct Flight<T> {
    id: u64,
    exclusive: bool,
    rx: watch::Receiver<Option<T>>,
}

struct Slot<T> {
    id: u64,
    tx: watch::Sender<Option<T>>,
    rx: watch::Receiver<Option<T>>,
}

struct State<T> {
    next_id: u64,
    current: Option<Flight<T>>,
}

impl<T> State<T> {
    fn install(&mut self, exclusive: bool) -> Slot<T> {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = watch::channel(None);
        self.current = Some(Flight { id, exclusive, rx: rx.clone() });
        Slot { id, tx, rx }
    }
}

enum Entry<T> {
    Join(watch::Receiver<Option<T>>),
    WaitOut(watch::Receiver<Option<T>>),
    Start(Slot<T>, Handle),
}

pub struct SingleFlight<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self { state: Mutex::new(State { next_id: 0, current: None }) }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn in_flight(&self) -> bool {
        self.lock().current.is_some()
    }

    /// Join the running operation, or start `work` as the new one.
    ///
    /// Fails with [`FlightError::NoRuntime`] outside a tokio runtime, leaving
    /// the slot untouched, and with [`FlightError::Abandoned`] when the
    /// operation's task died before publishing an outcome.
    pub async fn run<F, Fut>(self: &Arc<Self>, work: F) -> Result<T, FlightError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (slot, handle) = loop {
            let entry = {
                let mut state = self.lock();
                match &state.current {
                    Some(flight) if flight.exclusive => Entry::WaitOut(flight.rx.clone()),
                    Some(flight) => Entry::Join(flight.rx.clone()),
                    None => {
                        let handle = Handle::try_current().map_err(|_| FlightError::NoRuntime)?;
                        Entry::Start(state.install(false), handle)
                    }
                }
            };
            match entry {
                Entry::WaitOut(rx) => {
                    let _ = wait(rx).await;
                }
                Entry::Join(rx) => {
                    log_event(Level::Debug, "PRV-0101", "provision.flight", "joined in-flight attempt", None);
                    return wait(rx).await.ok_or(FlightError::Abandoned);
                }
                Entry::Start(slot, handle) => break (slot, handle),
            }
        };

        // The lock is released here: a panic while starting the work unwinds
        // through `Settle::drop`, which needs to take it again.
        let Slot { id, tx, rx } = slot;
        let settle = Settle { owner: Arc::clone(self), id, tx: Some(tx) };
        let fut = work();
        handle.spawn(async move {
            let outcome = fut.await;
            settle.publish(outcome);
        });
        wait(rx).await.ok_or(FlightError::Abandoned)
    }

    /// Run `op` inline while holding the slot, once nothing else is in flight.
    pub async fn exclusive<R, F, Fut>(self: &Arc<Self>, op: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let slot = loop {
            let busy = {
                let mut state = self.lock();
                match &state.current {
                    Some(flight) => flight.rx.clone(),
                    None => break state.install(true),
                }
            };
            let _ = wait(busy).await;
        };
        let settle = Settle { owner: Arc::clone(self), id: slot.id, tx: Some(slot.tx) };
        let result = op().await;
        // Dropping without an outcome releases anyone waiting it out.
        drop(settle);
        result
    }
}

async fn wait<T: Clone>(mut rx: watch::Receiver<Option<T>>) -> Option<T> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    }
}

/// Clears the slot and publishes exactly once. If the attempt task unwinds,
/// `Drop` still clears the slot so the next caller can start over.
struct Settle<T> {
    owner: Arc<SingleFlight<T>>,
    id: u64,
    tx: Option<watch::Sender<Option<T>>>,
}

impl<T> Settle<T> {
    fn publish(mut self, outcome: T) {
        self.finish(Some(outcome));
    }

    fn finish(&mut self, outcome: Option<T>) {
        let Some(tx) = self.tx.take() else { return };
        let mut state = self.owner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.current.as_ref().is_some_and(|flight| flight.id == self.id) {
            state.current = None;
        }
        if let Some(outcome) = outcome {
            tx.send_replace(Some(outcome));
        }
    }
}

impl<T> Drop for Settle<T> {
    fn drop(&mut self) {
        self.finish(None);
    }
}
