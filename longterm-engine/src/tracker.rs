//! Join barrier over a batch of independently dispatched mutations.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use longterm_protocol::action::{Envelope, Signal, SignalKind};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::source::ActionStore;

/// Caller-owned loading indicator toggled for the duration of a batch.
#[derive(Debug)]
pub struct BusyFlag {
    tx: watch::Sender<bool>,
}

impl Default for BusyFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn is_busy(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    fn set(&self, busy: bool) {
        self.tx.send_replace(busy);
    }
}

/// One mutation plus the signals that settle it.
#[derive(Debug, Clone)]
pub struct BatchItem<A> {
    pub mutation: A,
    pub on_success: SignalKind,
    pub on_fail: SignalKind,
}

impl<A> BatchItem<A> {
    pub fn new(mutation: A, on_success: SignalKind, on_fail: SignalKind) -> Self {
        Self {
            mutation,
            on_success,
            on_fail,
        }
    }
}

/// Why a batch item did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemFailure {
    #[error("store reported {kind}")]
    Signalled {
        kind: SignalKind,
        error: Option<String>,
    },
    #[error("no outcome signal within {0:?}")]
    TimedOut(Duration),
    #[error("signal stream closed before an outcome arrived")]
    SignalsClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem<A> {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub correlation_id: Uuid,
    pub mutation: A,
    pub failure: ItemFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome<A> {
    Succeeded { items: usize },
    Failed { items: usize, failed: Vec<FailedItem<A>> },
}

impl<A> BatchOutcome<A> {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Succeeded { .. })
    }
}

struct Tracked<A> {
    correlation_id: Uuid,
    item: BatchItem<A>,
    result: Option<Result<(), ItemFailure>>,
}

/// Dispatches batches through an [`ActionStore`] and waits for every outcome.
pub struct BatchMutationTracker<A> {
    store: Arc<dyn ActionStore<A>>,
    item_timeout: Duration,
}

impl<A> Clone for BatchMutationTracker<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            item_timeout: self.item_timeout,
        }
    }
}

impl<A> BatchMutationTracker<A>
where
    A: Clone + Debug + Send + 'static,
{
    pub fn new(store: Arc<dyn ActionStore<A>>, item_timeout: Duration) -> Self {
        Self {
            store,
            item_timeout,
        }
    }

    /// Runs one batch to completion.
    ///
    /// `busy` is raised before the first dispatch and lowered once, after every
    /// item has resolved. Exactly one of the callbacks is invoked and the
    /// actions it returns are dispatched. Items still silent after the
    /// configured timeout resolve as [`ItemFailure::TimedOut`].
    pub async fn run<S, F>(
        &self,
        batch: Vec<BatchItem<A>>,
        busy: &BusyFlag,
        on_all_succeeded: S,
        on_any_failed: F,
    ) -> BatchOutcome<A>
    where
        S: FnOnce() -> Vec<A>,
        F: FnOnce(&[FailedItem<A>]) -> Vec<A>,
    {
        busy.set(true);
        let batch_id = Uuid::new_v4();
        let items = batch.len();

        // Subscribe first so that outcomes of synchronous stores are not missed.
        let mut signals = self.store.signals();

        let mut tracked: Vec<Tracked<A>> = batch
            .into_iter()
            .map(|item| Tracked {
                correlation_id: Uuid::new_v4(),
                item,
                result: None,
            })
            .collect();
        let mut pending: HashMap<Uuid, usize> = tracked
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.correlation_id, index))
            .collect();

        info!(batch = %batch_id, items, "dispatching batch");
        for index in 0..tracked.len() {
            self.store.dispatch(Envelope::correlated(
                tracked[index].correlation_id,
                tracked[index].item.mutation.clone(),
            ));
            // Stores may answer inside `dispatch`; read those outcomes before
            // the next dispatch so a large batch cannot overrun the receiver.
            loop {
                match signals.try_recv() {
                    Ok(signal) => record(&mut tracked, &mut pending, signal, batch_id),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(batch = %batch_id, skipped, "signal receiver lagged");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }

        let deadline = Instant::now() + self.item_timeout;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, signals.recv()).await {
                Ok(Ok(signal)) => record(&mut tracked, &mut pending, signal, batch_id),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(batch = %batch_id, skipped, "signal receiver lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    warn!(batch = %batch_id, pending = pending.len(), "signal stream closed");
                    fail_pending(&mut tracked, &mut pending, ItemFailure::SignalsClosed);
                }
                Err(_) => {
                    warn!(batch = %batch_id, pending = pending.len(), "batch items timed out");
                    let timeout = self.item_timeout;
                    fail_pending(&mut tracked, &mut pending, ItemFailure::TimedOut(timeout));
                }
            }
        }
        drop(signals);

        let failed: Vec<FailedItem<A>> = tracked
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry.result {
                Some(Err(failure)) => Some(FailedItem {
                    index,
                    correlation_id: entry.correlation_id,
                    mutation: entry.item.mutation,
                    failure,
                }),
                _ => None,
            })
            .collect();

        busy.set(false);

        let effects = if failed.is_empty() {
            info!(batch = %batch_id, items, "batch succeeded");
            on_all_succeeded()
        } else {
            warn!(batch = %batch_id, items, failed = failed.len(), "batch failed");
            on_any_failed(&failed)
        };
        for effect in effects {
            self.store.dispatch(Envelope::new(effect));
        }

        if failed.is_empty() {
            BatchOutcome::Succeeded { items }
        } else {
            BatchOutcome::Failed { items, failed }
        }
    }
}

/// Resolves the pending item `signal` is addressed to, if any.
fn record<A>(
    tracked: &mut [Tracked<A>],
    pending: &mut HashMap<Uuid, usize>,
    signal: Signal,
    batch_id: Uuid,
) {
    let Some(index) = pending.get(&signal.correlation_id).copied() else {
        return;
    };
    if let Some(result) = settle(&tracked[index].item, signal) {
        debug!(batch = %batch_id, index, ok = result.is_ok(), "item resolved");
        tracked[index].result = Some(result);
        pending.remove(&tracked[index].correlation_id);
    }
}

/// Maps a signal addressed to `item` onto its outcome; unrelated kinds are ignored.
fn settle<A>(item: &BatchItem<A>, signal: Signal) -> Option<Result<(), ItemFailure>> {
    if signal.kind == item.on_success {
        Some(Ok(()))
    } else if signal.kind == item.on_fail {
        Some(Err(ItemFailure::Signalled {
            kind: signal.kind,
            error: signal.error,
        }))
    } else {
        None
    }
}

fn fail_pending<A>(
    tracked: &mut [Tracked<A>],
    pending: &mut HashMap<Uuid, usize>,
    failure: ItemFailure,
) {
    for (_, index) in pending.drain() {
        tracked[index].result = Some(Err(failure.clone()));
    }
}
