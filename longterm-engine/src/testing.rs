//! Instrumented upstream used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use longterm_protocol::action::{Envelope, Signal};
use longterm_protocol::filter::{GoalField, GoalFilter};
use longterm_protocol::goal::{Goal, Period};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::error::QueryError;
use crate::source::{ActionStore, GoalStream, LiveSource, PeriodStream};

type PeriodItem = Result<Option<Period>, QueryError>;
type GoalItem = Result<Vec<Goal>, QueryError>;

/// Lets pending tasks (drivers, cancellations) run to their next await point.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Decrements a live-stream gauge when the owning stream is dropped.
struct Live(Arc<AtomicUsize>);

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct GoalChannels {
    senders: Vec<mpsc::UnboundedSender<GoalItem>>,
    backlog: Vec<GoalItem>,
}

/// Source whose emissions are pushed by the test, with call and liveness counters.
#[derive(Default)]
pub(crate) struct ScriptedSource {
    period_calls: AtomicUsize,
    goal_calls: AtomicUsize,
    live_periods: Arc<AtomicUsize>,
    live_goals: Arc<AtomicUsize>,
    max_live_goals: AtomicUsize,
    periods: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<PeriodItem>>>>,
    goals: Mutex<HashMap<String, GoalChannels>>,
}

impl ScriptedSource {
    pub fn period_calls(&self) -> usize {
        self.period_calls.load(Ordering::SeqCst)
    }

    pub fn goal_calls(&self) -> usize {
        self.goal_calls.load(Ordering::SeqCst)
    }

    pub fn live_period_streams(&self) -> usize {
        self.live_periods.load(Ordering::SeqCst)
    }

    pub fn max_live_goal_streams(&self) -> usize {
        self.max_live_goals.load(Ordering::SeqCst)
    }

    /// Sends to every open subscription of period `id`.
    pub fn push_period(&self, id: &str, item: PeriodItem) {
        let mut periods = self.periods.lock();
        if let Some(senders) = periods.get_mut(id) {
            senders.retain(|tx| tx.send(item.clone()).is_ok());
        }
    }

    /// Sends to open goal subscriptions of `period_id`, or buffers until one opens.
    pub fn push_goals(&self, period_id: &str, item: GoalItem) {
        let mut goals = self.goals.lock();
        let channels = goals.entry(period_id.to_string()).or_default();
        channels.senders.retain(|tx| !tx.is_closed());
        if channels.senders.is_empty() {
            channels.backlog.push(item);
            return;
        }
        channels.senders.retain(|tx| tx.send(item.clone()).is_ok());
    }
}

fn filter_period(filter: &GoalFilter) -> String {
    filter
        .predicates
        .iter()
        .find(|predicate| predicate.field == GoalField::PeriodId)
        .map(|predicate| predicate.value.clone())
        .unwrap_or_default()
}

fn into_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
    live: Arc<AtomicUsize>,
) -> futures::stream::BoxStream<'static, T> {
    stream::unfold((rx, Live(live)), |(mut rx, live)| async move {
        rx.recv().await.map(|item| (item, (rx, live)))
    })
    .boxed()
}

impl LiveSource for ScriptedSource {
    fn watch_period(&self, id: &str) -> PeriodStream {
        self.period_calls.fetch_add(1, Ordering::SeqCst);
        self.live_periods.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.periods.lock().entry(id.to_string()).or_default().push(tx);
        into_stream(rx, self.live_periods.clone())
    }

    fn watch_goals(&self, filter: &GoalFilter) -> GoalStream {
        self.goal_calls.fetch_add(1, Ordering::SeqCst);
        let live = self.live_goals.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_goals.fetch_max(live, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut goals = self.goals.lock();
        let channels = goals.entry(filter_period(filter)).or_default();
        for item in channels.backlog.drain(..) {
            let _ = tx.send(item);
        }
        channels.senders.push(tx);
        into_stream(rx, self.live_goals.clone())
    }
}

/// Store that records dispatched envelopes and lets the test emit signals.
pub(crate) struct RecordingStore<A> {
    dispatched: Mutex<Vec<Envelope<A>>>,
    dispatch_notify: Notify,
    signals: Mutex<Option<broadcast::Sender<Signal>>>,
}

impl<A: Clone + Send + 'static> RecordingStore<A> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            dispatched: Mutex::new(Vec::new()),
            dispatch_notify: Notify::new(),
            signals: Mutex::new(Some(tx)),
        }
    }

    pub fn dispatched(&self) -> Vec<Envelope<A>> {
        self.dispatched.lock().clone()
    }

    /// Waits until at least `count` envelopes were dispatched and returns them.
    pub async fn wait_for_dispatches(&self, count: usize) -> Vec<Envelope<A>> {
        loop {
            let notified = self.dispatch_notify.notified();
            {
                let dispatched = self.dispatched.lock();
                if dispatched.len() >= count {
                    return dispatched.clone();
                }
            }
            notified.await;
        }
    }

    pub fn emit(&self, signal: Signal) {
        if let Some(tx) = self.signals.lock().as_ref() {
            let _ = tx.send(signal);
        }
    }

    pub fn close_signals(&self) {
        self.signals.lock().take();
    }
}

impl<A: Clone + Send + 'static> ActionStore<A> for RecordingStore<A> {
    fn dispatch(&self, envelope: Envelope<A>) {
        self.dispatched.lock().push(envelope);
        self.dispatch_notify.notify_waiters();
    }

    fn signals(&self) -> broadcast::Receiver<Signal> {
        match self.signals.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}
