//! In-memory upstream and store, for embedding without a remote backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use longterm_protocol::action::{Envelope, GoalAction, Signal, SignalKind};
use longterm_protocol::filter::GoalFilter;
use longterm_protocol::goal::{Goal, GoalChanges, Period};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::source::{ActionStore, GoalStream, LiveSource, PeriodStream};

pub(crate) const SIGNAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    periods: BTreeMap<String, Period>,
    /// Insertion order doubles as arrival order for goals sharing an `order`.
    goals: Vec<Goal>,
}

/// How the store answers updates of a given goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFault {
    /// Reply with the failure signal.
    Reject,
    /// Never reply.
    Ignore,
}

/// Live records plus a dispatch journal, shared behind an `Arc`.
pub struct MemoryStore {
    state: watch::Sender<Arc<Snapshot>>,
    signals: broadcast::Sender<Signal>,
    journal: Mutex<Vec<Envelope<GoalAction>>>,
    faults: RwLock<HashMap<String, UpdateFault>>,
    live_queries: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(Snapshot::default()));
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            state,
            signals,
            journal: Mutex::new(Vec::new()),
            faults: RwLock::new(HashMap::new()),
            live_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn upsert_period(&self, period: Period) {
        self.state.send_modify(|snapshot| {
            Arc::make_mut(snapshot)
                .periods
                .insert(period.id.clone(), period);
        });
    }

    pub fn upsert_goal(&self, goal: Goal) {
        self.state.send_modify(|snapshot| {
            let goals = &mut Arc::make_mut(snapshot).goals;
            match goals.iter_mut().find(|existing| existing.id == goal.id) {
                Some(existing) => *existing = goal,
                None => goals.push(goal),
            }
        });
    }

    pub fn goal(&self, id: &str) -> Option<Goal> {
        self.state
            .borrow()
            .goals
            .iter()
            .find(|goal| goal.id == id)
            .cloned()
    }

    pub fn set_fault(&self, goal_id: impl Into<String>, fault: UpdateFault) {
        self.faults.write().insert(goal_id.into(), fault);
    }

    /// Every envelope dispatched so far, oldest first.
    pub fn journal(&self) -> Vec<Envelope<GoalAction>> {
        self.journal.lock().clone()
    }

    /// Number of live query streams currently held by subscribers.
    pub fn live_queries(&self) -> usize {
        self.live_queries.load(Ordering::SeqCst)
    }

    fn project<T, P>(&self, projection: P) -> BoxStream<'static, T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        P: Fn(&Snapshot) -> T + Send + 'static,
    {
        let rx = self.state.subscribe();
        let gauge = QueryGauge::open(self.live_queries.clone());

        stream::unfold(
            (rx, None::<T>, gauge, projection),
            |(mut rx, last, gauge, projection)| async move {
                let mut primed = last.is_some();
                loop {
                    if primed && rx.changed().await.is_err() {
                        return None;
                    }
                    primed = true;
                    let current = projection(&rx.borrow_and_update());
                    if last.as_ref() != Some(&current) {
                        return Some((current.clone(), (rx, Some(current), gauge, projection)));
                    }
                }
            },
        )
        .boxed()
    }

    fn signal(&self, correlation_id: Option<Uuid>, signal: impl FnOnce(Uuid) -> Signal) {
        if let Some(id) = correlation_id {
            if self.signals.send(signal(id)).is_err() {
                debug!(correlation_id = %id, "no signal listeners");
            }
        }
    }

    fn apply_update(&self, correlation_id: Option<Uuid>, id: &str, changes: &GoalChanges) {
        let fault = self.faults.read().get(id).copied();
        match fault {
            Some(UpdateFault::Ignore) => {
                warn!(goal = id, "dropping update without reply");
                return;
            }
            Some(UpdateFault::Reject) => {
                self.signal(correlation_id, |cid| {
                    Signal::new(cid, SignalKind::GOAL_UPDATE_FAIL).with_error("update rejected")
                });
                return;
            }
            None => {}
        }

        let mut found = false;
        self.state.send_if_modified(|snapshot| {
            let Some(index) = snapshot.goals.iter().position(|goal| goal.id == id) else {
                return false;
            };
            Arc::make_mut(snapshot).goals[index].apply(changes);
            found = true;
            true
        });

        if found {
            self.signal(correlation_id, |cid| {
                Signal::new(cid, SignalKind::GOAL_UPDATE_SUCCESS)
            });
        } else {
            self.signal(correlation_id, |cid| {
                Signal::new(cid, SignalKind::GOAL_UPDATE_FAIL)
                    .with_error(format!("goal `{id}` not found"))
            });
        }
    }
}

impl LiveSource for MemoryStore {
    fn watch_period(&self, id: &str) -> PeriodStream {
        let id = id.to_string();
        self.project(move |snapshot| snapshot.periods.get(&id).cloned())
            .map(Ok)
            .boxed()
    }

    fn watch_goals(&self, filter: &GoalFilter) -> GoalStream {
        let filter = filter.clone();
        self.project(move |snapshot| {
            snapshot
                .goals
                .iter()
                .filter(|goal| filter.matches(goal))
                .cloned()
                .collect::<Vec<_>>()
        })
        .map(Ok)
        .boxed()
    }
}

impl ActionStore<GoalAction> for MemoryStore {
    fn dispatch(&self, envelope: Envelope<GoalAction>) {
        self.journal.lock().push(envelope.clone());
        match &envelope.action {
            GoalAction::UpdateLongTermGoal { id, changes, .. } => {
                self.apply_update(envelope.correlation_id, id, changes)
            }
            other => debug!(action = ?other, "recorded action"),
        }
    }

    fn signals(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }
}

/// Counts one open query stream until dropped.
struct QueryGauge(Arc<AtomicUsize>);

impl QueryGauge {
    fn open(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueryGauge {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
