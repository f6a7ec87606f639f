//! Scoped, reference-counted memoization of live composite queries.
//!
//! Entries are keyed by `(scope, filter key)`. The first subscriber opens the
//! upstream queries and spawns a driver task; later subscribers share the
//! driver's latest value through a `watch` channel. An entry is torn down when
//! its last subscriber detaches or when its scope is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use longterm_protocol::filter::GoalFilter;
use longterm_protocol::goal::{Goal, LongTermData, Period};
use longterm_protocol::scope::ScopeId;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::QueryError;
use crate::source::{next_or_pending, GoalStream, LiveSource, PeriodStream};

type QueryState = Option<Result<LongTermData, QueryError>>;

struct CacheEntry {
    generation: u64,
    subscribers: usize,
    receiver: watch::Receiver<QueryState>,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
}

impl CacheEntry {
    fn shutdown(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.driver.abort();
    }
}

#[derive(Default)]
struct CacheInner {
    scopes: HashMap<ScopeId, HashMap<String, CacheEntry>>,
    next_generation: u64,
}

/// Memoizes live period + goals queries per scope.
#[derive(Clone)]
pub struct ScopedQueryCache {
    source: Arc<dyn LiveSource>,
    inner: Arc<RwLock<CacheInner>>,
}

impl ScopedQueryCache {
    pub fn new(source: Arc<dyn LiveSource>) -> Self {
        Self {
            source,
            inner: Arc::new(RwLock::new(CacheInner::default())),
        }
    }

    /// Subscribes to the composite of period `filter_key` and its goals.
    ///
    /// `child_filter` builds the goal predicates for each emitted period. While
    /// an entry for `(scope, filter_key)` is live, further calls share it and
    /// their `child_filter` is not used.
    pub fn select_composite<F>(
        &self,
        scope: ScopeId,
        filter_key: &str,
        child_filter: F,
    ) -> CompositeSubscription
    where
        F: Fn(&Period) -> GoalFilter + Send + 'static,
    {
        let mut inner = self.inner.write();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let entries = inner.scopes.entry(scope).or_default();

        if let Some(entry) = entries.get_mut(filter_key) {
            if !entry.driver.is_finished() {
                entry.subscribers += 1;
                debug!(%scope, key = filter_key, subscribers = entry.subscribers, "sharing live query");
                return CompositeSubscription::new(
                    entry.receiver.clone(),
                    entry.closed.clone(),
                    Lease {
                        inner: Arc::downgrade(&self.inner),
                        scope,
                        key: filter_key.to_string(),
                        generation: entry.generation,
                    },
                );
            }
        }

        if let Some(stale) = entries.remove(filter_key) {
            debug!(%scope, key = filter_key, "restarting terminated live query");
            stale.shutdown();
        }

        let (tx, receiver) = watch::channel(None);
        let closed = Arc::new(AtomicBool::new(false));
        let base = self.source.watch_period(filter_key);
        let driver = tokio::spawn(drive(
            self.source.clone(),
            filter_key.to_string(),
            base,
            child_filter,
            tx,
        ));

        entries.insert(
            filter_key.to_string(),
            CacheEntry {
                generation,
                subscribers: 1,
                receiver: receiver.clone(),
                closed: closed.clone(),
                driver,
            },
        );
        info!(%scope, key = filter_key, "opened live query");

        CompositeSubscription::new(
            receiver,
            closed,
            Lease {
                inner: Arc::downgrade(&self.inner),
                scope,
                key: filter_key.to_string(),
                generation,
            },
        )
    }

    /// Cancels every live query registered under `scope`.
    ///
    /// Returns how many entries were torn down. Unknown or already released
    /// scopes are a no-op.
    pub fn release(&self, scope: &ScopeId) -> usize {
        let entries = self.inner.write().scopes.remove(scope);
        let Some(entries) = entries else {
            debug!(%scope, "release on scope without live queries");
            return 0;
        };

        let count = entries.len();
        for (_, entry) in entries {
            entry.shutdown();
        }
        info!(%scope, entries = count, "released scope");
        count
    }

    /// Filter keys with a live entry under `scope`.
    pub fn active_keys(&self, scope: &ScopeId) -> Vec<String> {
        self.inner
            .read()
            .scopes
            .get(scope)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, scope: &ScopeId, filter_key: &str) -> usize {
        self.inner
            .read()
            .scopes
            .get(scope)
            .and_then(|entries| entries.get(filter_key))
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }
}

/// Detaches one subscriber from its entry when dropped.
struct Lease {
    inner: Weak<RwLock<CacheInner>>,
    scope: ScopeId,
    key: String,
    generation: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.write();
        let Some(entries) = inner.scopes.get_mut(&self.scope) else {
            return;
        };

        let last = match entries.get_mut(&self.key) {
            Some(entry) if entry.generation == self.generation => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            _ => false,
        };

        if last {
            if let Some(entry) = entries.remove(&self.key) {
                entry.shutdown();
                debug!(scope = %self.scope, key = %self.key, "last subscriber detached");
            }
            if entries.is_empty() {
                inner.scopes.remove(&self.scope);
            }
        }
    }
}

/// Handle on a shared live composite query.
///
/// Yields the latest composite first (if any), then every later one. Ends after
/// an upstream failure, once the entry is torn down, or when upstream completes.
pub struct CompositeSubscription {
    receiver: watch::Receiver<QueryState>,
    closed: Arc<AtomicBool>,
    primed: bool,
    failed: bool,
    _lease: Lease,
}

impl CompositeSubscription {
    fn new(receiver: watch::Receiver<QueryState>, closed: Arc<AtomicBool>, lease: Lease) -> Self {
        Self {
            receiver,
            closed,
            primed: false,
            failed: false,
            _lease: lease,
        }
    }

    pub async fn next(&mut self) -> Option<Result<LongTermData, QueryError>> {
        loop {
            if self.failed || self.closed.load(Ordering::SeqCst) {
                return None;
            }

            if self.primed {
                if self.receiver.changed().await.is_err() {
                    return None;
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.primed = true;

            let current = self.receiver.borrow_and_update().clone();
            match current {
                Some(Ok(data)) => return Some(Ok(data)),
                Some(Err(err)) => {
                    self.failed = true;
                    return Some(Err(err));
                }
                None => continue,
            }
        }
    }
}

enum DriverEvent {
    Base(Option<Result<Option<Period>, QueryError>>),
    Goals(Option<Result<Vec<Goal>, QueryError>>),
}

/// Merges the base period stream with the goal stream of the current period.
///
/// Every base emission drops the previous goal stream before opening the next,
/// so goals of a superseded period are never composed with the new one.
async fn drive<F>(
    source: Arc<dyn LiveSource>,
    key: String,
    base: PeriodStream,
    child_filter: F,
    tx: watch::Sender<QueryState>,
) where
    F: Fn(&Period) -> GoalFilter + Send + 'static,
{
    let mut base: Option<PeriodStream> = Some(base);
    let mut goals: Option<GoalStream> = None;
    let mut period: Option<Period> = None;

    loop {
        if base.is_none() && goals.is_none() {
            debug!(key = %key, "upstream completed");
            return;
        }

        let event = tokio::select! {
            next = next_or_pending(&mut base) => DriverEvent::Base(next),
            next = next_or_pending(&mut goals) => DriverEvent::Goals(next),
        };

        match event {
            DriverEvent::Base(Some(Ok(Some(next_period)))) => {
                drop(goals.take());
                goals = Some(source.watch_goals(&child_filter(&next_period)));
                debug!(key = %key, period = %next_period.id, "switched goal query");
                period = Some(next_period);
            }
            DriverEvent::Base(Some(Ok(None))) => {
                goals = None;
                period = None;
                tx.send_replace(None);
                debug!(key = %key, "period absent");
            }
            DriverEvent::Base(Some(Err(err))) => {
                warn!(key = %key, %err, "period query failed");
                tx.send_replace(Some(Err(err)));
                return;
            }
            DriverEvent::Base(None) => base = None,
            DriverEvent::Goals(Some(Ok(children))) => {
                if let Some(current) = &period {
                    tx.send_replace(Some(Ok(LongTermData::compose(current.clone(), children))));
                }
            }
            DriverEvent::Goals(Some(Err(err))) => {
                warn!(key = %key, %err, "goal query failed");
                tx.send_replace(Some(Err(err)));
                return;
            }
            DriverEvent::Goals(None) => goals = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, ScriptedSource};

    fn period(start: i64) -> Period {
        Period::for_window(start, start + 1_000)
    }

    fn goal(id: &str, order: u32, period_id: &str) -> Goal {
        Goal::builder(id)
            .owner("alice")
            .period(period_id)
            .order(order)
            .build()
    }

    fn alice_goals(p: &Period) -> GoalFilter {
        GoalFilter::owned_in_period("alice", p.id.clone())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_upstream_subscription() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();

        let mut first = cache.select_composite(scope, "100", alice_goals);
        let mut second = cache.select_composite(scope, "100", alice_goals);
        assert_eq!(source.period_calls(), 1);
        assert_eq!(cache.subscriber_count(&scope, "100"), 2);

        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        source.push_goals("100", Ok(vec![goal("g1", 1, "100")]));

        let first_view = first.next().await.unwrap().unwrap();
        let second_view = second.next().await.unwrap().unwrap();
        assert_eq!(first_view, second_view);
        assert_eq!(first_view.period.id, "100");
        assert_eq!(source.goal_calls(), 1);

        // Another scope gets its own subscription.
        let _other = cache.select_composite(ScopeId::new(), "100", alice_goals);
        assert_eq!(source.period_calls(), 2);
    }

    #[tokio::test]
    async fn goals_are_delivered_in_order() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut sub = cache.select_composite(scope, "100", alice_goals);

        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        source.push_goals(
            "100",
            Ok(vec![
                goal("third", 3, "100"),
                goal("first", 1, "100"),
                goal("second", 2, "100"),
            ]),
        );

        let view = sub.next().await.unwrap().unwrap();
        let orders: Vec<u32> = view.goals.iter().map(|g| g.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn late_subscriber_receives_latest_composite() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut early = cache.select_composite(scope, "100", alice_goals);

        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        source.push_goals("100", Ok(vec![goal("g1", 1, "100")]));
        early.next().await.unwrap().unwrap();

        let mut late = cache.select_composite(scope, "100", alice_goals);
        let replayed = late.next().await.unwrap().unwrap();
        assert_eq!(replayed.goals[0].id, "g1");
    }

    #[tokio::test]
    async fn release_stops_delivery_and_is_idempotent() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut a = cache.select_composite(scope, "100", alice_goals);
        let mut b = cache.select_composite(scope, "200", alice_goals);

        assert_eq!(cache.release(&scope), 2);
        source.push_period("100", Ok(Some(period(100))));
        source.push_period("200", Ok(Some(period(200))));

        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());
        assert_eq!(cache.release(&scope), 0);
        assert!(cache.active_keys(&scope).is_empty());

        // Upstream streams are dropped once the drivers are cancelled.
        settle().await;
        assert_eq!(source.live_period_streams(), 0);
    }

    #[tokio::test]
    async fn release_without_emissions_is_safe() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let _sub = cache.select_composite(scope, "100", alice_goals);

        assert_eq!(cache.release(&scope), 1);
        assert_eq!(cache.release(&ScopeId::new()), 0);
    }

    #[tokio::test]
    async fn last_detach_tears_down_entry() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();

        let first = cache.select_composite(scope, "100", alice_goals);
        let second = cache.select_composite(scope, "100", alice_goals);
        drop(first);
        assert_eq!(cache.subscriber_count(&scope, "100"), 1);

        drop(second);
        assert!(cache.active_keys(&scope).is_empty());
        settle().await;
        assert_eq!(source.live_period_streams(), 0);

        let _again = cache.select_composite(scope, "100", alice_goals);
        assert_eq!(source.period_calls(), 2);
    }

    #[tokio::test]
    async fn period_change_cancels_previous_goal_query_first() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut sub = cache.select_composite(scope, "100", alice_goals);

        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        source.push_goals("100", Ok(vec![goal("old", 1, "100")]));
        assert_eq!(sub.next().await.unwrap().unwrap().goals[0].id, "old");

        let mut revised = period(100);
        revised.end_time += 5;
        source.push_period("100", Ok(Some(revised)));
        settle().await;
        source.push_goals("100", Ok(vec![goal("new", 1, "100")]));

        let view = sub.next().await.unwrap().unwrap();
        assert_eq!(view.goals[0].id, "new");
        assert_eq!(view.period.end_time, 1_105);
        assert_eq!(source.goal_calls(), 2);
        assert_eq!(source.max_live_goal_streams(), 1);
    }

    #[tokio::test]
    async fn base_failure_fails_the_composite() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut sub = cache.select_composite(scope, "100", alice_goals);

        let failure = QueryError::Base {
            key: "100".into(),
            reason: "permission denied".into(),
        };
        source.push_period("100", Err(failure.clone()));

        assert_eq!(sub.next().await, Some(Err(failure)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn child_failure_never_yields_partial_view() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut sub = cache.select_composite(scope, "100", alice_goals);

        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        let failure = QueryError::Child {
            period_id: "100".into(),
            reason: "offline".into(),
        };
        source.push_goals("100", Err(failure.clone()));

        assert_eq!(sub.next().await, Some(Err(failure)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn terminated_entry_restarts_on_next_select() {
        let source = Arc::new(ScriptedSource::default());
        let cache = ScopedQueryCache::new(source.clone());
        let scope = ScopeId::new();
        let mut failed = cache.select_composite(scope, "100", alice_goals);

        source.push_period(
            "100",
            Err(QueryError::Unavailable("connection reset".into())),
        );
        assert!(failed.next().await.unwrap().is_err());
        settle().await;

        let mut retry = cache.select_composite(scope, "100", alice_goals);
        assert_eq!(source.period_calls(), 2);
        source.push_period("100", Ok(Some(period(100))));
        settle().await;
        source.push_goals("100", Ok(vec![]));
        assert!(retry.next().await.unwrap().is_ok());

        // The stale lease must not detach the restarted entry.
        drop(failed);
        assert_eq!(cache.subscriber_count(&scope, "100"), 1);
    }
}
