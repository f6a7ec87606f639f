//! One open long-term goals page: live data for the signed-in user's current
//! quarter plus the save flow for edited goals.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use longterm_core::CoreConfig;
use longterm_protocol::action::{Envelope, GoalAction, SignalKind};
use longterm_protocol::filter::GoalFilter;
use longterm_protocol::goal::{GoalChanges, GoalInForm, LongTermData, Period};
use longterm_protocol::scope::ScopeId;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{CompositeSubscription, ScopedQueryCache};
use crate::clock::{quarter_starts, Clock, QuarterClock, SystemClock};
use crate::error::{EngineError, QueryError};
use crate::lifecycle::{LifecycleBinder, Teardown};
use crate::source::{next_or_pending, ActionStore, LiveSource};
use crate::tracker::{BatchItem, BatchMutationTracker, BatchOutcome, BusyFlag};

pub const SAVED_MESSAGE: &str = "Updated Long Term Goals";
pub const SAVE_FAILED_MESSAGE: &str = "Could not update Long Term Goals";
pub const SNACKBAR_MILLIS: u64 = 2_000;

type PageState = Option<Result<LongTermData, QueryError>>;

/// Collaborators shared by every page instance.
#[derive(Clone)]
pub struct PageServices {
    pub cache: ScopedQueryCache,
    pub tracker: BatchMutationTracker<GoalAction>,
    pub store: Arc<dyn ActionStore<GoalAction>>,
    pub binder: LifecycleBinder,
    pub clock: Arc<dyn Clock>,
    pub quarter: QuarterClock,
    pub tick_interval: Duration,
}

impl PageServices {
    pub fn new(
        source: Arc<dyn LiveSource>,
        store: Arc<dyn ActionStore<GoalAction>>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            cache: ScopedQueryCache::new(source),
            tracker: BatchMutationTracker::new(store.clone(), config.mutation_timeout),
            store,
            binder: LifecycleBinder::new(),
            clock: Arc::new(SystemClock),
            quarter: QuarterClock::new(config.zone),
            tick_interval: config.tick_interval,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// A page session bound to one scope. Closing (or dropping) it releases
/// every live query and backend sync started for the scope.
pub struct LongTermPage {
    scope: ScopeId,
    services: PageServices,
    data: watch::Receiver<PageState>,
}

impl LongTermPage {
    /// Opens the page for the signed-in user stream `users`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(services: PageServices, users: BoxStream<'static, String>) -> Self {
        let scope = services.binder.open_scope();
        let (tx, data) = watch::channel(None);

        let quarters = quarter_starts(
            services.clock.clone(),
            services.quarter,
            services.tick_interval,
        );
        let session = tokio::spawn(run_session(
            scope,
            services.cache.clone(),
            services.store.clone(),
            quarters,
            users,
            tx,
        ));

        let cache = services.cache.clone();
        let store = services.store.clone();
        services.binder.bind_teardown(
            scope,
            [
                Box::new(move || session.abort()) as Teardown,
                Box::new(move || store.dispatch(Envelope::new(GoalAction::Cleanup { scope }))),
                Box::new(move || {
                    cache.release(&scope);
                }),
            ],
        );
        info!(%scope, "long-term page opened");

        Self {
            scope,
            services,
            data,
        }
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.services.binder.is_disposed(&self.scope)
    }

    pub fn subscribe(&self) -> watch::Receiver<PageState> {
        self.data.clone()
    }

    /// Waits for the first composite (or failure) of the current quarter.
    pub async fn current_data(&self) -> Result<LongTermData, EngineError> {
        let mut data = self.data.clone();
        let state = data
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Closed)?
            .clone();
        match state {
            Some(Ok(view)) => Ok(view),
            Some(Err(err)) => Err(err.into()),
            None => Err(EngineError::Closed),
        }
    }

    /// Form rows for the edit dialog, taken from the latest composite.
    pub async fn edit_form(&self) -> Result<Vec<GoalInForm>, EngineError> {
        Ok(self.current_data().await?.form_rows())
    }

    /// Saves edited goals; a row's position becomes its new `order`.
    ///
    /// Reports the result through a snackbar action either way.
    pub async fn save_goals(
        &self,
        goals: Vec<GoalInForm>,
        busy: &BusyFlag,
    ) -> Result<BatchOutcome<GoalAction>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let scope = self.scope;
        let batch = goals
            .into_iter()
            .enumerate()
            .map(|(index, goal)| {
                BatchItem::new(
                    GoalAction::UpdateLongTermGoal {
                        id: goal.id,
                        changes: GoalChanges {
                            text: Some(goal.text),
                            order: Some(index as u32 + 1),
                            completed: None,
                        },
                        scope,
                    },
                    SignalKind::GOAL_UPDATE_SUCCESS,
                    SignalKind::GOAL_UPDATE_FAIL,
                )
            })
            .collect();

        let outcome = self
            .services
            .tracker
            .run(
                batch,
                busy,
                || vec![GoalAction::snackbar(SAVED_MESSAGE, SNACKBAR_MILLIS)],
                |failed| {
                    for item in failed {
                        warn!(%scope, index = item.index, failure = %item.failure, "goal update failed");
                    }
                    vec![GoalAction::snackbar(SAVE_FAILED_MESSAGE, SNACKBAR_MILLIS)]
                },
            )
            .await;
        Ok(outcome)
    }

    /// Tears the page down. Later calls are no-ops.
    pub fn close(&self) {
        self.services.binder.dispose(&self.scope);
    }
}

impl Drop for LongTermPage {
    fn drop(&mut self) {
        self.close();
    }
}

enum SessionEvent {
    Quarter(Option<i64>),
    User(Option<String>),
    View(Option<Result<LongTermData, QueryError>>),
}

async fn next_view(
    current: &mut Option<CompositeSubscription>,
) -> Option<Result<LongTermData, QueryError>> {
    match current {
        Some(subscription) => subscription.next().await,
        None => futures::future::pending().await,
    }
}

/// Follows the latest (quarter, user) pair, switching the live query each
/// time either changes. The superseded subscription is dropped before the
/// next one is selected.
async fn run_session(
    scope: ScopeId,
    cache: ScopedQueryCache,
    store: Arc<dyn ActionStore<GoalAction>>,
    quarters: BoxStream<'static, i64>,
    users: BoxStream<'static, String>,
    tx: watch::Sender<PageState>,
) {
    let mut quarters = Some(quarters);
    let mut users = Some(users);
    let mut quarter: Option<i64> = None;
    let mut user: Option<String> = None;
    let mut current: Option<CompositeSubscription> = None;

    loop {
        if quarters.is_none() && users.is_none() && current.is_none() {
            return;
        }

        let event = tokio::select! {
            next = next_or_pending(&mut quarters) => SessionEvent::Quarter(next),
            next = next_or_pending(&mut users) => SessionEvent::User(next),
            next = next_view(&mut current) => SessionEvent::View(next),
        };

        let switch = match event {
            SessionEvent::Quarter(Some(start)) => quarter.replace(start) != Some(start),
            SessionEvent::User(Some(id)) => user.replace(id.clone()) != Some(id),
            SessionEvent::Quarter(None) => {
                quarters = None;
                false
            }
            SessionEvent::User(None) => {
                users = None;
                false
            }
            SessionEvent::View(Some(view)) => {
                tx.send_replace(Some(view));
                false
            }
            SessionEvent::View(None) => {
                current = None;
                false
            }
        };

        if let (true, Some(start), Some(owner)) = (switch, quarter, user.clone()) {
            drop(current.take());
            tx.send_replace(None);

            store.dispatch(Envelope::new(GoalAction::LoadData {
                start_time: start,
                user_id: owner.clone(),
                scope,
            }));

            let key = Period::id_for(start);
            debug!(%scope, key = %key, user = %owner, "switching live query");
            current = Some(cache.select_composite(scope, &key, move |period| {
                GoalFilter::owned_in_period(owner.clone(), period.id.clone())
            }));
        }
    }
}
