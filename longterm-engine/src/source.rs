//! Seams to the external collaborators: the live data source and the store.

use futures::stream::{BoxStream, StreamExt};
use longterm_protocol::action::{Envelope, Signal};
use longterm_protocol::filter::GoalFilter;
use longterm_protocol::goal::{Goal, Period};
use tokio::sync::broadcast;

use crate::error::QueryError;

pub type PeriodStream = BoxStream<'static, Result<Option<Period>, QueryError>>;
pub type GoalStream = BoxStream<'static, Result<Vec<Goal>, QueryError>>;

/// Upstream data source exposing lazy, restartable live queries.
///
/// Each call opens a fresh subscription. Dropping the returned stream cancels
/// it and must not have side effects beyond releasing upstream resources.
pub trait LiveSource: Send + Sync + 'static {
    /// Point query on a period by id. Emits `None` while the period is absent.
    fn watch_period(&self, id: &str) -> PeriodStream;

    /// Filtered query over goals; emits the full matching set on every change.
    fn watch_goals(&self, filter: &GoalFilter) -> GoalStream;
}

/// Store/dispatch layer.
///
/// Every correlated envelope is expected to eventually produce exactly one
/// [`Signal`] carrying the same correlation id.
pub trait ActionStore<A>: Send + Sync + 'static {
    fn dispatch(&self, envelope: Envelope<A>);

    /// Subscribes to outcome signals emitted after this call.
    fn signals(&self) -> broadcast::Receiver<Signal>;
}

/// Next item of an optional stream; a missing stream never yields.
pub(crate) async fn next_or_pending<T>(stream: &mut Option<BoxStream<'static, T>>) -> Option<T> {
    match stream {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}
