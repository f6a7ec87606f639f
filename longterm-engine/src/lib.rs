//! Long-term goals engine: scoped live queries, batch mutation tracking,
//! quarter clock and the page session tying them together.

pub mod cache;
pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod page;
pub mod source;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use cache::{CompositeSubscription, ScopedQueryCache};
pub use clock::{quarter_starts, Clock, ManualClock, QuarterClock, SystemClock};
pub use error::{ClockError, EngineError, QueryError};
pub use lifecycle::{LifecycleBinder, Teardown};
pub use memory::{MemoryStore, UpdateFault};
pub use page::{LongTermPage, PageServices};
pub use source::{ActionStore, GoalStream, LiveSource, PeriodStream};
pub use tracker::{BatchItem, BatchMutationTracker, BatchOutcome, BusyFlag, FailedItem, ItemFailure};
