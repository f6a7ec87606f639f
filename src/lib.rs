//! Long-term goals: live, per-quarter goal data for a signed-in user.
//!
//! The workspace is split into three crates:
//!
//! * `longterm-core`: configuration, canonical errors and logging setup
//! * `longterm-protocol`: periods, goals, filters, actions and signals
//! * `longterm-engine`: the scoped query cache, batch mutation tracker,
//!   quarter clock, lifecycle binder and the page session built on them

pub use longterm_core as core_support;
pub use longterm_engine as engine;
pub use longterm_protocol as protocol;

pub use longterm_core::{load_core_config, CoreConfig, ZoneSetting};
pub use longterm_engine::{
    BatchOutcome, BusyFlag, LongTermPage, MemoryStore, PageServices, QuarterClock,
    ScopedQueryCache,
};
pub use longterm_protocol::prelude;
