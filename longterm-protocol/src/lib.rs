pub mod action;
pub mod filter;
pub mod goal;
pub mod scope;

pub mod prelude {
    pub use crate::action::{Envelope, GoalAction, Signal, SignalKind};
    pub use crate::filter::{GoalField, GoalFilter, Predicate};
    pub use crate::goal::{Goal, GoalBuilder, GoalChanges, GoalInForm, LongTermData, Period};
    pub use crate::scope::ScopeId;
}
