use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::goal::GoalChanges;
use crate::scope::ScopeId;

/// Actions understood by the store/dispatch layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GoalAction {
    /// Ask the backend to start syncing a user's quarter into the store.
    LoadData {
        start_time: i64,
        user_id: String,
        scope: ScopeId,
    },
    /// Stop every backend sync started on behalf of `scope`.
    Cleanup { scope: ScopeId },
    UpdateLongTermGoal {
        id: String,
        changes: GoalChanges,
        scope: ScopeId,
    },
    ShowSnackbar { message: String, duration_ms: u64 },
}

impl GoalAction {
    pub fn snackbar(message: impl Into<String>, duration_ms: u64) -> Self {
        GoalAction::ShowSnackbar {
            message: message.into(),
            duration_ms,
        }
    }
}

/// An action on its way to the store, optionally tagged for correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<A> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub action: A,
}

impl<A> Envelope<A> {
    pub fn new(action: A) -> Self {
        Self {
            correlation_id: None,
            action,
        }
    }

    pub fn correlated(correlation_id: Uuid, action: A) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            action,
        }
    }
}

/// Name of an outcome signal, e.g. `long_term_goal/update_success`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalKind(Cow<'static, str>);

impl SignalKind {
    pub const GOAL_UPDATE_SUCCESS: SignalKind =
        SignalKind::from_static("long_term_goal/update_success");
    pub const GOAL_UPDATE_FAIL: SignalKind = SignalKind::from_static("long_term_goal/update_fail");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome notification emitted by the store for a correlated action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub correlation_id: Uuid,
    pub kind: SignalKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Signal {
    pub fn new(correlation_id: Uuid, kind: SignalKind) -> Self {
        Self {
            correlation_id,
            kind,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
