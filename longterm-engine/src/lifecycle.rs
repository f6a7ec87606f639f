use std::collections::HashMap;
use std::sync::Arc;

use longterm_protocol::scope::ScopeId;
use parking_lot::Mutex;
use tracing::{debug, info};

pub type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// Ties every teardown action of a scope to a single disposal.
///
/// Only open scopes are tracked. Scopes are minted by [`open_scope`], so a
/// scope the binder does not know has already been disposed.
///
/// [`open_scope`]: LifecycleBinder::open_scope
#[derive(Clone, Default)]
pub struct LifecycleBinder {
    bound: Arc<Mutex<HashMap<ScopeId, Vec<Teardown>>>>,
}

impl LifecycleBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh scope token.
    pub fn open_scope(&self) -> ScopeId {
        let scope = ScopeId::new();
        self.bound.lock().insert(scope, Vec::new());
        debug!(%scope, "scope opened");
        scope
    }

    /// Registers teardown actions for `scope`.
    ///
    /// Actions bound to a scope that is not open run immediately.
    pub fn bind_teardown<I>(&self, scope: ScopeId, actions: I)
    where
        I: IntoIterator<Item = Teardown>,
    {
        let mut bound = self.bound.lock();
        if let Some(pending) = bound.get_mut(&scope) {
            pending.extend(actions);
            return;
        }
        drop(bound);

        debug!(%scope, "binding to disposed scope, running teardown now");
        actions.into_iter().for_each(|action| action());
    }

    /// Runs every action bound to `scope` once, in binding order, then
    /// forgets the scope.
    ///
    /// Returns the number of actions run; later calls return 0.
    pub fn dispose(&self, scope: &ScopeId) -> usize {
        let Some(actions) = self.bound.lock().remove(scope) else {
            debug!(%scope, "scope already disposed");
            return 0;
        };

        let count = actions.len();
        for action in actions {
            action();
        }
        info!(%scope, actions = count, "scope disposed");
        count
    }

    pub fn is_disposed(&self, scope: &ScopeId) -> bool {
        !self.bound.lock().contains_key(scope)
    }

    /// Number of scopes opened and not yet disposed.
    pub fn open_scopes(&self) -> usize {
        self.bound.lock().len()
    }

    /// Number of teardown actions waiting on `scope`.
    pub fn pending(&self, scope: &ScopeId) -> usize {
        self.bound.lock().get(scope).map(Vec::len).unwrap_or(0)
    }
}
