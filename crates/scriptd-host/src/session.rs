use parking_lot::RwLock;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Active overrides on this thread as `(context id, session)`, innermost last
    static SCOPES: RefCell<Vec<(u64, Option<String>)>> = const { RefCell::new(Vec::new()) };
}

/// Session identity captured at the moment a trigger fires
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session the trigger originated from (if any)
    pub session_id: Option<String>,
}

impl SessionSnapshot {
    pub fn new(session_id: Option<String>) -> Self {
        Self { session_id }
    }
}

/// The runtime's "current session" pointer.
///
/// Transports advance it as requests arrive. Code running under a
/// [`SessionScope`] on the same thread sees the scope's session instead, so
/// work started from an action handler or a delayed task keeps targeting the
/// session it came from.
#[derive(Debug)]
pub struct SessionContext {
    id: u64,
    current: RwLock<Option<String>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst),
            current: RwLock::new(None),
        }
    }
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current(&self, session_id: Option<String>) {
        *self.current.write() = session_id;
    }

    /// The scoped session on this thread if there is one, else the live pointer
    pub fn current(&self) -> Option<String> {
        let scoped = SCOPES.with(|scopes| {
            scopes
                .borrow()
                .iter()
                .rev()
                .find(|(id, _)| *id == self.id)
                .map(|(_, session)| session.clone())
        });
        match scoped {
            Some(session) => session,
            None => self.current.read().clone(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::new(self.current())
    }

    /// Pin `snapshot` for code later run under [`SessionBinding::enter`]
    pub fn bind(&self, snapshot: SessionSnapshot) -> SessionBinding {
        SessionBinding {
            context: self.id,
            snapshot,
        }
    }

    /// Bind whatever [`SessionContext::current`] returns right now
    pub fn bind_current(&self) -> SessionBinding {
        self.bind(self.snapshot())
    }
}

/// A session pinned to one [`SessionContext`], carried to wherever a
/// callable eventually runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    context: u64,
    snapshot: SessionSnapshot,
}

impl SessionBinding {
    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    /// Override the context's session on this thread until the scope drops
    pub fn enter(&self) -> SessionScope {
        SCOPES.with(|scopes| {
            scopes
                .borrow_mut()
                .push((self.context, self.snapshot.session_id.clone()))
        });
        SessionScope {
            _not_send: PhantomData,
        }
    }
}

/// Guard returned by [`SessionBinding::enter`]; tied to its thread
pub struct SessionScope {
    _not_send: PhantomData<*const ()>,
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}
