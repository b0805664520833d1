//! Session id → cancellation signal map shared between the front-end and
//! running upload drivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Lifecycle of a registered session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    CancelRequested,
    Finished,
}

/// Shared view of one session's cancellation flag.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl SessionHandle {
    fn new(id: &str) -> Self {
        Self {
            id: Arc::from(id),
            token: CancellationToken::new(),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        if self.finished.load(Ordering::Acquire) {
            SessionState::Finished
        } else if self.token.is_cancelled() {
            SessionState::CancelRequested
        } else {
            SessionState::Running
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token the driver polls between chunks. Cancelling it is permanent.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.finished, &other.finished)
    }
}

/// Thread-safe registry of cancellable sessions.
///
/// Entries live exactly as long as their driver: every [`register`] made by
/// the engine is paired with a [`SessionGuard`] that removes it on drop.
///
/// [`register`]: CancelRegistry::register
#[derive(Debug, Default)]
pub struct CancelRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionHandle>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("cancel registry lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    /// Returns the handle for `id`, creating it if needed.
    pub fn register(&self, id: &str) -> SessionHandle {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(id) {
            tracing::debug!(session = id, "session already registered");
            return existing.clone();
        }
        let handle = SessionHandle::new(id);
        sessions.insert(id.to_string(), handle.clone());
        tracing::debug!(session = id, active = sessions.len(), "session registered");
        handle
    }

    /// Registers a new session, or returns `None` while `id` is still live.
    pub fn try_register(&self, id: &str) -> Option<SessionHandle> {
        let mut sessions = self.lock();
        if sessions.contains_key(id) {
            return None;
        }
        let handle = SessionHandle::new(id);
        sessions.insert(id.to_string(), handle.clone());
        tracing::debug!(session = id, active = sessions.len(), "session registered");
        Some(handle)
    }

    /// Signals the session to stop at its next chunk boundary.
    ///
    /// Returns `false` for unknown or finished ids, without side effects.
    pub fn cancel(&self, id: &str) -> bool {
        let sessions = self.lock();
        match sessions.get(id) {
            Some(handle) if handle.state() != SessionState::Finished => {
                handle.token.cancel();
                tracing::debug!(session = id, "cancel requested");
                true
            }
            _ => false,
        }
    }

    /// Removes `id` and marks its handle finished.
    pub fn unregister(&self, id: &str) {
        if let Some(handle) = self.lock().remove(id) {
            handle.finished.store(true, Ordering::Release);
            tracing::debug!(session = id, "session unregistered");
        }
    }

    /// Like [`unregister`](Self::unregister), but leaves a newer session
    /// that reused the same id alone.
    fn release(&self, handle: &SessionHandle) {
        let mut sessions = self.lock();
        if sessions
            .get(handle.id())
            .is_some_and(|current| current.same_session(handle))
        {
            sessions.remove(handle.id());
            tracing::debug!(session = handle.id(), active = sessions.len(), "session released");
        }
        handle.finished.store(true, Ordering::Release);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Removes its session from the registry when dropped, whichever way the
/// owning driver exits.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<CancelRegistry>,
    handle: SessionHandle,
}

impl SessionGuard {
    pub fn new(registry: Arc<CancelRegistry>, handle: SessionHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.handle);
    }
}
