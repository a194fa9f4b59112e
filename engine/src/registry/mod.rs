//! Session registry
//!
//! Process-wide map from session ID to the live version-control handle for
//! that session. Every task invocation of a run resolves its handle here, so
//! the map is the single place a session's repository is reachable from.
//!
//! The map is a cache over the [`SessionFactory`]: a lookup miss asks the
//! factory to reattach a persisted clone before reporting `SessionNotFound`.
//!
//! Teardown is scoped: [`SessionRegistry::guard`] returns a [`SessionGuard`]
//! whose `Drop` releases the entry, so release happens on every exit path of
//! a run, including early returns, panics and task cancellation.

use crate::vcs::{SessionFactory, VcsSession};
use sdk::errors::PipelineError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// A registered handle. The async mutex serializes invocations within a session.
pub type SharedSession = Arc<tokio::sync::Mutex<Box<dyn VcsSession>>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    factory: Option<Arc<dyn SessionFactory>>,
}

impl SessionRegistry {
    /// Registry without reattach support
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that falls back to `factory.reattach` on lookup misses
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory: Some(factory),
        }
    }

    /// Store `handle` under `session_id`.
    ///
    /// An existing entry is replaced and released; re-initiation is a
    /// recoverable anomaly, not an error.
    pub fn register(&self, session_id: &str, handle: Box<dyn VcsSession>) -> SharedSession {
        let shared: SharedSession = Arc::new(tokio::sync::Mutex::new(handle));
        let previous = self
            .write()
            .insert(session_id.to_string(), Arc::clone(&shared));

        if let Some(previous) = previous {
            warn!(session_id = %session_id, "session re-registered, releasing previous handle");
            drop(previous);
        } else {
            info!(session_id = %session_id, "session registered");
        }
        shared
    }

    /// Resolve the handle for `session_id`.
    ///
    /// # Errors
    ///
    /// `PipelineError::SessionNotFound` when neither the map nor the factory
    /// knows the session. This is not retryable.
    pub async fn lookup(&self, session_id: &str) -> Result<SharedSession, PipelineError> {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }

        let not_found = || PipelineError::SessionNotFound(session_id.to_string());
        let factory = self.factory.as_ref().ok_or_else(not_found)?;

        let reattached = factory
            .reattach(session_id)
            .await
            .map_err(PipelineError::from)?
            .ok_or_else(not_found)?;

        // Another invocation may have won the race; keep whichever landed first.
        let mut sessions = self.write();
        let handle = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(reattached)));
        info!(session_id = %session_id, "session reattached");
        Ok(Arc::clone(handle))
    }

    /// Cached handle only, without reattach
    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.read().get(session_id).map(Arc::clone)
    }

    /// Remove the entry. Returns whether one existed; a missing entry is fine.
    pub fn release(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id);
        match removed {
            Some(_) => {
                info!(session_id = %session_id, "session released");
                true
            }
            None => {
                debug!(session_id = %session_id, "release of unknown session ignored");
                false
            }
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Scoped teardown for `session_id`: the entry is released when the guard drops.
    pub fn guard(self: &Arc<Self>, session_id: &str) -> SessionGuard {
        SessionGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SharedSession>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SharedSession>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases one registry entry on drop.
#[must_use = "the session is released as soon as the guard is dropped"]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.session_id);
    }
}
