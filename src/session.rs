//! The server-side `Session` store: a concurrent map binding an
//! `UploadIdentifier` to the metadata accepted at pre-request time, plus a
//! per-session lock that serializes chunk appends (§5, "Ordering
//! guarantees"). Modeled on the reference system's habit of guarding shared
//! state with a plain `std::sync::Mutex` rather than pulling in a
//! lock-free map crate.

use crate::model::Uploadable;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

/// An opaque, process-unique identifier for one in-flight upload. A 128-bit
/// UUID, per the spec's `UploadIdentifier` entity.
pub type UploadIdentifier = Uuid;

/// Server-side state bound to an `UploadIdentifier`: the uploadable metadata
/// accepted at pre-request time, the instant the session was created, and a
/// lock so concurrent chunk PUTs on the same session serialize (§5).
pub struct Session {
    pub uploadable: Uploadable,
    pub created_at: DateTime<Utc>,
    pub append_lock: AsyncMutex<()>,
}

impl Session {
    fn new(uploadable: Uploadable) -> Self {
        Session {
            uploadable,
            created_at: Utc::now(),
            append_lock: AsyncMutex::new(()),
        }
    }
}

/// A concurrent map of `UploadIdentifier -> Session`. At most one active
/// session exists per identifier (invariant 3 in the spec's data model).
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<UploadIdentifier, Arc<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore::default()
    }

    /// Creates a fresh session for `uploadable`, returning its identifier.
    /// Mutated only by C2.
    pub fn create(&self, uploadable: Uploadable) -> UploadIdentifier {
        let id = Uuid::new_v4();
        self.sessions
            .lock()
            .unwrap()
            .insert(id, Arc::new(Session::new(uploadable)));
        id
    }

    /// Looks up an active session without consuming it. Used by C3 (to read
    /// the current state) and C4 (status queries, which never mutate).
    pub fn get(&self, id: &UploadIdentifier) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Atomically removes a session. Called by C3 on completion, or when a
    /// protocol violation means the session must be destroyed (e.g. a resume
    /// attempt against a session with no chunk file).
    pub fn remove(&self, id: &UploadIdentifier) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().remove(id)
    }

    /// The number of sessions currently tracked. Exposed for metrics and
    /// tests; not part of the wire protocol.
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
