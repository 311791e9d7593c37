use crate::stream::StreamInner;
use crate::types::*;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// How an id not present in the arena is to be treated.
pub(crate) enum Lookup {
    Known(Arc<StreamInner>),
    /// Never observed: the id is still idle.
    Idle,
    /// Allocated or observed earlier: the stream existed and is gone.
    Closed,
}

struct ActiveStreams {
    count: u32,
    hook: Option<Box<dyn FnMut() + Send>>,
}

/// Arena of streams keyed by id, plus the id bookkeeping that tells an idle
/// id apart from a closed one.
pub(crate) struct StreamCoordinator {
    role: Role,
    streams: RwLock<HashMap<StreamId, Arc<StreamInner>>>,
    next_local_id: AtomicU32,
    /// Highest remote-initiated id observed so far.
    max_remote_id: AtomicU32,
    active: Mutex<ActiveStreams>,
}

impl StreamCoordinator {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            streams: RwLock::new(HashMap::new()),
            next_local_id: AtomicU32::new(role.first_local_id()),
            max_remote_id: AtomicU32::new(0),
            active: Mutex::new(ActiveStreams {
                count: 0,
                hook: None,
            }),
        }
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<StreamInner>> {
        self.streams
            .read()
            .expect("streams read")
            .get(&id)
            .cloned()
    }

    pub(crate) fn insert(&self, inner: Arc<StreamInner>) {
        self.streams
            .write()
            .expect("streams write")
            .insert(inner.id, inner);
    }

    pub(crate) fn allocate_local_id(&self) -> StreamId {
        let id = self.next_local_id.fetch_add(2, Ordering::SeqCst);
        assert!(id <= U31_MAX, "stream ids exhausted");
        id
    }

    /// Whether this endpoint allocates ids of this parity.
    pub(crate) fn is_local(&self, id: StreamId) -> bool {
        let odd = id % 2 == 1;
        match self.role {
            Role::Client => odd,
            Role::Server => !odd,
        }
    }

    pub(crate) fn observe_remote(&self, id: StreamId) {
        self.max_remote_id.fetch_max(id, Ordering::SeqCst);
    }

    /// Highest remote-initiated id observed, as reported in GOAWAY.
    pub(crate) fn last_remote_id(&self) -> StreamId {
        self.max_remote_id.load(Ordering::SeqCst)
    }

    pub(crate) fn classify(&self, id: StreamId) -> Lookup {
        if let Some(inner) = self.get(id) {
            return Lookup::Known(inner);
        }
        let seen = if self.is_local(id) {
            id < self.next_local_id.load(Ordering::SeqCst)
        } else {
            id <= self.max_remote_id.load(Ordering::SeqCst)
        };
        if seen {
            Lookup::Closed
        } else {
            Lookup::Idle
        }
    }

    /// One more stream left idle for an active state.
    pub(crate) fn activated(&self) {
        self.active.lock().expect("active streams").count += 1;
    }

    /// An active stream closed. The idle hook fires each time the count
    /// returns to zero; it runs under the counter lock and must not call
    /// back into the connection.
    pub(crate) fn deactivated(&self) {
        let mut active = self.active.lock().expect("active streams");
        active.count -= 1;
        if active.count == 0 {
            trace!("connection went idle");
            if let Some(hook) = active.hook.as_mut() {
                hook();
            }
        }
    }

    pub(crate) fn set_idle_hook(&self, hook: Box<dyn FnMut() + Send>) {
        self.active.lock().expect("active streams").hook = Some(hook);
    }
}
