//! Per-scope subscriber registry for realtime events.
//!
//! Delivery is best effort: every subscriber has a bounded queue and an
//! event that does not fit is dropped for that subscriber only. Peers that
//! miss a patch recover through the next version bump and a full fetch.

use crate::types::{Patch, Scope, VersionStamp};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Identifies one subscribed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// An accepted patch, forwarded verbatim to everyone but its sender,
    /// with the version it produced
    Patch {
        scope: Scope,
        patch: Patch,
        stamp: VersionStamp,
    },
    /// The scope's stored version moved; sent to every subscriber
    VersionBumped { scope: Scope, stamp: VersionStamp },
}

#[derive(Default)]
struct BusState {
    next_session: u64,
    scopes: HashMap<Scope, HashMap<SessionId, mpsc::Sender<BusEvent>>>,
}

#[derive(Clone)]
pub struct FanoutBus {
    state: Arc<Mutex<BusState>>,
    buffer: usize,
}

impl FanoutBus {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            buffer: subscriber_buffer.max(1),
        }
    }

    pub fn subscribe(&self, scope: &Scope) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let mut state = lock(&self.state);
        let session = SessionId(state.next_session);
        state.next_session = state.next_session.saturating_add(1);
        state
            .scopes
            .entry(scope.clone())
            .or_default()
            .insert(session, sender);
        debug!("{} joined {}", session, scope);

        Subscription {
            session,
            scope: scope.clone(),
            receiver,
            state: Arc::clone(&self.state),
        }
    }

    /// Forward a patch to the scope, skipping the session that sent it
    pub fn publish_patch(
        &self,
        scope: &Scope,
        origin: Option<SessionId>,
        patch: &Patch,
        stamp: VersionStamp,
    ) {
        let event = BusEvent::Patch {
            scope: scope.clone(),
            patch: patch.clone(),
            stamp,
        };
        self.deliver(scope, origin, event);
    }

    pub fn publish_version(&self, scope: &Scope, stamp: VersionStamp) {
        let event = BusEvent::VersionBumped {
            scope: scope.clone(),
            stamp,
        };
        self.deliver(scope, None, event);
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        lock(&self.state)
            .scopes
            .get(scope)
            .map_or(0, HashMap::len)
    }

    fn deliver(&self, scope: &Scope, skip: Option<SessionId>, event: BusEvent) {
        let mut state = lock(&self.state);
        let Some(subscribers) = state.scopes.get_mut(scope) else {
            return;
        };

        let mut closed = Vec::new();
        for (session, sender) in subscribers.iter() {
            if Some(*session) == skip {
                continue;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("{} on {} is lagging, dropped event", session, scope);
                }
                Err(TrySendError::Closed(_)) => closed.push(*session),
            }
        }

        for session in closed {
            subscribers.remove(&session);
            debug!("{} left {} (closed)", session, scope);
        }
        if subscribers.is_empty() {
            state.scopes.remove(scope);
        }
    }
}

impl fmt::Debug for FanoutBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutBus")
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

/// Receiving end of one subscription; unregisters itself on drop
pub struct Subscription {
    session: SessionId,
    scope: Scope,
    receiver: mpsc::Receiver<BusEvent>,
    state: Arc<Mutex<BusState>>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(subscribers) = state.scopes.get_mut(&self.scope) {
            subscribers.remove(&self.session);
            if subscribers.is_empty() {
                state.scopes.remove(&self.scope);
            }
        }
        debug!("{} left {}", self.session, self.scope);
    }
}

// A panic while holding the registry cannot leave it half-updated, so a
// poisoned lock is still safe to use.
fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
