//! Link event fan-out
//! Delivers link session events to any number of observers without the
//! session knowing who is listening.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::core::bluetooth::codec::TelemetryFrame;
use crate::core::bluetooth::types::SessionId;

/// Events published by a link session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { session: SessionId },
    Disconnected { session: SessionId },
    DataReceived { session: SessionId, frame: TelemetryFrame },
}

impl LinkEvent {
    pub fn session(&self) -> SessionId {
        match self {
            Self::Connected { session }
            | Self::Disconnected { session }
            | Self::DataReceived { session, .. } => *session,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// A registered observer's end of the bus
pub struct Subscription {
    pub id: ObserverId,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }
}

/// Fan-out of link events to registered observers.
///
/// Each observer has its own unbounded channel, so delivery order per
/// observer is emission order. Events emitted while nobody is subscribed are
/// dropped.
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<(ObserverId, mpsc::UnboundedSender<LinkEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new observer
    pub fn subscribe(&self) -> Subscription {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_observers().push((id, tx));
        debug!("Observer {:?} subscribed to link events", id);
        Subscription { id, events: rx }
    }

    /// Removes an observer; unknown ids are ignored
    pub fn unsubscribe(&self, id: ObserverId) {
        self.lock_observers().retain(|(observer, _)| *observer != id);
        debug!("Observer {:?} unsubscribed from link events", id);
    }

    /// Delivers the event to every live observer, returning how many received it
    pub fn emit(&self, event: LinkEvent) -> usize {
        let mut observers = self.lock_observers();
        // Observers whose receiver was dropped are pruned here
        observers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        if observers.is_empty() {
            trace!("No observers for {:?}, dropped", event);
        }
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, mpsc::UnboundedSender<LinkEvent>)>> {
        // A panicking observer cannot leave the list half-updated
        self.observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Observer-side helper that follows the latest session.
///
/// `Connected` adopts its session as current; anything tagged with an older
/// session is rejected, so telemetry that arrives during a teardown is not
/// mistaken for the new session's.
#[derive(Debug, Default)]
pub struct SessionTracker {
    current: Option<SessionId>,
    connected: bool,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the event belongs to the tracked session
    pub fn accept(&mut self, event: &LinkEvent) -> bool {
        let session = event.session();
        match event {
            LinkEvent::Connected { .. } => {
                if self.current.is_some_and(|current| session < current) {
                    return false;
                }
                self.current = Some(session);
                self.connected = true;
                true
            }
            LinkEvent::Disconnected { .. } => {
                if self.current != Some(session) {
                    return false;
                }
                self.connected = false;
                true
            }
            LinkEvent::DataReceived { .. } => self.connected && self.current == Some(session),
        }
    }

    /// Binary status indicator for the presentation layer
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn current_session(&self) -> Option<SessionId> {
        self.current
    }
}
