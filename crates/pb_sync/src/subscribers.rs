//! Status / event / error subscriptions.
//!
//! Handlers run on the core task, in registration order. A panicking
//! handler is contained and logged; it never unwinds the dispatcher or
//! starves later handlers. Status handlers additionally fire once at
//! registration time with the current status.
//!
//! Handlers are cloned out of the registry before invocation, so a
//! handler may itself subscribe or unsubscribe without deadlocking.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use pb_proto::Event;

use crate::error::SyncError;

/// Connection lifecycle as the application sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Rotating,
    Error,
}

type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

struct EventEntry {
    id: u64,
    /// Only events whose stream id starts with this prefix are delivered;
    /// None receives everything.
    stream_prefix: Option<String>,
    handler: EventHandler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    current_status: Option<ConnectionStatus>,
    status: Vec<(u64, StatusHandler)>,
    events: Vec<EventEntry>,
    errors: Vec<(u64, ErrorHandler)>,
}

#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone, Copy)]
enum Kind {
    Status,
    Event,
    Error,
}

/// Handle returned from every subscribe call; dropping it keeps the
/// subscription alive, `unsubscribe` removes it.
pub struct Subscription {
    registry: Subscribers,
    kind: Kind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let mut inner = self.registry.lock();
        match self.kind {
            Kind::Status => inner.status.retain(|(id, _)| *id != self.id),
            Kind::Event => inner.events.retain(|e| e.id != self.id),
            Kind::Error => inner.errors.retain(|(id, _)| *id != self.id),
        }
    }
}

fn guard(label: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(label, "subscriber handler panicked — continuing dispatch");
    }
}

impl Subscribers {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("subscriber registry poisoned")
    }

    pub fn subscribe_status(
        &self,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: StatusHandler = Arc::new(handler);
        let (id, current) = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.status.push((id, handler.clone()));
            (id, inner.current_status)
        };
        if let Some(status) = current {
            guard("status", || handler(status));
        }
        Subscription { registry: self.clone(), kind: Kind::Status, id }
    }

    pub fn subscribe_events(
        &self,
        stream_prefix: Option<String>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.events.push(EventEntry { id, stream_prefix, handler: Arc::new(handler) });
        drop(inner);
        Subscription { registry: self.clone(), kind: Kind::Event, id }
    }

    pub fn subscribe_errors(
        &self,
        handler: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.errors.push((id, Arc::new(handler)));
        drop(inner);
        Subscription { registry: self.clone(), kind: Kind::Error, id }
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.lock().current_status.unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn notify_status(&self, status: ConnectionStatus) {
        let handlers: Vec<StatusHandler> = {
            let mut inner = self.lock();
            inner.current_status = Some(status);
            inner.status.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            guard("status", || handler(status));
        }
    }

    pub fn notify_event(&self, event: &Event) {
        let handlers: Vec<EventHandler> = {
            let inner = self.lock();
            inner
                .events
                .iter()
                .filter(|entry| {
                    entry
                        .stream_prefix
                        .as_deref()
                        .map_or(true, |prefix| event.stream_id.starts_with(prefix))
                })
                .map(|entry| entry.handler.clone())
                .collect()
        };
        for handler in handlers {
            guard("event", || handler(event));
        }
    }

    pub fn notify_error(&self, error: &SyncError) {
        let handlers: Vec<ErrorHandler> = {
            let inner = self.lock();
            inner.errors.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            guard("error", || handler(error));
        }
    }
}
