// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::Error;
use crate::alerts::Alert;
use crate::models::MetricsSnapshot;

/// Something observers can subscribe to.
#[derive(Debug, Clone)]
pub enum Event {
    /// A fresh metrics snapshot was fetched.
    Metrics(Arc<MetricsSnapshot>),
    /// An alert was raised.
    Alert(Alert),
    /// An alert's condition stopped holding.
    AlertCleared(Alert),
    /// A poll failed after all retries; [`Error::is_degraded`] tells whether the circuit was open.
    PollFailed(Error),
}

impl Event {
    /// The kind subscribers register for to receive this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Metrics(_) => EventKind::Metrics,
            Self::Alert(_) => EventKind::Alert,
            Self::AlertCleared(_) => EventKind::AlertCleared,
            Self::PollFailed(_) => EventKind::PollFailed,
        }
    }
}

/// Discriminant of [`Event`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`Event::Metrics`].
    Metrics,
    /// [`Event::Alert`].
    Alert,
    /// [`Event::AlertCleared`].
    AlertCleared,
    /// [`Event::PollFailed`].
    PollFailed,
}

impl EventKind {
    /// Snake-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Alert => "alert",
            Self::AlertCleared => "alert_cleared",
            Self::PollFailed => "poll_failed",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(u64, Callback)>>,
}

/// Synchronous publish/subscribe hub.
///
/// [`EventBus::publish`] invokes every callback subscribed to the event's kind, in subscription
/// order, on the publishing thread. A callback that panics is logged and skipped; the remaining
/// callbacks still run and the panic never reaches the publisher. Callbacks run without any
/// lock held, so they may subscribe or unsubscribe themselves.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        let counts: HashMap<_, _> = registry
            .subscribers
            .iter()
            .map(|(kind, callbacks)| (kind.as_str(), callbacks.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

impl EventBus {
    /// A bus without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for events of `kind`.
    ///
    /// The callback stays registered until the returned [`Subscription`] is unsubscribed or
    /// dropped.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.entry(kind).or_default().push((id, Arc::new(callback)));

        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Delivers `event` to its subscribers and returns how many completed without panicking.
    pub fn publish(&self, event: &Event) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = self
            .registry
            .lock()
            .subscribers
            .get(&kind)
            .map(|callbacks| callbacks.iter().map(|(_, callback)| Arc::clone(callback)).collect())
            .unwrap_or_default();

        callbacks
            .iter()
            .filter(|callback| match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => true,
                Err(panic) => {
                    tracing::event!(
                        name: "telltale.events.subscriber_panicked",
                        tracing::Level::ERROR,
                        event.kind = kind.as_str(),
                        panic.message = panic_message(panic.as_ref()),
                        "subscriber panicked while handling {kind} event",
                    );
                    false
                }
            })
            .count()
    }

    /// Callbacks currently registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry.lock().subscribers.get(&kind).map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Keeps a callback registered on an [`EventBus`]; dropping it unsubscribes.
#[derive(Debug)]
#[must_use = "dropping a subscription unsubscribes its callback"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// The kind this subscription receives.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the callback. Returns `false` if the bus no longer exists.
    pub fn unsubscribe(self) -> bool {
        self.remove()
    }

    fn remove(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        let mut registry = registry.lock();
        let Some(callbacks) = registry.subscribers.get_mut(&self.kind) else {
            return false;
        };

        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != self.id);
        before != callbacks.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
