//! The event bus shim.
//!
//! The session sees the publisher only through [`Publisher`]: one call to
//! push an event up, one to register a subscription, one to drop a
//! subscriber's registrations at disconnect. `LocalPublisher` is the
//! in-process implementation the binary and the tests wire up; a brokered
//! deployment swaps in its own.

use chrono::{DateTime, Utc};
use cl_protocol::DeviceId;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Default event time-to-live in seconds when the frame carries no Max-Age.
pub const DEFAULT_TTL: u32 = 60;
/// Longest event name after the `e/` / `E/` prefix is stripped.
pub const MAX_EVENT_NAME: usize = 63;

/// One event published up from a device or delivered down to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub name: String,
    pub is_public: bool,
    /// Seconds; defaults to [`DEFAULT_TTL`].
    pub ttl: u32,
    /// `None` when the frame had no payload.
    pub data: Option<Vec<u8>>,
    pub device_id: DeviceId,
    pub published_at: DateTime<Utc>,
}

/// What the bus did with a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// The publisher is shedding load; the device should slow down.
    RateLimited,
}

/// Where a subscription's events land: the session's event mailbox.
pub type EventSink = mpsc::Sender<EventRecord>;

/// One registered subscription.
pub struct Subscription {
    /// Event-name prefix to match.
    pub name: String,
    /// When non-empty, only events from this user's devices match.
    pub user_id: String,
    /// When set, only events from this exact device match.
    pub device_filter: Option<DeviceId>,
    /// Owning session, as rendered device id; used for teardown.
    pub subscriber: String,
    pub sink: EventSink,
}

pub trait Publisher: Send + Sync {
    /// Push one event up. `user_id` is the publishing session's user.
    fn publish(&self, event: &EventRecord, user_id: &str) -> PublishOutcome;

    fn subscribe(&self, subscription: Subscription);

    /// Tear down every subscription owned by `subscriber`.
    fn unsubscribe_all(&self, subscriber: &str);
}

// ---------------------------------------------------------------------------
// In-process publisher
// ---------------------------------------------------------------------------

/// Fan-out publisher for single-process deployments and tests.
#[derive(Default)]
pub struct LocalPublisher {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl LocalPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Publisher for LocalPublisher {
    fn publish(&self, event: &EventRecord, user_id: &str) -> PublishOutcome {
        let subscriptions = self.subscriptions.read().expect("subscription lock");
        for sub in subscriptions.iter() {
            if !event.name.starts_with(&sub.name) {
                continue;
            }
            if !sub.user_id.is_empty() && sub.user_id != user_id {
                continue;
            }
            if let Some(filter) = sub.device_filter {
                if filter != event.device_id {
                    continue;
                }
            }
            // Slow sessions shed events rather than stall the bus.
            if sub.sink.try_send(event.clone()).is_err() {
                debug!(subscriber = %sub.subscriber, event = %event.name, "subscriber mailbox full, dropping");
            }
        }
        PublishOutcome::Accepted
    }

    fn subscribe(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .expect("subscription lock")
            .push(subscription);
    }

    fn unsubscribe_all(&self, subscriber: &str) {
        self.subscriptions
            .write()
            .expect("subscription lock")
            .retain(|sub| sub.subscriber != subscriber);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
