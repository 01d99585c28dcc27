//! Telemetry events and their subscribers
//!
//! Subscribers are notified in subscription order. A subscriber that fails
//! or panics is logged and skipped; the remaining subscribers still run.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::CompressionProfile;
use crate::session::{SessionId, SessionState};

/// Which threshold an alert crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AudioLatency,
    TransportLatency,
    ProcessingTime,
    LowBattery,
    WeakSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

/// Why a packet never reached playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    PacketTimeout,
    MalformedPacket,
    MalformedChunk,
    Late,
    Overflow,
}

/// What playback rendered for a starved tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderrunFill {
    RepeatLast,
    Silence,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Alert(Alert),
    SessionChanged {
        session_id: SessionId,
        device_id: String,
        /// `None` when the session was just admitted
        from: Option<SessionState>,
        to: SessionState,
    },
    WriteFailed {
        session_id: SessionId,
        error: String,
        consecutive: u32,
    },
    PacketDropped {
        packet_id: Option<u32>,
        reason: DropReason,
    },
    Underrun {
        tick: u64,
        fill: UnderrunFill,
    },
    ProfileSuggested {
        current: CompressionProfile,
        suggested: CompressionProfile,
        applied: bool,
    },
}

#[derive(Error, Debug)]
#[error("subscriber failed: {0}")]
pub struct SubscriberError(pub String);

pub trait TelemetrySubscriber: Send + Sync {
    fn on_event(&self, event: &TelemetryEvent) -> Result<(), SubscriberError>;
}

impl<F> TelemetrySubscriber for F
where
    F: Fn(&TelemetryEvent) + Send + Sync,
{
    fn on_event(&self, event: &TelemetryEvent) -> Result<(), SubscriberError> {
        self(event);
        Ok(())
    }
}

/// Logs every event at debug level
pub struct LoggingSubscriber;

impl TelemetrySubscriber for LoggingSubscriber {
    fn on_event(&self, event: &TelemetryEvent) -> Result<(), SubscriberError> {
        match event {
            TelemetryEvent::Alert(alert) => tracing::warn!(?alert, "telemetry_alert"),
            other => tracing::debug!(event = ?other, "telemetry_event"),
        }
        Ok(())
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetrySubscriber for ChannelSubscriber {
    fn on_event(&self, event: &TelemetryEvent) -> Result<(), SubscriberError> {
        self.tx
            .send(event.clone())
            .map_err(|_| SubscriberError("receiver dropped".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Ordered publish/subscribe hub
#[derive(Default)]
pub struct EventHub {
    subscribers: RwLock<Vec<(SubscriberId, Arc<dyn TelemetrySubscriber>)>>,
    next_id: AtomicU64,
    failures: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn TelemetrySubscriber>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Subscriber failures (errors and panics) since creation
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Notify every subscriber in order
    pub fn publish(&self, event: TelemetryEvent) {
        // Snapshot so a subscriber may (un)subscribe without deadlocking
        let subscribers: Vec<_> = self.subscribers.read().clone();

        for (id, subscriber) in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(subscriber = id.0, error = %e, "telemetry subscriber failed");
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(subscriber = id.0, "telemetry subscriber panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn underrun(tick: u64) -> TelemetryEvent {
        TelemetryEvent::Underrun {
            tick,
            fill: UnderrunFill::Silence,
        }
    }

    #[test]
    fn test_subscribers_notified_in_order() {
        let hub = EventHub::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            hub.subscribe(Arc::new(move |_: &TelemetryEvent| log.lock().push(name)));
        }
        hub.publish(underrun(1));

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_is_isolated() {
        struct Failing;
        impl TelemetrySubscriber for Failing {
            fn on_event(&self, _: &TelemetryEvent) -> Result<(), SubscriberError> {
                Err(SubscriberError("boom".into()))
            }
        }

        let hub = EventHub::new();
        let (channel, mut rx) = ChannelSubscriber::new();
        hub.subscribe(Arc::new(Failing));
        hub.subscribe(Arc::new(|_: &TelemetryEvent| panic!("subscriber bug")));
        hub.subscribe(Arc::new(channel));

        hub.publish(underrun(7));

        assert_eq!(rx.try_recv().unwrap(), underrun(7));
        assert_eq!(hub.failures(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let hub = EventHub::new();
        let (channel, mut rx) = ChannelSubscriber::new();
        let id = hub.subscribe(Arc::new(channel));
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));

        hub.publish(underrun(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(underrun(3)).unwrap();
        assert_eq!(json["type"], "underrun");
        assert_eq!(json["fill"], "silence");
    }
}
