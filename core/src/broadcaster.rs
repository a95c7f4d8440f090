//! # Topic-Tagged Event Broadcaster
//!
//! Fan-out sink for the observable state of the system: analyzer phasor and
//! waveform reports, sequence progress, GOOSE trip events and stream status.
//! Subscribers attach to a topic and receive structured `Event` payloads
//! over a bounded channel; a slow subscriber sees drops, never backpressure
//! into the real-time paths. Within one topic, events from a single
//! publisher arrive in order.
//!
//! External serialization (JSON over a WebSocket, for instance) is a
//! collaborator concern; payloads here are plain serde-serializable structs.

use crate::analyzer::{AnalysisFrame, WaveformData};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Events queued per subscriber before drops begin.
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

/// Well-known topic names.
pub mod topics {
    pub const ANALYZER_PHASORS: &str = "analyzer/phasors";
    pub const ANALYZER_WAVEFORMS: &str = "analyzer/waveforms";
    pub const ANALYZER_HARMONICS: &str = "analyzer/harmonics";
    pub const SEQUENCE_PROGRESS: &str = "sequence/progress";
    pub const GOOSE_EVENTS: &str = "goose/events";
    pub const STREAM_STATUS: &str = "stream/status";
}

/// Structured payloads carried by the broadcaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Phasors { frame: AnalysisFrame },
    #[serde(rename_all = "camelCase")]
    Harmonics { frame: AnalysisFrame },
    #[serde(rename_all = "camelCase")]
    Waveforms { waveforms: Vec<WaveformData> },
    #[serde(rename_all = "camelCase")]
    SequenceProgress {
        current_state: usize,
        total_states: usize,
        state_name: String,
        elapsed_sec: f64,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    GooseTrip {
        rule_name: String,
        expression: String,
        message: String,
        timestamp_us: u64,
    },
    #[serde(rename_all = "camelCase")]
    StreamStatus {
        stream_id: String,
        running: bool,
        message: String,
    },
}

/// Handle identifying one subscription for `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Topic-keyed fan-out of `Event`s.
pub struct EventBroadcaster {
    subscribers: Mutex<HashMap<String, Vec<(u64, SyncSender<Event>)>>>,
    next_id: Mutex<u64>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        EventBroadcaster {
            subscribers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Attaches a subscriber to `topic`.
    ///
    /// # Returns
    ///
    /// The subscription id and the receiving end of the bounded queue.
    /// Dropping the receiver also ends the subscription; the sender side is
    /// pruned on the next broadcast.
    pub fn subscribe(&self, topic: &str) -> (SubscriptionId, Receiver<Event>) {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        (SubscriptionId(id), rx)
    }

    /// Detaches one subscriber from `topic`.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut map = self.subscribers.lock().unwrap();
        if let Some(list) = map.get_mut(topic) {
            list.retain(|(sub_id, _)| *sub_id != id.0);
            if list.is_empty() {
                map.remove(topic);
            }
        }
    }

    /// Delivers `event` to every subscriber of `topic`, best effort.
    ///
    /// A full queue drops this event for that subscriber; a disconnected
    /// receiver removes the subscription.
    pub fn broadcast(&self, topic: &str, event: Event) {
        let mut map = self.subscribers.lock().unwrap();
        if let Some(list) = map.get_mut(topic) {
            list.retain(|(_, tx)| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            });
            if list.is_empty() {
                map.remove(topic);
            }
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(topic)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status_event(n: usize) -> Event {
        Event::StreamStatus {
            stream_id: format!("s{}", n),
            running: true,
            message: String::new(),
        }
    }

    #[test]
    fn test_broadcast_reaches_topic_subscribers_only() {
        let bus = EventBroadcaster::new();
        let (_id_a, rx_a) = bus.subscribe(topics::STREAM_STATUS);
        let (_id_b, rx_b) = bus.subscribe(topics::GOOSE_EVENTS);

        bus.broadcast(topics::STREAM_STATUS, status_event(1));

        assert!(rx_a.recv_timeout(Duration::from_millis(100)).is_ok());
        assert!(rx_b.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_per_topic_ordering() {
        let bus = EventBroadcaster::new();
        let (_id, rx) = bus.subscribe(topics::STREAM_STATUS);
        for n in 0..10 {
            bus.broadcast(topics::STREAM_STATUS, status_event(n));
        }
        for n in 0..10 {
            match rx.recv_timeout(Duration::from_millis(100)).unwrap() {
                Event::StreamStatus { stream_id, .. } => {
                    assert_eq!(stream_id, format!("s{}", n));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_slow_subscriber_drops_not_blocks() {
        let bus = EventBroadcaster::new();
        let (_id, rx) = bus.subscribe(topics::STREAM_STATUS);
        // Never drained: flood past the queue depth and confirm broadcast
        // still returns.
        for n in 0..(SUBSCRIBER_QUEUE_DEPTH + 50) {
            bus.broadcast(topics::STREAM_STATUS, status_event(n));
        }
        // The queue holds exactly its depth; the rest were dropped.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_QUEUE_DEPTH);
    }

    #[test]
    fn test_unsubscribe_and_disconnect_prune() {
        let bus = EventBroadcaster::new();
        let (id, rx) = bus.subscribe(topics::STREAM_STATUS);
        assert_eq!(bus.subscriber_count(topics::STREAM_STATUS), 1);

        bus.unsubscribe(topics::STREAM_STATUS, id);
        assert_eq!(bus.subscriber_count(topics::STREAM_STATUS), 0);

        let (_id2, rx2) = bus.subscribe(topics::STREAM_STATUS);
        drop(rx2);
        drop(rx);
        bus.broadcast(topics::STREAM_STATUS, status_event(0));
        assert_eq!(bus.subscriber_count(topics::STREAM_STATUS), 0);
    }
}
