//! Real-time event fan-out.
//!
//! One broadcast topic per station plus a global topic. Delivery is
//! best-effort at-most-once: the channels are bounded, and a subscriber that
//! lags past the buffer observes `Lagged` and is dropped by the WebSocket
//! layer rather than slowing publishers down.

use crate::models::RecognitionMethod;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-subscriber buffer; slow consumers get dropped past this.
const DEFAULT_CAPACITY: usize = 256;

/// Wire form of every published message.
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Emitted when a play opens (`ended_at` unset, duration 0) and again when
/// it closes with the final figures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackDetectionEvent {
    pub station_id: Uuid,
    pub track_id: Uuid,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub confidence: f64,
    pub method: RecognitionMethod,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateEvent {
    pub active_stations: usize,
    pub total_tracks: i64,
    pub total_detections: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationErrorEvent {
    pub station_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    TrackDetection(TrackDetectionEvent),
    StatusUpdate(StatusUpdateEvent),
    StationError(StationErrorEvent),
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::TrackDetection(_) => "track_detection",
            Event::StatusUpdate(_) => "status_update",
            Event::StationError(_) => "station_error",
        }
    }

    fn station_id(&self) -> Option<Uuid> {
        match self {
            Event::TrackDetection(e) => Some(e.station_id),
            Event::StationError(e) => Some(e.station_id),
            Event::StatusUpdate(_) => None,
        }
    }

    fn to_wire(&self) -> WireMessage {
        let data = match self {
            Event::TrackDetection(e) => serde_json::to_value(e),
            Event::StatusUpdate(e) => serde_json::to_value(e),
            Event::StationError(e) => serde_json::to_value(e),
        }
        .unwrap_or(serde_json::Value::Null);
        WireMessage {
            kind: self.event_type(),
            timestamp: Utc::now(),
            data,
        }
    }
}

pub struct EventBus {
    global: broadcast::Sender<WireMessage>,
    stations: RwLock<HashMap<Uuid, broadcast::Sender<WireMessage>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (global, _) = broadcast::channel(capacity);
        Self {
            global,
            stations: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Publish to the global topic, and to the station topic when the event
    /// belongs to one. Send results are ignored: no subscribers is normal.
    pub fn publish(&self, event: &Event) {
        let message = event.to_wire();
        let _ = self.global.send(message.clone());

        if let Some(station_id) = event.station_id() {
            let stations = self.stations.read().expect("station topic lock poisoned");
            if let Some(topic) = stations.get(&station_id) {
                let _ = topic.send(message);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireMessage> {
        self.global.subscribe()
    }

    /// Subscribe to one station's topic, creating it on first use.
    pub fn subscribe_station(&self, station_id: Uuid) -> broadcast::Receiver<WireMessage> {
        {
            let stations = self.stations.read().expect("station topic lock poisoned");
            if let Some(topic) = stations.get(&station_id) {
                return topic.subscribe();
            }
        }
        let mut stations = self.stations.write().expect("station topic lock poisoned");
        stations
            .entry(station_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
