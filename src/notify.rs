use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-location broadcast hub for lifecycle events. This is the seam to
/// the external notification dispatcher: the engine hands every
/// committed event here and moves on. Delivery is fire-and-forget — a
/// full or subscriber-less channel never fails a booking operation.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to lifecycle events for a location. Creates the
    /// channel if needed.
    pub fn subscribe(&self, location_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(location_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, location_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&location_id)
            && sender.send(event.clone()).is_err() {
                tracing::debug!("notify: no live subscribers for {location_id}");
            }
    }

    /// Remove a channel (e.g. when a location is deleted).
    #[allow(dead_code)]
    pub fn remove(&self, location_id: &Ulid) {
        self.channels.remove(location_id);
    }
}
