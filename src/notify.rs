use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed events, one channel per entity.
///
/// Consumers (request handlers, cache invalidation) subscribe by entity id;
/// outbound delivery to push services is their problem, not the engine's.
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
        Self { channels: DashMap::new() }
    }

    /// Subscribe to committed events for an entity. Creates the channel if
    /// needed.
    pub fn subscribe(&self, entity_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(entity_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a committed event. No-op if nobody is listening.
    pub fn send(&self, entity_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&entity_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop an entity's channel.
    pub fn remove(&self, entity_id: &Ulid) {
        self.channels.remove(entity_id);
    }
}
