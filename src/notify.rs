use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ResourceId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of ledger changes, one channel per resource.
pub struct NotifyHub {
    channels: DashMap<ResourceId, broadcast::Sender<Event>>,
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

    /// Subscribe to changes on a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: &str) -> broadcast::Receiver<Event> {
        self.channels
            .entry(resource_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event on its resource's channel. No-op if nobody ever subscribed.
    pub fn send(&self, event: &Event) {
        if let Some(sender) = self.channels.get(event.resource_id()) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn listener_count(&self, resource_id: &str) -> usize {
        self.channels
            .get(resource_id)
            .map_or(0, |s| s.receiver_count())
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("easter-brunch");

        let event = Event::AllocationReleased {
            id: Ulid::new(),
            resource_id: "easter-brunch".into(),
            released_at: 10,
        };
        hub.send(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_resources_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("a");
        hub.subscribe("b");
        hub.send(&Event::ResourceCreated {
            id: "b".into(),
            name: None,
            capacity: None,
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ResourceCreated {
            id: "quiet".into(),
            name: None,
            capacity: Some(1),
        });
        assert_eq!(hub.listener_count("quiet"), 0);
    }

    #[test]
    fn listener_count_tracks_receivers() {
        let hub = NotifyHub::new();
        let rx1 = hub.subscribe("r");
        let _rx2 = hub.subscribe("r");
        assert_eq!(hub.listener_count("r"), 2);
        drop(rx1);
        assert_eq!(hub.listener_count("r"), 1);
    }
}
