use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

use crate::model::{Event, OwnerId};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast of committed events, one channel per calendar owner.
///
/// The video-session collaborator listens here for new bookings and
/// answers with `Engine::assign_session_handle`.
pub struct NotifyHub {
    channels: DashMap<OwnerId, broadcast::Sender<Event>>,
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

    /// Subscribe to an owner's events. Creates the channel if needed.
    pub fn subscribe(&self, owner_id: OwnerId) -> broadcast::Receiver<Event> {
        self.channels
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// The owner's events as a stream. A subscriber that falls behind skips
    /// the events it missed and keeps going.
    pub fn events(&self, owner_id: OwnerId) -> BoxStream<'static, Event> {
        let rx = self.subscribe(owner_id);
        stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%owner_id, skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let owner_id = event.owner_id();
        let drop_channel = match self.channels.get(&owner_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        // every receiver is gone
        if drop_channel {
            self.channels
                .remove_if(&owner_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let owner = Ulid::new();
        let mut rx = hub.subscribe(owner);

        let event = Event::SlotCancelled {
            owner_id: owner,
            slot_id: Ulid::new(),
        };
        hub.send(&event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_owner_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(&Event::SlotCancelled {
            owner_id: Ulid::new(),
            slot_id: Ulid::new(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_stream_skips_lagged_events() {
        let hub = NotifyHub::new();
        let owner = Ulid::new();
        let mut events = hub.events(owner);

        let sent: Vec<Event> = (0..CHANNEL_CAPACITY + 3)
            .map(|_| Event::SlotCancelled {
                owner_id: owner,
                slot_id: Ulid::new(),
            })
            .collect();
        for event in &sent {
            hub.send(event);
        }

        // The oldest three were overwritten before the stream was polled.
        assert_eq!(events.next().await.as_ref(), Some(&sent[3]));
        assert_eq!(events.next().await.as_ref(), Some(&sent[4]));
    }

    #[tokio::test]
    async fn dropped_subscribers_release_channel() {
        let hub = NotifyHub::new();
        let owner = Ulid::new();
        drop(hub.subscribe(owner));
        assert_eq!(hub.channel_count(), 1);

        hub.send(&Event::SlotCancelled {
            owner_id: owner,
            slot_id: Ulid::new(),
        });
        assert_eq!(hub.channel_count(), 0);
    }
}
