//! Lifecycle events for the control surface.
//!
//! The engine and its swarms report through an `event-sender -> listener`
//! model: components hold an [`EventSender`] and fire events; whoever
//! embeds the engine (an HTTP layer, a UI, a test) drains the receiving end
//! of the channel. Senders never block progress: a full channel drops the
//! event with a warning rather than stalling a swarm.
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use harbor_primitives::info_hash::InfoHash;
use tokio::sync::mpsc;
use tracing::warn;

use super::error::SwarmError;

const CHANNEL_BUFFER_SIZE: usize = 4096;

/// A lifecycle event. `info_hash` identifies the swarm concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Added { info_hash: InfoHash },
    Started { info_hash: InfoHash },
    /// Periodic progress report: completed fraction in `0.0..=1.0` and the
    /// current transfer speeds in bytes per second.
    Progress {
        info_hash: InfoHash,
        progress: f64,
        download_bps: u64,
        upload_bps: u64,
    },
    PieceComplete { info_hash: InfoHash, piece_index: u32 },
    /// The download finished; the swarm is now seeding.
    Done { info_hash: InfoHash },
    Paused { info_hash: InfoHash },
    Resumed { info_hash: InfoHash },
    Stopped { info_hash: InfoHash },
    Removed { info_hash: InfoHash },
    Error { info_hash: InfoHash, error: SwarmError },
}

/// A trait to allow sending lifecycle events.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait EventSender: Sync + Send {
    async fn send_event(&self, event: Event);
}

/// The channel-backed [`EventSender`] implementation.
pub struct Sender {
    sender: mpsc::Sender<Event>,
}

#[async_trait]
impl EventSender for Sender {
    async fn send_event(&self, event: Event) {
        if let Err(dropped) = self.sender.try_send(event) {
            warn!(event = ?dropped, "event listener is not keeping up; dropping");
        }
    }
}

/// An [`EventSender`] that discards everything, for embedders that do not
/// care and for tests.
pub struct NullSender;

#[async_trait]
impl EventSender for NullSender {
    async fn send_event(&self, _event: Event) {}
}

/// Creates the event channel: the sender side goes into the engine, the
/// receiver to the embedding layer.
#[must_use]
pub fn channel() -> (Arc<dyn EventSender>, mpsc::Receiver<Event>) {
    let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);

    (Arc::new(Sender { sender }), receiver)
}

#[cfg(test)]
mod tests {
    use harbor_primitives::info_hash::InfoHash;

    use super::{channel, Event, EventSender, NullSender};

    #[tokio::test]
    async fn events_should_reach_the_listener_in_order() {
        let (sender, mut receiver) = channel();
        let info_hash = InfoHash([1; 20]);

        sender.send_event(Event::Added { info_hash }).await;
        sender.send_event(Event::Started { info_hash }).await;

        assert_eq!(receiver.recv().await, Some(Event::Added { info_hash }));
        assert_eq!(receiver.recv().await, Some(Event::Started { info_hash }));
    }

    #[tokio::test]
    async fn a_full_channel_should_drop_rather_than_block() {
        let (sender, receiver) = channel();
        drop(receiver);

        // Must not hang.
        sender.send_event(Event::Added { info_hash: InfoHash([1; 20]) }).await;
    }

    #[tokio::test]
    async fn the_null_sender_should_swallow_everything() {
        NullSender
            .send_event(Event::Added { info_hash: InfoHash([1; 20]) })
            .await;
    }

    #[tokio::test]
    async fn the_sender_trait_should_be_mockable_for_component_tests() {
        let mut mock = super::MockEventSender::new();
        mock.expect_send_event().times(1).returning(|_| Box::pin(async {}));

        mock.send_event(Event::Added { info_hash: InfoHash([1; 20]) }).await;
    }
}
