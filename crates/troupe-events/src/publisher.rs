use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{
    EphemeralEnvelope, EphemeralEvent, PersistentEnvelope, PersistentEvent,
};

const ROOM_CAPACITY: usize = 256;

/// Per-conversation fan-out over two independent topics.
///
/// The ephemeral topic carries typing/stream/scheduler notices; the
/// persistent topic carries committed message mutations. Both are lossy
/// broadcast channels: publishing with no subscriber silently drops, and a
/// lagging subscriber loses the oldest events first. Ordering is preserved
/// per topic but not across topics — clients fence on `render_seq`.
pub struct Publisher {
    rooms: DashMap<String, Room>,
}

struct Room {
    ephemeral: broadcast::Sender<EphemeralEnvelope>,
    persistent: broadcast::Sender<PersistentEnvelope>,
}

impl Room {
    fn new() -> Self {
        let (ephemeral, _) = broadcast::channel(ROOM_CAPACITY);
        let (persistent, _) = broadcast::channel(ROOM_CAPACITY);
        Self {
            ephemeral,
            persistent,
        }
    }
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Subscribe to a conversation's ephemeral topic.
    pub fn subscribe_ephemeral(&self, conversation_id: &str) -> broadcast::Receiver<EphemeralEnvelope> {
        self.room(conversation_id).ephemeral.subscribe()
    }

    /// Subscribe to a conversation's persistent topic.
    pub fn subscribe_persistent(
        &self,
        conversation_id: &str,
    ) -> broadcast::Receiver<PersistentEnvelope> {
        self.room(conversation_id).persistent.subscribe()
    }

    /// Push an ephemeral event, stamped with the given revision fence.
    pub fn publish_ephemeral(&self, conversation_id: &str, render_seq: i64, event: EphemeralEvent) {
        trace!(conversation = conversation_id, render_seq, "ephemeral event");
        let _ = self.room(conversation_id).ephemeral.send(EphemeralEnvelope {
            conversation_id: conversation_id.to_string(),
            render_seq,
            event,
        });
    }

    /// Push a persistent (committed) timeline mutation.
    pub fn publish_persistent(&self, conversation_id: &str, render_seq: i64, event: PersistentEvent) {
        trace!(conversation = conversation_id, render_seq, "persistent event");
        let _ = self
            .room(conversation_id)
            .persistent
            .send(PersistentEnvelope {
                conversation_id: conversation_id.to_string(),
                render_seq,
                event,
            });
    }

    /// Drop a conversation's room (e.g. after deletion). Existing
    /// subscribers see their receiver close.
    pub fn drop_room(&self, conversation_id: &str) {
        self.rooms.remove(conversation_id);
    }

    fn room(&self, conversation_id: &str) -> dashmap::mapref::one::Ref<'_, String, Room> {
        if let Some(room) = self.rooms.get(conversation_id) {
            return room;
        }
        self.rooms
            .entry(conversation_id.to_string())
            .or_insert_with(Room::new)
            .downgrade()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_room_events_only() {
        let publisher = Publisher::new();
        let mut rx_a = publisher.subscribe_ephemeral("c-a");
        let mut rx_b = publisher.subscribe_ephemeral("c-b");

        publisher.publish_ephemeral(
            "c-a",
            1,
            EphemeralEvent::StreamComplete { run_id: "r-1".into() },
        );

        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.conversation_id, "c-a");
        assert_eq!(got.render_seq, 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let publisher = Publisher::new();
        // Must not panic or error.
        publisher.publish_persistent(
            "c-ghost",
            1,
            crate::types::PersistentEvent::Remove {
                dom_id: "message_1".into(),
            },
        );
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let publisher = Publisher::new();
        let mut eph = publisher.subscribe_ephemeral("c-a");
        let mut per = publisher.subscribe_persistent("c-a");

        publisher.publish_persistent(
            "c-a",
            2,
            crate::types::PersistentEvent::Append {
                dom_id: "message_9".into(),
                message: serde_json::json!({"content": "hi"}),
            },
        );

        assert!(eph.try_recv().is_err());
        let got = per.recv().await.unwrap();
        assert_eq!(got.render_seq, 2);
    }
}
