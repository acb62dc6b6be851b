//! Per-connection WebSocket handling and event dispatch.
//!
//! Each client holds one WebSocket to the relay. Events arrive as JSON
//! envelopes, are parsed into [`ClientEvent`], and dispatched on an explicit
//! match: at-most-once, in connection order, each handled to completion
//! before the next. Outbound events are queued on a per-connection channel
//! and drained by a dedicated send task, so registry fan-out never awaits the
//! socket.
//!
//! A malformed event is logged and ignored; nothing a single client sends can
//! affect other rooms or participants, and there is no event that terminates
//! the relay process.

use crate::registry::RoomRegistry;
use crate::RelayState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use huddle_common::model::ChatBroadcast;
use huddle_common::protocol::{ClientEvent, ServerEvent};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Handle a single client connection until it closes or drops.
async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.send_buffer);

    let mut conn = Connection::new(state.registry.clone(), tx);
    let connection_id = conn.id;
    tracing::debug!(connection = %connection_id, "Client connected");

    // Send task: drain the outbound queue onto the socket.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let max_event_bytes = state.config.max_event_bytes;
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if text.len() > max_event_bytes {
                    tracing::warn!(
                        connection = %connection_id,
                        bytes = text.len(),
                        "Ignoring oversized event"
                    );
                    continue;
                }
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => conn.dispatch(event).await,
                    Err(e) => {
                        tracing::debug!(connection = %connection_id, error = %e, "Ignoring malformed event");
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // A dropped connection without an explicit leave is still a leave.
    conn.hangup().await;
    send_task.abort();
    tracing::debug!(connection = %connection_id, "Client disconnected");
}

/// One client connection's dispatch state.
///
/// Tracks the room/participant association recorded at join time so that an
/// implicit disconnect can run the same cleanup as an explicit leave, and
/// run it exactly once.
pub(crate) struct Connection {
    pub(crate) id: Uuid,
    registry: Arc<RoomRegistry>,
    tx: mpsc::Sender<ServerEvent>,
    /// `(room_id, participant_id)` of the current registration, if any.
    membership: Option<(String, String)>,
}

impl Connection {
    pub(crate) fn new(registry: Arc<RoomRegistry>, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            tx,
            membership: None,
        }
    }

    pub(crate) async fn dispatch(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom {
                room_id,
                participant,
            } => {
                // A participant belongs to at most one room at a time: joining
                // a new room through the same connection leaves the old one.
                if let Some((old_room, old_user)) = self.membership.take() {
                    if old_room != room_id {
                        self.registry.leave(&old_room, &old_user, self.id).await;
                    }
                }

                let user_id = participant.id.clone();
                let roster = self
                    .registry
                    .join(&room_id, participant, self.id, self.tx.clone())
                    .await;
                self.membership = Some((room_id, user_id));

                // Always sent, empty roster included, so the joiner never has
                // to special-case silence.
                if self
                    .tx
                    .try_send(ServerEvent::ExistingParticipants(roster))
                    .is_err()
                {
                    tracing::warn!(connection = %self.id, "Failed to queue roster for joiner");
                }
            }

            ClientEvent::LeaveRoom { room_id, user_id } => {
                if self.registry.leave(&room_id, &user_id, self.id).await {
                    if self
                        .membership
                        .as_ref()
                        .is_some_and(|(r, u)| *r == room_id && *u == user_id)
                    {
                        self.membership = None;
                    }
                }
            }

            ClientEvent::Signal(message) => {
                tracing::debug!(
                    room = %message.room_id,
                    from = %message.from,
                    to = %message.to,
                    kind = ?message.kind,
                    "Relaying signal"
                );
                self.registry.forward_signal(message).await;
            }

            ClientEvent::ParticipantUpdate {
                room_id,
                participant,
            } => {
                self.registry.update_participant(&room_id, participant).await;
            }

            ClientEvent::Talking {
                room_id,
                user_id,
                is_talking,
            } => {
                self.registry.talking(&room_id, &user_id, is_talking).await;
            }

            ClientEvent::ChatMessage {
                room_id,
                user_id,
                user_name,
                message,
                timestamp,
            } => {
                let broadcast = ChatBroadcast {
                    id: Uuid::new_v4().to_string(),
                    user_id,
                    user_name,
                    message,
                    timestamp,
                };
                self.registry.chat(&room_id, broadcast).await;
            }
        }
    }

    /// Cleanup for a dropped connection: treat it as a leave for whatever
    /// room/participant this connection registered. Taking `membership`
    /// guarantees the cleanup runs at most once even if an explicit leave
    /// already happened.
    pub(crate) async fn hangup(&mut self) {
        if let Some((room_id, user_id)) = self.membership.take() {
            self.registry.leave(&room_id, &user_id, self.id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_common::model::Participant;
    use huddle_common::protocol::{SignalKind, SignalMessage};

    fn participant(id: &str) -> Participant {
        Participant::silent(id, format!("user {id}"))
    }

    fn connection(registry: &Arc<RoomRegistry>) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Connection::new(registry.clone(), tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn join(conn: &mut Connection, room: &str, user: &str) {
        conn.dispatch(ClientEvent::JoinRoom {
            room_id: room.into(),
            participant: participant(user),
        })
        .await;
    }

    #[tokio::test]
    async fn joiner_always_receives_a_roster_batch() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn_a, mut rx_a) = connection(&registry);
        join(&mut conn_a, "r1", "a").await;

        let events = drain(&mut rx_a);
        assert!(matches!(
            &events[..],
            [ServerEvent::ExistingParticipants(roster)] if roster.is_empty()
        ));
    }

    #[tokio::test]
    async fn two_client_signaling_scenario() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn_a, mut rx_a) = connection(&registry);
        let (mut conn_b, mut rx_b) = connection(&registry);

        join(&mut conn_a, "r1", "a").await;
        drain(&mut rx_a);

        join(&mut conn_b, "r1", "b").await;
        let b_events = drain(&mut rx_b);
        assert!(matches!(
            &b_events[..],
            [ServerEvent::ExistingParticipants(roster)] if roster.len() == 1 && roster[0].id == "a"
        ));
        let a_events = drain(&mut rx_a);
        assert!(matches!(
            &a_events[..],
            [ServerEvent::ParticipantJoined(p)] if p.id == "b"
        ));

        // A offers to B; the relay forwards it unchanged.
        let offer = SignalMessage {
            kind: SignalKind::Offer,
            data: serde_json::json!({"sdp": "v=0\r\n...", "type": "offer"}),
            from: "a".into(),
            to: "b".into(),
            room_id: "r1".into(),
        };
        conn_a.dispatch(ClientEvent::Signal(offer.clone())).await;
        let b_events = drain(&mut rx_b);
        match &b_events[..] {
            [ServerEvent::Signal(msg)] => {
                assert_eq!(msg.data, offer.data);
                assert_eq!(msg.from, "a");
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // B answers.
        conn_b
            .dispatch(ClientEvent::Signal(SignalMessage {
                kind: SignalKind::Answer,
                data: serde_json::json!({"sdp": "v=0\r\n...", "type": "answer"}),
                from: "b".into(),
                to: "a".into(),
                room_id: "r1".into(),
            }))
            .await;
        assert!(matches!(&drain(&mut rx_a)[..], [ServerEvent::Signal(m)] if m.kind == SignalKind::Answer));

        // B's transport drops: A hears participant-left exactly once.
        conn_b.hangup().await;
        let a_events = drain(&mut rx_a);
        assert!(matches!(
            &a_events[..],
            [ServerEvent::ParticipantLeft(id)] if id == "b"
        ));
    }

    #[tokio::test]
    async fn explicit_leave_then_disconnect_broadcasts_once() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn_a, mut rx_a) = connection(&registry);
        let (mut conn_b, _rx_b) = connection(&registry);

        join(&mut conn_a, "r1", "a").await;
        join(&mut conn_b, "r1", "b").await;
        drain(&mut rx_a);

        conn_b
            .dispatch(ClientEvent::LeaveRoom {
                room_id: "r1".into(),
                user_id: "b".into(),
            })
            .await;
        conn_b.hangup().await;

        let lefts: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::ParticipantLeft(id) if id == "b"))
            .collect();
        assert_eq!(lefts.len(), 1);
    }

    #[tokio::test]
    async fn disconnect_without_join_is_a_no_op() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn, _rx) = connection(&registry);
        conn.hangup().await;
        assert_eq!(registry.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn joining_a_second_room_leaves_the_first() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn_a, mut rx_a) = connection(&registry);
        let (mut conn_b, _rx_b) = connection(&registry);

        join(&mut conn_a, "r1", "a").await;
        join(&mut conn_b, "r1", "b").await;
        drain(&mut rx_a);

        join(&mut conn_b, "r2", "b").await;
        assert!(matches!(
            &drain(&mut rx_a)[..],
            [ServerEvent::ParticipantLeft(id)] if id == "b"
        ));
        assert!(registry.members("r1").await.iter().all(|p| p.id != "b"));
        assert_eq!(registry.members("r2").await.len(), 1);
    }

    #[tokio::test]
    async fn chat_is_stamped_and_echoed() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut conn_a, mut rx_a) = connection(&registry);
        join(&mut conn_a, "r1", "a").await;
        drain(&mut rx_a);

        conn_a
            .dispatch(ClientEvent::ChatMessage {
                room_id: "r1".into(),
                user_id: "a".into(),
                user_name: "user a".into(),
                message: "hi all".into(),
                timestamp: chrono::Utc::now(),
            })
            .await;

        let events = drain(&mut rx_a);
        match &events[..] {
            [ServerEvent::ChatMessage(msg)] => {
                assert_eq!(msg.message, "hi all");
                assert!(!msg.id.is_empty());
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }
}
