//! The room session: one local participant's view of a room.
//!
//! A single actor task owns the per-peer state map; commands from the public
//! handle, relay traffic, and engine callbacks all funnel into it through
//! channels, so every mutation of the peer map and of a link's senders is
//! serialized. Slow work (engine connection setup, offer/answer creation)
//! runs in spawned per-peer tasks that post their results back, so one peer's
//! slow negotiation never blocks starting negotiation with another.
//!
//! Per remote peer the session tracks a small state machine: absent from the
//! map (never seen, or already torn down), then `Connecting` once an offer or
//! answer has been sent, then `Connected` once the transport is up, then
//! removed again when the peer leaves or fails. A closed relationship is
//! irreversible; a re-join creates a wholly new link.

use crate::engine::{MediaIntent, PeerConnector, PeerEvent, PeerLink, PeerUpdate, SignalPayload, VideoFeed};
use crate::error::{ClientError, Result};
use crate::signaling::{LinkEvent, RelayLink};
use huddle_common::model::{ChatBroadcast, Participant};
use huddle_common::protocol::{ClientEvent, ServerEvent, SignalKind, SignalMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Where one remote peer's negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Offer sent (or answer sent), waiting for the transport to come up.
    Connecting,
    /// Media is flowing.
    Connected,
    /// The relationship is over: peer left, failed, or we left.
    Closed,
}

/// Identity and initial capability flags for the local participant.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    /// Stable per app session; generate once and cache, don't re-generate
    /// per join.
    pub user_id: String,
    pub user_name: String,
    pub avatar: Option<String>,
    pub audio_on: bool,
    pub video_on: bool,
}

impl SessionConfig {
    /// Config with a freshly generated participant id and media on.
    pub fn new(room_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: Uuid::new_v4().to_string(),
            user_name: user_name.into(),
            avatar: None,
            audio_on: true,
            video_on: true,
        }
    }
}

/// What the session reports to the embedding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The room was joined (or re-joined); here is everyone already present.
    Joined { roster: Vec<Participant> },
    ParticipantJoined(Participant),
    /// Payload is the participant id.
    ParticipantLeft(String),
    ParticipantUpdated(Participant),
    /// A peer relationship changed phase.
    PeerPhase { user_id: String, phase: PeerPhase },
    Talking { user_id: String, is_talking: bool },
    Chat(ChatBroadcast),
    /// The relay link dropped; peer state has been discarded and a reconnect
    /// is underway.
    Reconnecting { attempt: u32 },
    /// The session is over: explicit leave or the link gave up.
    Left,
}

enum Command {
    ToggleAudio,
    ToggleVideo,
    ToggleScreenShare,
    SetTalking(bool),
    SendChat(String),
    Leave,
}

/// Handle to a running room session.
///
/// Cheap to clone indirectly via [`RoomSession::subscribe`]; the session ends
/// when [`RoomSession::leave`] is called or the relay link is lost for good.
pub struct RoomSession {
    cmd_tx: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl RoomSession {
    /// Connect to the relay and join the configured room.
    ///
    /// Joining proceeds even when local media is unavailable: pass a config
    /// with the failed capabilities off and the session joins silent,
    /// still receiving remote streams.
    pub fn connect(
        relay_url: &str,
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (link, link_rx) = RelayLink::connect(relay_url);
        Self::with_link(link, link_rx, config, connector)
    }

    /// Run a session over an already established link. Used by tests and by
    /// callers that manage the link themselves.
    pub fn with_link(
        link: RelayLink,
        link_rx: mpsc::Receiver<LinkEvent>,
        config: SessionConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);
        let (peer_tx, peer_rx) = mpsc::channel(256);
        let (setup_tx, setup_rx) = mpsc::channel(32);

        let actor = SessionActor {
            audio_on: config.audio_on,
            video_on: config.video_on,
            screen_sharing: false,
            config,
            link,
            connector,
            peers: HashMap::new(),
            roster: HashMap::new(),
            pending_candidates: HashMap::new(),
            events: events.clone(),
            peer_tx,
            setup_tx,
        };
        tokio::spawn(actor.run(cmd_rx, link_rx, peer_rx, setup_rx));

        Self { cmd_tx, events }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn toggle_audio(&self) -> Result<()> {
        self.send(Command::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<()> {
        self.send(Command::ToggleVideo).await
    }

    pub async fn toggle_screen_share(&self) -> Result<()> {
        self.send(Command::ToggleScreenShare).await
    }

    /// Publish the local speaking indicator (from voice activity detection).
    pub async fn set_talking(&self, is_talking: bool) -> Result<()> {
        self.send(Command::SetTalking(is_talking)).await
    }

    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        self.send(Command::SendChat(message.into())).await
    }

    /// Leave the room: every peer connection is closed before the leave is
    /// announced, and no further signals are sent for this room.
    pub async fn leave(&self) -> Result<()> {
        self.send(Command::Leave).await
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}

/// Result of a spawned per-peer negotiation task.
enum Negotiated {
    /// We initiated: the link exists and the offer is ready to relay.
    OfferReady {
        remote_id: String,
        link: Arc<dyn PeerLink>,
        offer: SignalPayload,
    },
    /// The remote initiated: the link exists and our answer is ready.
    AnswerReady {
        remote_id: String,
        link: Arc<dyn PeerLink>,
        answer: SignalPayload,
    },
    Failed {
        remote_id: String,
        error: ClientError,
    },
}

struct Peer {
    link: Arc<dyn PeerLink>,
    phase: PeerPhase,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

struct SessionActor {
    config: SessionConfig,
    link: RelayLink,
    connector: Arc<dyn PeerConnector>,
    /// Remote id to live peer link. Absence means "unknown or closed".
    peers: HashMap<String, Peer>,
    /// Remote participants currently believed to be in the room.
    roster: HashMap<String, Participant>,
    /// ICE candidates that arrived before their peer's link existed.
    pending_candidates: HashMap<String, Vec<SignalPayload>>,
    audio_on: bool,
    video_on: bool,
    screen_sharing: bool,
    events: broadcast::Sender<SessionEvent>,
    peer_tx: mpsc::Sender<PeerUpdate>,
    setup_tx: mpsc::Sender<Negotiated>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
        mut peer_rx: mpsc::Receiver<PeerUpdate>,
        mut setup_rx: mpsc::Receiver<Negotiated>,
    ) {
        loop {
            let flow = tokio::select! {
                Some(cmd) = cmd_rx.recv() => self.handle_command(cmd).await,
                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
                Some(update) = peer_rx.recv() => { self.handle_peer_update(update).await; Flow::Continue }
                Some(done) = setup_rx.recv() => { self.handle_negotiated(done).await; Flow::Continue }
                else => Flow::Stop,
            };
            if flow == Flow::Stop {
                break;
            }
        }
        tracing::debug!(room = %self.config.room_id, "Session actor stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn local_participant(&self) -> Participant {
        Participant {
            id: self.config.user_id.clone(),
            name: self.config.user_name.clone(),
            avatar: self.config.avatar.clone(),
            is_screen_sharing: self.screen_sharing,
            is_video_on: self.video_on,
            is_audio_on: self.audio_on,
        }
    }

    fn video_feed(&self) -> VideoFeed {
        if self.screen_sharing {
            VideoFeed::Screen
        } else if self.video_on {
            VideoFeed::Camera
        } else {
            VideoFeed::Off
        }
    }

    fn media_intent(&self) -> MediaIntent {
        MediaIntent {
            audio: self.audio_on,
            video: self.video_feed(),
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Connected => {
                let join = ClientEvent::JoinRoom {
                    room_id: self.config.room_id.clone(),
                    participant: self.local_participant(),
                };
                if self.link.send(join).await.is_err() {
                    tracing::warn!("Failed to queue join-room");
                }
                Flow::Continue
            }
            LinkEvent::Event(event) => {
                self.handle_server_event(event).await;
                Flow::Continue
            }
            LinkEvent::Reconnecting { attempt } => {
                // Everything negotiated through the old relay connection is
                // stale; the re-join starts from a clean slate.
                self.teardown_peers().await;
                self.emit(SessionEvent::Reconnecting { attempt });
                Flow::Continue
            }
            LinkEvent::Closed => {
                self.teardown_peers().await;
                self.emit(SessionEvent::Left);
                Flow::Stop
            }
        }
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::ExistingParticipants(roster) => {
                for participant in &roster {
                    if participant.id == self.config.user_id {
                        continue;
                    }
                    self.roster
                        .insert(participant.id.clone(), participant.clone());
                    // The joiner initiates toward everyone already present.
                    self.start_offer(&participant.id);
                }
                self.emit(SessionEvent::Joined { roster });
            }

            ServerEvent::ParticipantJoined(participant) => {
                if participant.id == self.config.user_id {
                    return;
                }
                self.roster
                    .insert(participant.id.clone(), participant.clone());
                // No offer from this side: the joiner offers to us.
                self.emit(SessionEvent::ParticipantJoined(participant));
            }

            ServerEvent::ParticipantLeft(user_id) => {
                self.roster.remove(&user_id);
                self.pending_candidates.remove(&user_id);
                if let Some(peer) = self.peers.remove(&user_id) {
                    peer.link.close().await;
                    self.emit(SessionEvent::PeerPhase {
                        user_id: user_id.clone(),
                        phase: PeerPhase::Closed,
                    });
                }
                self.emit(SessionEvent::ParticipantLeft(user_id));
            }

            ServerEvent::Signal(message) => self.handle_signal(message).await,

            ServerEvent::ParticipantUpdated(update) => {
                match self.roster.get_mut(&update.id) {
                    Some(existing) => existing.apply_flags(&update),
                    None => {
                        self.roster.insert(update.id.clone(), update.clone());
                    }
                }
                self.emit(SessionEvent::ParticipantUpdated(update));
            }

            ServerEvent::Talking {
                user_id,
                is_talking,
                ..
            } => {
                self.emit(SessionEvent::Talking {
                    user_id,
                    is_talking,
                });
            }

            ServerEvent::ChatMessage(message) => {
                self.emit(SessionEvent::Chat(message));
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        let from = message.from.clone();
        match message.kind {
            SignalKind::Offer => {
                // An offer can reference a peer we have never heard of (it
                // raced ahead of participant-joined): remember a placeholder
                // so the rest of the machinery treats it as present.
                self.roster
                    .entry(from.clone())
                    .or_insert_with(|| Participant::silent(from.clone(), from.clone()));

                if let Some(peer) = self.peers.get(&from) {
                    // Renegotiation on the existing link.
                    self.spawn_answer(from, Some(Arc::clone(&peer.link)), message.data);
                } else {
                    self.spawn_answer(from, None, message.data);
                }
            }

            SignalKind::Answer => {
                let Some(peer) = self.peers.get(&from) else {
                    tracing::debug!(peer = %from, "Dropping answer for unknown peer");
                    return;
                };
                if let Err(e) = peer.link.accept_answer(message.data).await {
                    tracing::warn!(peer = %from, error = %e, "Failed to apply answer");
                }
            }

            SignalKind::IceCandidate => {
                // Candidates may arrive before the answer, or before the link
                // even exists. Order must not be assumed.
                match self.peers.get(&from) {
                    Some(peer) => {
                        if let Err(e) = peer.link.add_ice_candidate(message.data).await {
                            // Loss of a single candidate is tolerable; more
                            // keep trickling in.
                            tracing::warn!(peer = %from, error = %e, "Failed to add ICE candidate");
                        }
                    }
                    None => {
                        self.pending_candidates
                            .entry(from)
                            .or_default()
                            .push(message.data);
                    }
                }
            }
        }
    }

    /// Create a link toward `remote_id` and offer to it, off the actor loop.
    fn start_offer(&mut self, remote_id: &str) {
        if self.peers.contains_key(remote_id) {
            return;
        }
        let connector = Arc::clone(&self.connector);
        let intent = self.media_intent();
        let peer_tx = self.peer_tx.clone();
        let setup_tx = self.setup_tx.clone();
        let remote_id = remote_id.to_owned();
        tokio::spawn(async move {
            let result = async {
                let link = connector.connect(&remote_id, intent, peer_tx).await?;
                let offer = link.create_offer().await?;
                Ok::<_, ClientError>((link, offer))
            }
            .await;
            let done = match result {
                Ok((link, offer)) => Negotiated::OfferReady {
                    remote_id,
                    link,
                    offer,
                },
                Err(error) => Negotiated::Failed { remote_id, error },
            };
            let _ = setup_tx.send(done).await;
        });
    }

    /// Answer an incoming offer, creating the link first when needed.
    fn spawn_answer(
        &self,
        remote_id: String,
        existing: Option<Arc<dyn PeerLink>>,
        offer: SignalPayload,
    ) {
        let connector = Arc::clone(&self.connector);
        let intent = self.media_intent();
        let peer_tx = self.peer_tx.clone();
        let setup_tx = self.setup_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let link = match existing {
                    Some(link) => link,
                    None => connector.connect(&remote_id, intent, peer_tx).await?,
                };
                let answer = link.accept_offer(offer).await?;
                Ok::<_, ClientError>((link, answer))
            }
            .await;
            let done = match result {
                Ok((link, answer)) => Negotiated::AnswerReady {
                    remote_id,
                    link,
                    answer,
                },
                Err(error) => Negotiated::Failed { remote_id, error },
            };
            let _ = setup_tx.send(done).await;
        });
    }

    async fn handle_negotiated(&mut self, done: Negotiated) {
        match done {
            Negotiated::OfferReady {
                remote_id,
                link,
                offer,
            } => {
                self.install_link(remote_id, link, SignalKind::Offer, offer)
                    .await;
            }
            Negotiated::AnswerReady {
                remote_id,
                link,
                answer,
            } => {
                self.install_link(remote_id, link, SignalKind::Answer, answer)
                    .await;
            }
            Negotiated::Failed { remote_id, error } => {
                // Isolated to this peer relationship; everyone else proceeds.
                tracing::warn!(peer = %remote_id, error = %error, "Peer negotiation failed");
                self.pending_candidates.remove(&remote_id);
            }
        }
    }

    /// Put a freshly negotiated link into the map, flush buffered candidates,
    /// and relay the handshake payload.
    async fn install_link(
        &mut self,
        remote_id: String,
        link: Arc<dyn PeerLink>,
        kind: SignalKind,
        payload: SignalPayload,
    ) {
        if !self.roster.contains_key(&remote_id) {
            // The peer left while negotiation was in flight.
            link.close().await;
            return;
        }

        self.peers.insert(
            remote_id.clone(),
            Peer {
                link: Arc::clone(&link),
                phase: PeerPhase::Connecting,
            },
        );

        if let Some(buffered) = self.pending_candidates.remove(&remote_id) {
            for candidate in buffered {
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    tracing::warn!(peer = %remote_id, error = %e, "Failed to add buffered ICE candidate");
                }
            }
        }

        self.send_signal(kind, payload, &remote_id).await;
        self.emit(SessionEvent::PeerPhase {
            user_id: remote_id,
            phase: PeerPhase::Connecting,
        });
    }

    async fn handle_peer_update(&mut self, update: PeerUpdate) {
        let PeerUpdate { remote_id, event } = update;
        match event {
            PeerEvent::IceCandidate(candidate) => {
                // Candidates can be gathered before the link lands in the
                // map; what matters is that the peer is still in the room.
                if self.roster.contains_key(&remote_id) {
                    self.send_signal(SignalKind::IceCandidate, candidate, &remote_id)
                        .await;
                }
            }
            PeerEvent::Connected => {
                if let Some(peer) = self.peers.get_mut(&remote_id) {
                    peer.phase = PeerPhase::Connected;
                    self.emit(SessionEvent::PeerPhase {
                        user_id: remote_id,
                        phase: PeerPhase::Connected,
                    });
                }
            }
            PeerEvent::Failed => {
                if let Some(peer) = self.peers.remove(&remote_id) {
                    tracing::warn!(peer = %remote_id, "Peer connection failed");
                    peer.link.close().await;
                    self.emit(SessionEvent::PeerPhase {
                        user_id: remote_id,
                        phase: PeerPhase::Closed,
                    });
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::ToggleAudio => {
                self.audio_on = !self.audio_on;
                let enabled = self.audio_on;
                for (id, peer) in &self.peers {
                    if let Err(e) = peer.link.set_audio(enabled).await {
                        tracing::warn!(peer = %id, error = %e, "Audio track replace failed");
                    }
                }
                self.announce_flags().await;
            }
            Command::ToggleVideo => {
                self.video_on = !self.video_on;
                self.replace_video().await;
                self.announce_flags().await;
            }
            Command::ToggleScreenShare => {
                self.screen_sharing = !self.screen_sharing;
                self.replace_video().await;
                self.announce_flags().await;
            }
            Command::SetTalking(is_talking) => {
                let event = ClientEvent::Talking {
                    room_id: self.config.room_id.clone(),
                    user_id: self.config.user_id.clone(),
                    is_talking,
                };
                if self.link.send(event).await.is_err() {
                    tracing::debug!("Talking update dropped, link down");
                }
            }
            Command::SendChat(message) => {
                let event = ClientEvent::ChatMessage {
                    room_id: self.config.room_id.clone(),
                    user_id: self.config.user_id.clone(),
                    user_name: self.config.user_name.clone(),
                    message,
                    timestamp: chrono::Utc::now(),
                };
                if self.link.send(event).await.is_err() {
                    tracing::debug!("Chat message dropped, link down");
                }
            }
            Command::Leave => {
                // Close everything before announcing the leave; nothing more
                // is sent for this room afterwards.
                self.teardown_peers().await;
                let event = ClientEvent::LeaveRoom {
                    room_id: self.config.room_id.clone(),
                    user_id: self.config.user_id.clone(),
                };
                let _ = self.link.send(event).await;
                self.emit(SessionEvent::Left);
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Swap the video feed on every live link. Peers without a link yet are
    /// no-ops: their initial attachment will reflect the current flags.
    async fn replace_video(&mut self) {
        let feed = self.video_feed();
        for (id, peer) in &self.peers {
            if let Err(e) = peer.link.set_video(feed).await {
                tracing::warn!(peer = %id, error = %e, "Video track replace failed");
            }
        }
    }

    async fn announce_flags(&mut self) {
        let event = ClientEvent::ParticipantUpdate {
            room_id: self.config.room_id.clone(),
            participant: self.local_participant(),
        };
        if self.link.send(event).await.is_err() {
            tracing::debug!("Participant update dropped, link down");
        }
    }

    async fn send_signal(&self, kind: SignalKind, data: SignalPayload, to: &str) {
        let message = SignalMessage {
            kind,
            data,
            from: self.config.user_id.clone(),
            to: to.to_owned(),
            room_id: self.config.room_id.clone(),
        };
        if self.link.send(ClientEvent::Signal(message)).await.is_err() {
            tracing::debug!(to = %to, "Signal dropped, link down");
        }
    }

    async fn teardown_peers(&mut self) {
        for (user_id, peer) in self.peers.drain() {
            peer.link.close().await;
            let _ = self.events.send(SessionEvent::PeerPhase {
                user_id,
                phase: PeerPhase::Closed,
            });
        }
        self.pending_candidates.clear();
        self.roster.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Engine stand-in that records operations per peer and lets tests
    /// inject engine events through the captured sender.
    struct MockConnector {
        ops: Arc<Mutex<Vec<String>>>,
        fail_for: Option<String>,
        peer_events: Arc<Mutex<Option<mpsc::Sender<PeerUpdate>>>>,
    }

    impl MockConnector {
        fn new() -> Self {
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                fail_for: None,
                peer_events: Arc::new(Mutex::new(None)),
            }
        }

        fn failing_for(remote_id: &str) -> Self {
            Self {
                fail_for: Some(remote_id.to_owned()),
                ..Self::new()
            }
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn events_sender(&self) -> mpsc::Sender<PeerUpdate> {
            self.peer_events.lock().unwrap().clone().expect("no link created yet")
        }
    }

    #[async_trait::async_trait]
    impl PeerConnector for MockConnector {
        async fn connect(
            &self,
            remote_id: &str,
            _intent: MediaIntent,
            events: mpsc::Sender<PeerUpdate>,
        ) -> Result<Arc<dyn PeerLink>> {
            if self.fail_for.as_deref() == Some(remote_id) {
                return Err(ClientError::Other(format!("no route to {remote_id}")));
            }
            *self.peer_events.lock().unwrap() = Some(events);
            self.ops.lock().unwrap().push(format!("connect:{remote_id}"));
            Ok(Arc::new(MockLink {
                remote_id: remote_id.to_owned(),
                ops: Arc::clone(&self.ops),
                closed: AtomicBool::new(false),
            }))
        }
    }

    struct MockLink {
        remote_id: String,
        ops: Arc<Mutex<Vec<String>>>,
        closed: AtomicBool,
    }

    impl MockLink {
        fn record(&self, op: &str) {
            self.ops.lock().unwrap().push(format!("{op}:{}", self.remote_id));
        }
    }

    #[async_trait::async_trait]
    impl PeerLink for MockLink {
        async fn create_offer(&self) -> Result<SignalPayload> {
            self.record("offer");
            Ok(serde_json::json!({"sdp": format!("offer-for-{}", self.remote_id)}))
        }

        async fn accept_offer(&self, _offer: SignalPayload) -> Result<SignalPayload> {
            self.record("answer");
            Ok(serde_json::json!({"sdp": format!("answer-for-{}", self.remote_id)}))
        }

        async fn accept_answer(&self, _answer: SignalPayload) -> Result<()> {
            self.record("accept_answer");
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: SignalPayload) -> Result<()> {
            self.record("candidate");
            Ok(())
        }

        async fn set_audio(&self, enabled: bool) -> Result<()> {
            self.record(if enabled { "audio_on" } else { "audio_off" });
            Ok(())
        }

        async fn set_video(&self, feed: VideoFeed) -> Result<()> {
            self.record(&format!("video_{feed:?}").to_lowercase());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.record("close");
        }
    }

    struct Harness {
        session: RoomSession,
        out_rx: mpsc::Receiver<ClientEvent>,
        link_tx: mpsc::Sender<LinkEvent>,
        events: broadcast::Receiver<SessionEvent>,
        connector: Arc<MockConnector>,
    }

    fn harness_with(connector: MockConnector) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (link_tx, link_rx) = mpsc::channel(64);
        let connector = Arc::new(connector);
        let config = SessionConfig {
            room_id: "r1".into(),
            user_id: "me".into(),
            user_name: "Local".into(),
            avatar: None,
            audio_on: true,
            video_on: true,
        };
        let session = RoomSession::with_link(
            RelayLink::from_parts(out_tx),
            link_rx,
            config,
            connector.clone() as Arc<dyn PeerConnector>,
        );
        let events = session.subscribe();
        Harness {
            session,
            out_rx,
            link_tx,
            events,
            connector,
        }
    }

    fn harness() -> Harness {
        harness_with(MockConnector::new())
    }

    async fn recv_out(h: &mut Harness) -> ClientEvent {
        timeout(Duration::from_secs(1), h.out_rx.recv())
            .await
            .expect("timed out waiting for outbound event")
            .expect("outbound channel closed")
    }

    async fn recv_event(h: &mut Harness) -> SessionEvent {
        timeout(Duration::from_secs(1), h.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    fn remote(id: &str) -> Participant {
        Participant::silent(id, format!("user {id}"))
    }

    async fn connect_and_join(h: &mut Harness, roster: Vec<Participant>) {
        h.link_tx.send(LinkEvent::Connected).await.unwrap();
        let out = recv_out(h).await;
        assert!(matches!(out, ClientEvent::JoinRoom { ref room_id, .. } if room_id == "r1"));
        h.link_tx
            .send(LinkEvent::Event(ServerEvent::ExistingParticipants(roster)))
            .await
            .unwrap();
    }

    /// Pump the offer flow for one roster peer until the offer signal is on
    /// the wire.
    async fn expect_offer(h: &mut Harness, to: &str) {
        let out = recv_out(h).await;
        match out {
            ClientEvent::Signal(msg) => {
                assert_eq!(msg.kind, SignalKind::Offer);
                assert_eq!(msg.to, to);
                assert_eq!(msg.from, "me");
            }
            other => panic!("expected offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn joining_offers_to_each_existing_participant() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;

        assert!(matches!(recv_event(&mut h).await, SessionEvent::Joined { roster } if roster.len() == 1));
        expect_offer(&mut h, "b").await;

        let ops = h.connector.ops();
        assert!(ops.contains(&"connect:b".to_string()));
        assert!(ops.contains(&"offer:b".to_string()));
    }

    #[tokio::test]
    async fn a_later_joiner_gets_no_offer_from_us() {
        let mut h = harness();
        connect_and_join(&mut h, vec![]).await;
        let _ = recv_event(&mut h).await; // Joined

        h.link_tx
            .send(LinkEvent::Event(ServerEvent::ParticipantJoined(remote("c"))))
            .await
            .unwrap();
        assert!(matches!(
            recv_event(&mut h).await,
            SessionEvent::ParticipantJoined(p) if p.id == "c"
        ));

        // The joiner initiates; we only answer. Nothing should go out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.out_rx.try_recv().is_err());
        assert!(h.connector.ops().is_empty());
    }

    #[tokio::test]
    async fn incoming_offer_is_answered() {
        let mut h = harness();
        connect_and_join(&mut h, vec![]).await;

        h.link_tx
            .send(LinkEvent::Event(ServerEvent::ParticipantJoined(remote("c"))))
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Event(ServerEvent::Signal(SignalMessage {
                kind: SignalKind::Offer,
                data: serde_json::json!({"sdp": "offer-from-c"}),
                from: "c".into(),
                to: "me".into(),
                room_id: "r1".into(),
            })))
            .await
            .unwrap();

        let out = recv_out(&mut h).await;
        match out {
            ClientEvent::Signal(msg) => {
                assert_eq!(msg.kind, SignalKind::Answer);
                assert_eq!(msg.to, "c");
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidates_arriving_before_the_link_are_buffered_then_flushed() {
        let mut h = harness();
        connect_and_join(&mut h, vec![]).await;

        // Candidate races ahead of the offer from an unknown peer.
        h.link_tx
            .send(LinkEvent::Event(ServerEvent::Signal(SignalMessage {
                kind: SignalKind::IceCandidate,
                data: serde_json::json!({"candidate": "early"}),
                from: "d".into(),
                to: "me".into(),
                room_id: "r1".into(),
            })))
            .await
            .unwrap();
        h.link_tx
            .send(LinkEvent::Event(ServerEvent::Signal(SignalMessage {
                kind: SignalKind::Offer,
                data: serde_json::json!({"sdp": "offer-from-d"}),
                from: "d".into(),
                to: "me".into(),
                room_id: "r1".into(),
            })))
            .await
            .unwrap();

        let out = recv_out(&mut h).await;
        assert!(matches!(out, ClientEvent::Signal(m) if m.kind == SignalKind::Answer));

        let ops = h.connector.ops();
        let answer_pos = ops.iter().position(|o| o == "answer:d").unwrap();
        let cand_pos = ops.iter().position(|o| o == "candidate:d").unwrap();
        // The buffered candidate lands on the link right after negotiation.
        assert!(cand_pos > answer_pos);
    }

    #[tokio::test]
    async fn participant_left_closes_the_peer_connection() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.link_tx
            .send(LinkEvent::Event(ServerEvent::ParticipantLeft("b".into())))
            .await
            .unwrap();

        // Drain events until the leave shows up; the close must precede it.
        loop {
            match recv_event(&mut h).await {
                SessionEvent::ParticipantLeft(id) => {
                    assert_eq!(id, "b");
                    break;
                }
                _ => continue,
            }
        }
        assert!(h.connector.ops().contains(&"close:b".to_string()));
    }

    #[tokio::test]
    async fn engine_connected_event_moves_the_peer_to_connected() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.connector
            .events_sender()
            .send(PeerUpdate {
                remote_id: "b".into(),
                event: PeerEvent::Connected,
            })
            .await
            .unwrap();

        loop {
            if let SessionEvent::PeerPhase { user_id, phase } = recv_event(&mut h).await {
                if phase == PeerPhase::Connected {
                    assert_eq!(user_id, "b");
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn locally_gathered_candidates_are_relayed() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.connector
            .events_sender()
            .send(PeerUpdate {
                remote_id: "b".into(),
                event: PeerEvent::IceCandidate(serde_json::json!({"candidate": "local-1"})),
            })
            .await
            .unwrap();

        let out = recv_out(&mut h).await;
        match out {
            ClientEvent::Signal(msg) => {
                assert_eq!(msg.kind, SignalKind::IceCandidate);
                assert_eq!(msg.to, "b");
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn toggling_video_replaces_the_track_once_per_live_peer() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b"), remote("c")]).await;
        // Two offers go out, order unspecified.
        for _ in 0..2 {
            let out = recv_out(&mut h).await;
            assert!(matches!(out, ClientEvent::Signal(m) if m.kind == SignalKind::Offer));
        }

        h.session.toggle_video().await.unwrap();
        let out = recv_out(&mut h).await;
        match out {
            ClientEvent::ParticipantUpdate { participant, .. } => {
                assert!(!participant.is_video_on);
            }
            other => panic!("expected participant-update, got {other:?}"),
        }

        let replaces: Vec<String> = h
            .connector
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("video_off:"))
            .collect();
        assert_eq!(replaces.len(), 2);

        // And back on: exactly one camera replace per peer, no extras.
        h.session.toggle_video().await.unwrap();
        let _ = recv_out(&mut h).await;
        let replaces: Vec<String> = h
            .connector
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("video_camera:"))
            .collect();
        assert_eq!(replaces.len(), 2);
    }

    #[tokio::test]
    async fn screen_share_swaps_feed_and_announces() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.session.toggle_screen_share().await.unwrap();
        let out = recv_out(&mut h).await;
        match out {
            ClientEvent::ParticipantUpdate { participant, .. } => {
                assert!(participant.is_screen_sharing);
            }
            other => panic!("expected participant-update, got {other:?}"),
        }
        assert!(h.connector.ops().contains(&"video_screen:b".to_string()));
    }

    #[tokio::test]
    async fn one_failing_peer_does_not_block_the_others() {
        let mut h = harness_with(MockConnector::failing_for("b"));
        connect_and_join(&mut h, vec![remote("b"), remote("c")]).await;

        // Only c's offer makes it out; b's failure is isolated.
        expect_offer(&mut h, "c").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.out_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_closes_peers_then_announces() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.session.leave().await.unwrap();

        let out = recv_out(&mut h).await;
        assert!(matches!(
            out,
            ClientEvent::LeaveRoom { ref user_id, .. } if user_id == "me"
        ));
        assert!(h.connector.ops().contains(&"close:b".to_string()));

        // The actor is gone; further commands fail cleanly.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            h.session.toggle_audio().await,
            Err(ClientError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn reconnect_discards_peers_and_rejoins_fresh() {
        let mut h = harness();
        connect_and_join(&mut h, vec![remote("b")]).await;
        expect_offer(&mut h, "b").await;

        h.link_tx
            .send(LinkEvent::Reconnecting { attempt: 1 })
            .await
            .unwrap();
        loop {
            if let SessionEvent::Reconnecting { attempt } = recv_event(&mut h).await {
                assert_eq!(attempt, 1);
                break;
            }
        }
        assert!(h.connector.ops().contains(&"close:b".to_string()));

        // Reconnected: the session joins again as if for the first time.
        h.link_tx.send(LinkEvent::Connected).await.unwrap();
        let out = recv_out(&mut h).await;
        assert!(matches!(out, ClientEvent::JoinRoom { .. }));
    }

    #[tokio::test]
    async fn chat_and_talking_are_plain_relays() {
        let mut h = harness();
        connect_and_join(&mut h, vec![]).await;

        h.session.set_talking(true).await.unwrap();
        let out = recv_out(&mut h).await;
        assert!(matches!(
            out,
            ClientEvent::Talking { is_talking: true, ref user_id, .. } if user_id == "me"
        ));

        h.session.send_chat("hello room").await.unwrap();
        let out = recv_out(&mut h).await;
        assert!(matches!(
            out,
            ClientEvent::ChatMessage { ref message, .. } if message == "hello room"
        ));
    }
}
