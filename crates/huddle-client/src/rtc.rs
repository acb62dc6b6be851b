//! webrtc-rs implementation of the peer-engine seam.
//!
//! One [`WebRtcConnector`] per session. It owns the local media tracks
//! (microphone, camera, screen) as static-sample tracks shared across every
//! peer connection; the embedding application writes encoded samples into
//! them. Capability toggles become `replace_track` calls on the senders, so a
//! remote peer never holds a reference to a stopped track.

use crate::engine::{MediaIntent, PeerConnector, PeerEvent, PeerLink, PeerUpdate, SignalPayload, VideoFeed};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Default STUN servers (free, public). In production, add TURN servers for
/// NAT traversal.
pub fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".into(),
        "stun:stun1.l.google.com:19302".into(),
    ]
}

/// Peer-connection factory backed by webrtc-rs.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    audio_track: Arc<TrackLocalStaticSample>,
    camera_track: Arc<TrackLocalStaticSample>,
    screen_track: Arc<TrackLocalStaticSample>,
}

impl WebRtcConnector {
    pub fn new(stun_urls: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let api = APIBuilder::new().with_media_engine(media_engine).build();

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "huddle".to_owned(),
        ));
        let camera_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "camera".to_owned(),
            "huddle".to_owned(),
        ));
        let screen_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "screen".to_owned(),
            "huddle".to_owned(),
        ));

        Ok(Self {
            api,
            ice_servers: vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }],
            audio_track,
            camera_track,
            screen_track,
        })
    }

    /// The microphone track. The capture side writes Opus samples into it.
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio_track)
    }

    /// The camera track. The capture side writes VP8 samples into it.
    pub fn camera_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.camera_track)
    }

    /// The screen-share track.
    pub fn screen_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.screen_track)
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        remote_id: &str,
        intent: MediaIntent,
        events: mpsc::Sender<PeerUpdate>,
    ) -> Result<Arc<dyn PeerLink>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        // Trickle locally gathered candidates up to the session, which relays
        // them to the remote peer.
        let candidate_events = events.clone();
        let candidate_remote = remote_id.to_owned();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let remote_id = candidate_remote.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        tracing::warn!(peer = %remote_id, error = %e, "Failed to serialize ICE candidate");
                        return;
                    }
                };
                if let Ok(payload) = serde_json::to_value(&init) {
                    let _ = events
                        .send(PeerUpdate {
                            remote_id,
                            event: PeerEvent::IceCandidate(payload),
                        })
                        .await;
                }
            })
        }));

        let state_events = events.clone();
        let state_remote = remote_id.to_owned();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let remote_id = state_remote.clone();
            Box::pin(async move {
                tracing::debug!(peer = %remote_id, state = %state, "Peer connection state changed");
                let event = match state {
                    RTCPeerConnectionState::Connected => PeerEvent::Connected,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                        PeerEvent::Failed
                    }
                    _ => return,
                };
                let _ = events.send(PeerUpdate { remote_id, event }).await;
            })
        }));

        let track_remote = remote_id.to_owned();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            // Media consumption belongs to the embedding application; the
            // control plane only notes that negotiation produced a track.
            tracing::debug!(
                peer = %track_remote,
                kind = %track.kind(),
                "Remote track started"
            );
            Box::pin(async {})
        }));

        // Senders are always attached so later toggles are plain
        // `replace_track` calls; "off" is a sender with no track.
        let audio_sender = pc
            .add_track(Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        let video_sender = pc
            .add_track(Arc::clone(&self.camera_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let link = WebRtcLink {
            pc,
            audio_sender,
            video_sender,
            audio_track: Arc::clone(&self.audio_track),
            camera_track: Arc::clone(&self.camera_track),
            screen_track: Arc::clone(&self.screen_track),
        };

        if !intent.audio {
            link.set_audio(false).await?;
        }
        if intent.video != VideoFeed::Camera {
            link.set_video(intent.video).await?;
        }

        Ok(Arc::new(link))
    }
}

/// One webrtc-rs peer connection.
struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    audio_sender: Arc<RTCRtpSender>,
    video_sender: Arc<RTCRtpSender>,
    audio_track: Arc<TrackLocalStaticSample>,
    camera_track: Arc<TrackLocalStaticSample>,
    screen_track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<SignalPayload> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(&offer)?)
    }

    async fn accept_offer(&self, offer: SignalPayload) -> Result<SignalPayload> {
        let offer: RTCSessionDescription = serde_json::from_value(offer)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(&answer)?)
    }

    async fn accept_answer(&self, answer: SignalPayload) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_value(answer)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: SignalPayload) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn set_audio(&self, enabled: bool) -> Result<()> {
        let track = enabled
            .then(|| Arc::clone(&self.audio_track) as Arc<dyn TrackLocal + Send + Sync>);
        self.audio_sender.replace_track(track).await?;
        Ok(())
    }

    async fn set_video(&self, feed: VideoFeed) -> Result<()> {
        let track = match feed {
            VideoFeed::Off => None,
            VideoFeed::Camera => {
                Some(Arc::clone(&self.camera_track) as Arc<dyn TrackLocal + Send + Sync>)
            }
            VideoFeed::Screen => {
                Some(Arc::clone(&self.screen_track) as Arc<dyn TrackLocal + Send + Sync>)
            }
        };
        self.video_sender.replace_track(track).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(error = %e, "Error closing peer connection");
        }
    }
}
