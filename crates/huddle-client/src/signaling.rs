//! WebSocket link to the signaling relay, with auto-reconnect.
//!
//! A background task owns the socket. Outbound [`ClientEvent`]s are queued on
//! a channel; inbound traffic and link lifecycle changes surface as
//! [`LinkEvent`]s for the session to consume. On transport loss the task
//! reconnects with exponential backoff; the session reacts to
//! [`LinkEvent::Connected`] by re-joining the room from scratch, so no peer
//! state survives a relay restart.

use crate::error::{ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{ClientEvent, ServerEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const MAX_RECONNECT: u32 = 10;
const OUTBOUND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Lifecycle and traffic events surfaced to the session.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The socket is open (first connect or a successful reconnect). The
    /// session must (re-)join its room; the relay has no memory of it.
    Connected,
    /// An event from the relay.
    Event(ServerEvent),
    /// The socket dropped; a reconnect attempt is scheduled.
    Reconnecting { attempt: u32 },
    /// The link gave up (reconnect budget exhausted) or shut down cleanly.
    Closed,
}

/// Handle for sending events to the relay.
///
/// Dropping the handle closes the socket and ends the background task.
pub struct RelayLink {
    tx: mpsc::Sender<ClientEvent>,
}

impl RelayLink {
    /// Open a link to the relay. Returns immediately; connection management
    /// happens in a background task that reports through the returned
    /// receiver.
    pub fn connect(url: &str) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(supervise(url.to_owned(), out_rx, event_tx));
        (Self { tx: out_tx }, event_rx)
    }

    /// Build a link around an existing outbound channel. Lets tests drive a
    /// session without a socket.
    pub(crate) fn from_parts(tx: mpsc::Sender<ClientEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event for the relay.
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ClientError::NotConnected)
    }
}

/// Reconnect loop: run one connection to completion, back off, retry.
async fn supervise(
    url: String,
    mut out_rx: mpsc::Receiver<ClientEvent>,
    event_tx: mpsc::Sender<LinkEvent>,
) {
    let mut attempts = 0u32;
    loop {
        match run_once(&url, &mut out_rx, &event_tx, &mut attempts).await {
            Ok(()) => {
                // Outbound handle dropped or session gone: clean shutdown.
                let _ = event_tx.send(LinkEvent::Closed).await;
                return;
            }
            Err(e) => {
                attempts += 1;
                if attempts > MAX_RECONNECT {
                    tracing::error!(url = %url, error = %e, "Relay link: max reconnect attempts reached");
                    let _ = event_tx.send(LinkEvent::Closed).await;
                    return;
                }
                let delay = Duration::from_secs(u64::min(2u64.pow(attempts), 30));
                tracing::warn!(
                    url = %url,
                    error = %e,
                    attempt = attempts,
                    delay_secs = delay.as_secs(),
                    "Relay link lost, reconnecting"
                );
                if event_tx
                    .send(LinkEvent::Reconnecting { attempt: attempts })
                    .await
                    .is_err()
                {
                    return;
                }
                sleep(delay).await;
            }
        }
    }
}

/// One connection lifetime. `Ok(())` means the session side went away;
/// any transport failure is an `Err` and triggers a reconnect.
async fn run_once(
    url: &str,
    out_rx: &mut mpsc::Receiver<ClientEvent>,
    event_tx: &mpsc::Sender<LinkEvent>,
    attempts: &mut u32,
) -> Result<()> {
    let (ws, _) = connect_async(url).await?;
    *attempts = 0;
    let (mut sink, mut stream) = ws.split();

    if event_tx.send(LinkEvent::Connected).await.is_err() {
        return Ok(());
    }

    loop {
        tokio::select! {
            outbound = out_rx.recv() => {
                let Some(event) = outbound else {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                };
                let json = serde_json::to_string(&event)?;
                sink.send(Message::Text(json.into())).await?;
            }
            inbound = stream.next() => {
                let Some(msg) = inbound else {
                    return Err(ClientError::NotConnected);
                };
                match msg? {
                    Message::Text(text) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(LinkEvent::Event(event)).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Ignoring unparseable relay event");
                        }
                    },
                    Message::Close(_) => return Err(ClientError::NotConnected),
                    _ => {}
                }
            }
        }
    }
}
