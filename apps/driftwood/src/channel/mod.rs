//! Push channel for one discussion view.
//!
//! Owns a single websocket connection, joins the discussion room on every
//! (re)connect, and forwards server messages to the consumer strictly in
//! arrival order. Teardown is idempotent; a generation counter keeps events
//! from a closed instance out of live state.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::protocol::{ClientMessage, ServerMessage};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

/// What the consumer sees: server messages in arrival order, plus transient
/// transport warnings (never raised for a clean local teardown).
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ServerMessage),
    Warning(String),
}

pub struct RealtimeChannel {
    discussion_id: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    status_rx: watch::Receiver<ChannelStatus>,
    generation: Arc<AtomicU64>,
    live_generation: u64,
    closed: AtomicBool,
}

impl RealtimeChannel {
    /// Start the connection task for one discussion room. Returns the
    /// channel handle and the event stream; connection progress is
    /// observable on [`RealtimeChannel::status`].
    pub fn connect(
        ws_url: Url,
        discussion_id: String,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let generation = Arc::new(AtomicU64::new(0));

        let worker = ChannelWorker {
            ws_url,
            discussion_id: discussion_id.clone(),
            events: events_tx,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
            status: status_tx,
            generation: generation.clone(),
            live_generation: 0,
        };
        tokio::spawn(worker.run());

        let channel = Self {
            discussion_id,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            status_rx,
            generation,
            live_generation: 0,
            closed: AtomicBool::new(false),
        };
        (channel, events_rx)
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }

    pub fn discussion_id(&self) -> &str {
        &self.discussion_id
    }

    /// Clean local teardown: leave the room, close the transport, and fence
    /// off any in-flight events. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.send(ClientMessage::Leave {
            discussion_id: self.discussion_id.clone(),
        });
        // Bumping the generation makes the worker's event emission a no-op
        // even if the socket still has frames in flight.
        self.generation
            .store(self.live_generation + 1, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        tracing::debug!(
            target = "driftwood::channel",
            discussion_id = %self.discussion_id,
            "channel closed"
        );
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.close();
    }
}

enum ConnectionOutcome {
    Clean,
    Lost,
}

struct ChannelWorker {
    ws_url: Url,
    discussion_id: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<ChannelStatus>,
    generation: Arc<AtomicU64>,
    live_generation: u64,
}

impl ChannelWorker {
    fn is_live(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.live_generation
    }

    fn emit(&self, event: ChannelEvent) {
        if self.is_live() {
            let _ = self.events.send(event);
        }
    }

    fn set_status(&self, status: ChannelStatus) {
        if self.is_live() {
            let _ = self.status.send(status);
        }
    }

    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            if *self.shutdown.borrow() || !self.is_live() {
                let _ = self.status.send(ChannelStatus::Disconnected);
                return;
            }
            if attempt > 0 {
                self.set_status(ChannelStatus::Reconnecting { attempt });
                sleep(backoff_delay(attempt)).await;
            } else {
                self.set_status(ChannelStatus::Connecting);
            }

            let connected = timeout(CONNECT_TIMEOUT, connect_async(self.ws_url.as_str())).await;
            let stream = match connected {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(err)) => {
                    attempt += 1;
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        self.emit(ChannelEvent::Warning(format!(
                            "realtime connection failed: {err}"
                        )));
                        self.set_status(ChannelStatus::Failed);
                        return;
                    }
                    tracing::warn!(
                        target = "driftwood::channel",
                        attempt,
                        error = %err,
                        "websocket connect failed"
                    );
                    continue;
                }
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        self.emit(ChannelEvent::Warning(
                            "realtime connection timed out".to_string(),
                        ));
                        self.set_status(ChannelStatus::Failed);
                        return;
                    }
                    continue;
                }
            };

            self.set_status(ChannelStatus::Connected);
            tracing::debug!(
                target = "driftwood::channel",
                discussion_id = %self.discussion_id,
                "joined discussion room"
            );

            match self.run_connection(stream).await {
                ConnectionOutcome::Clean => {
                    let _ = self.status.send(ChannelStatus::Disconnected);
                    return;
                }
                ConnectionOutcome::Lost => {
                    if *self.shutdown.borrow() || !self.is_live() {
                        let _ = self.status.send(ChannelStatus::Disconnected);
                        return;
                    }
                    self.emit(ChannelEvent::Warning(
                        "realtime connection lost; reconnecting".to_string(),
                    ));
                    attempt = 1;
                }
            }
        }
    }

    async fn run_connection(
        &mut self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> ConnectionOutcome {
        let (mut sink, mut incoming) = stream.split();

        // Join the room first; everything else waits behind it.
        let join = ClientMessage::Join {
            discussion_id: self.discussion_id.clone(),
        };
        if send_json(&mut sink, &join).await.is_err() {
            return ConnectionOutcome::Lost;
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        // Flush the queued leave before closing the socket.
                        while let Ok(queued) = self.outbound.try_recv() {
                            let _ = send_json(&mut sink, &queued).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionOutcome::Clean;
                    }
                }
                queued = self.outbound.recv() => {
                    match queued {
                        Some(msg) => {
                            if send_json(&mut sink, &msg).await.is_err() {
                                return ConnectionOutcome::Lost;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return ConnectionOutcome::Clean;
                        }
                    }
                }
                frame = incoming.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => self.emit(ChannelEvent::Message(message)),
                                Err(err) => tracing::debug!(
                                    target = "driftwood::channel",
                                    error = %err,
                                    "ignoring unparseable server message"
                                ),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            return ConnectionOutcome::Lost;
                        }
                    }
                }
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, message: &ClientMessage) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(message).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(500) * attempt;
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}
