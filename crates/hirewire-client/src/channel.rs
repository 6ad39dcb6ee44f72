//! Push channel connection
//!
//! One persistent connection per session. A supervisor task owns the link:
//! it connects, joins the user's room, fans inbound events out to every
//! registered handler, and on any drop waits out the backoff and starts
//! over. Connection loss is logged and retried, never surfaced.
//!
//! Frames are JSON text messages:
//!
//! ```text
//! client → server   {"event":"join","data":"<user id>"}
//! server → client   {"event":"new_notification","data":{ ...entry... }}
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hirewire_core::{
    Backoff, ConnectionState, MalformedPayload, NotifyError, ReconnectConfig, Result,
    TransientError,
};

use crate::identity::Credentials;

/// Event name of the room-join frame
pub const JOIN_EVENT: &str = "join";

/// One message on the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Room-join frame for a user
    pub fn join(room: &str) -> Self {
        Self::new(JOIN_EVENT, Value::String(room.to_string()))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> std::result::Result<Self, MalformedPayload> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Opens links to the notification service
pub trait PushTransport: Send + Sync + 'static {
    type Link: PushLink;

    fn open(&self, credentials: &Credentials) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// One open link
pub trait PushLink: Send + 'static {
    fn send(&mut self, frame: &ChannelFrame) -> impl Future<Output = Result<()>> + Send;

    /// Next inbound frame; `None` once the peer has gone away
    fn recv(&mut self) -> impl Future<Output = Option<Result<ChannelFrame>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket transport
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl PushTransport for WsTransport {
    type Link = WsLink;

    async fn open(&self, credentials: &Credentials) -> Result<WsLink> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransientError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&credentials.bearer())
            .map_err(|e| TransientError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransientError::Connect(e.to_string()))?;

        Ok(WsLink { stream })
    }
}

/// Link over a tungstenite stream
pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushLink for WsLink {
    async fn send(&mut self, frame: &ChannelFrame) -> Result<()> {
        self.stream
            .send(Message::Text(frame.encode().into()))
            .await
            .map_err(|e| TransientError::Connect(e.to_string()).into())
    }

    async fn recv(&mut self) -> Option<Result<ChannelFrame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(TransientError::Connect(e.to_string()).into())),
            };

            match message {
                Message::Text(text) => {
                    return Some(ChannelFrame::decode(text.as_str()).map_err(NotifyError::from))
                }
                Message::Binary(bytes) => {
                    return Some(serde_json::from_slice(&bytes).map_err(NotifyError::from))
                }
                Message::Close(_) => return None,
                // Pings are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("Push channel close failed: {}", e);
        }
    }
}

/// Callback for one event kind
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`ChannelConnection::on_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

enum LinkCommand {
    /// Send the join frame for the current room
    Join,
    Close,
}

enum LinkExit {
    Closed,
    Dropped(String),
}

struct Shared {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    room: Mutex<Option<String>>,
    state: watch::Sender<ConnectionState>,
    /// Bumped by every connect and disconnect; a supervisor only writes
    /// while its own generation is current
    generation: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn advance(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Supervisor-side state write, dropped once the generation has moved on
    fn set_state_for(&self, generation: u64, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if !self.is_current(generation) || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn room(&self) -> Option<String> {
        lock(&self.room).clone()
    }

    fn dispatch(&self, frame: &ChannelFrame) {
        let handlers: Vec<EventHandler> = lock(&self.handlers)
            .get(&frame.event)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::debug!("No handler for push event {}", frame.event);
            return;
        }
        for handler in handlers {
            handler(&frame.data);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Supervisor {
    commands: mpsc::UnboundedSender<LinkCommand>,
    task: JoinHandle<()>,
}

/// The session's persistent push connection
pub struct ChannelConnection<T: PushTransport> {
    transport: Arc<T>,
    credentials: Credentials,
    reconnect: ReconnectConfig,
    shared: Arc<Shared>,
    next_handler: AtomicU64,
    supervisor: Mutex<Option<Supervisor>>,
}

impl<T: PushTransport> ChannelConnection<T> {
    pub fn new(transport: Arc<T>, credentials: Credentials, reconnect: ReconnectConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            credentials,
            reconnect,
            shared: Arc::new(Shared {
                handlers: Mutex::new(HashMap::new()),
                room: Mutex::new(None),
                state,
                generation: AtomicU64::new(0),
            }),
            next_handler: AtomicU64::new(0),
            supervisor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe state transitions
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Start the supervisor. No-op while it is connecting or connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut supervisor = lock(&self.supervisor);
        if let Some(running) = supervisor.as_ref() {
            if !running.task.is_finished() {
                tracing::debug!("Push channel already {}", self.state());
                return;
            }
        }

        let generation = self.shared.advance();
        self.shared.set_state(ConnectionState::Connecting);
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(
            Arc::clone(&self.transport),
            self.credentials.clone(),
            Arc::clone(&self.shared),
            generation,
            Backoff::from_config(&self.reconnect),
            rx,
        ));
        *supervisor = Some(Supervisor { commands, task });
    }

    /// Join the user's room now if connected, and after every reconnect
    pub fn join_room(&self, room: &str) {
        *lock(&self.shared.room) = Some(room.to_string());

        if self.state() != ConnectionState::Connected {
            tracing::debug!("Push channel not connected, will join {} on connect", room);
            return;
        }
        if let Some(running) = lock(&self.supervisor).as_ref() {
            let _ = running.commands.send(LinkCommand::Join);
        }
    }

    /// Register a handler; every handler for a kind is invoked
    pub fn on_event<F>(&self, kind: &str, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed) + 1);
        lock(&self.shared.handlers)
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; false if it was already gone
    pub fn off_event(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.shared.handlers);
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        lock(&self.shared.handlers).get(kind).map_or(0, Vec::len)
    }

    /// Release the connection and forget the room
    pub fn disconnect(&self) {
        self.shared.advance();
        if let Some(running) = lock(&self.supervisor).take() {
            if running.commands.send(LinkCommand::Close).is_err() {
                running.task.abort();
            }
        }
        *lock(&self.shared.room) = None;
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl<T: PushTransport> Drop for ChannelConnection<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn supervise<T: PushTransport>(
    transport: Arc<T>,
    credentials: Credentials,
    shared: Arc<Shared>,
    generation: u64,
    mut backoff: Backoff,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    loop {
        shared.set_state_for(generation, ConnectionState::Connecting);

        let opened = {
            let open = transport.open(&credentials);
            tokio::pin!(open);
            loop {
                tokio::select! {
                    result = &mut open => break Some(result),
                    command = commands.recv() => match command {
                        // Joined right after the link opens
                        Some(LinkCommand::Join) => continue,
                        Some(LinkCommand::Close) | None => break None,
                    },
                }
            }
        };
        let Some(result) = opened else { break };

        match result {
            Ok(mut link) => {
                backoff.reset();
                shared.set_state_for(generation, ConnectionState::Connected);
                tracing::info!("Push channel connected");

                match run_link(&mut link, &shared, generation, &mut commands).await {
                    LinkExit::Closed => {
                        link.close().await;
                        break;
                    }
                    LinkExit::Dropped(reason) => {
                        tracing::warn!("Push channel dropped: {}", reason);
                    }
                }
            }
            Err(err) => tracing::warn!("Push channel connect failed: {}", err),
        }

        shared.set_state_for(generation, ConnectionState::Connecting);
        let delay = backoff.next_delay();
        tracing::debug!("Reconnecting push channel in {:?}", delay);
        if wait_or_close(delay, &mut commands).await {
            break;
        }
    }

    shared.set_state_for(generation, ConnectionState::Disconnected);
    tracing::info!("Push channel closed");
}

async fn run_link<L: PushLink>(
    link: &mut L,
    shared: &Shared,
    generation: u64,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
) -> LinkExit {
    if let Err(err) = join_current_room(link, shared).await {
        return LinkExit::Dropped(err.to_string());
    }

    loop {
        tokio::select! {
            frame = link.recv() => match frame {
                None => return LinkExit::Dropped("closed by peer".to_string()),
                Some(Ok(frame)) if shared.is_current(generation) => shared.dispatch(&frame),
                Some(Ok(frame)) => {
                    tracing::debug!("Ignoring {} frame on a replaced link", frame.event);
                }
                Some(Err(NotifyError::MalformedPayload(err))) => {
                    tracing::warn!("Dropping undecodable push frame: {}", err);
                }
                Some(Err(err)) => return LinkExit::Dropped(err.to_string()),
            },
            command = commands.recv() => match command {
                Some(LinkCommand::Join) => {
                    if let Err(err) = join_current_room(link, shared).await {
                        return LinkExit::Dropped(err.to_string());
                    }
                }
                Some(LinkCommand::Close) | None => return LinkExit::Closed,
            },
        }
    }
}

async fn join_current_room<L: PushLink>(link: &mut L, shared: &Shared) -> Result<()> {
    if let Some(room) = shared.room() {
        link.send(&ChannelFrame::join(&room)).await?;
        tracing::info!("Joined push room {}", room);
    }
    Ok(())
}

/// Sleep out a backoff delay; true if the connection was closed meanwhile
async fn wait_or_close(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<LinkCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            command = commands.recv() => match command {
                Some(LinkCommand::Join) => continue,
                Some(LinkCommand::Close) | None => return true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_frame_encoding() {
        let frame = ChannelFrame::join("user-42");
        assert_eq!(frame.encode(), r#"{"event":"join","data":"user-42"}"#);
    }

    #[test]
    fn decode_inbound_frame() {
        let frame = ChannelFrame::decode(
            r#"{"event":"new_notification","data":{"id":"n1","timestamp":"2024-05-01T10:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(frame.event, "new_notification");
        assert_eq!(frame.data["id"], json!("n1"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ChannelFrame::decode("not json").is_err());
        assert!(ChannelFrame::decode(r#"{"data": 1}"#).is_err());
    }
}
