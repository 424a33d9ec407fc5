//! # Transport
//!
//! Connects to a topicsync server over WebSocket, keeps a [`ClientMirror`]
//! in sync with incoming frames, and surfaces everything the mirror doesn't
//! model itself (the assigned client id, relayed RPC traffic) as
//! [`ClientEvent`]s.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use topicsync::protocol::{ClientMessage, ServerMessage};
use topicsync::{Change, TopicType, TopicValue};

use crate::error::{Error, Result};
use crate::mirror::ClientMirror;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames the mirror doesn't absorb on its own, delivered in arrival order.
/// There is no dedicated "incoming request" frame: a service provider
/// recognizes one by its own `_chatroom/services/<name>` subscription and
/// the `{service_name, args}` shape of `response`; replying goes through
/// [`Client::respond`] with the same `request_id`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Hello { id: u64 },
    Response { request_id: String, response: serde_json::Value },
}

/// A live connection to a topicsync server plus the local mirror it keeps
/// in sync. Cheap to clone: every clone shares the same connection and
/// mirror.
#[derive(Clone)]
pub struct Client {
    mirror: Arc<Mutex<ClientMirror>>,
    outbox: mpsc::UnboundedSender<WsMessage>,
}

impl Client {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9000`). Returns the client and
    /// a receiver for events the mirror doesn't already absorb; drop the
    /// receiver if you don't care about RPC traffic.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();
        spawn_writer(write, out_rx);

        let mirror = Arc::new(Mutex::new(ClientMirror::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        spawn_reader(read, mirror.clone(), event_tx);

        Ok((Client { mirror, outbox: out_tx }, event_rx))
    }

    /// Register a topic's type with the mirror and ask the server to
    /// subscribe. The server's `init` reply lands asynchronously; poll
    /// [`Client::get`] once it has had a chance to arrive, or simply start
    /// proposing changes — `init` always precedes the first `update`.
    pub async fn subscribe(&self, topic_name: &str, topic_type: TopicType) -> Result<()> {
        self.mirror.lock().await.track_topic(topic_name, topic_type);
        self.send(ClientMessage::Subscribe { topic_name: topic_name.to_string() })
    }

    pub fn unsubscribe(&self, topic_name: &str) -> Result<()> {
        self.send(ClientMessage::Unsubscribe { topic_name: topic_name.to_string() })
    }

    /// Read the mirror's current value for `topic_name`, if tracked.
    pub async fn get(&self, topic_name: &str) -> Option<TopicValue> {
        self.mirror.lock().await.get(topic_name).cloned()
    }

    /// Apply `commands` to the mirror immediately (optimistic) and send them
    /// to the server as one atomic `action`. The server's eventual `update`
    /// or `reject` reconciles the mirror if it disagrees.
    pub async fn propose(&self, commands: Vec<Change>) -> Result<()> {
        let action_id = uuid::Uuid::new_v4().to_string();
        let mut mirror = self.mirror.lock().await;
        let mut committed = Vec::with_capacity(commands.len());
        for change in commands {
            committed.push(mirror.propose(change)?);
        }
        drop(mirror);
        self.send(ClientMessage::Action { action_id, commands: committed })
    }

    /// Send a correlated RPC to whichever client subscribes to
    /// `_chatroom/services/{service_name}`. The reply arrives as a
    /// [`ClientEvent::Response`] with a matching `request_id`.
    pub fn request(&self, service_name: &str, args: serde_json::Value) -> Result<String> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.send(ClientMessage::Request {
            service_name: service_name.to_string(),
            args,
            request_id: request_id.clone(),
        })?;
        Ok(request_id)
    }

    pub fn respond(&self, request_id: String, response: serde_json::Value) -> Result<()> {
        self.send(ClientMessage::Response { request_id, response })
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbox
            .send(WsMessage::Text(message.to_frame()))
            .map_err(|_| Error::connection("connection closed"))
    }
}

fn spawn_writer(
    mut write: futures_util::stream::SplitSink<WsStream, WsMessage>,
    mut out_rx: mpsc::UnboundedReceiver<WsMessage>,
) {
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write.send(frame).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_reader(
    mut read: futures_util::stream::SplitStream<WsStream>,
    mirror: Arc<Mutex<ClientMirror>>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("read error: {e}");
                    break;
                }
            };
            let message = match ServerMessage::from_frame(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!("malformed server frame: {e}");
                    continue;
                }
            };
            handle_server_message(message, &mirror, &event_tx).await;
        }
        debug!("server connection closed");
    });
}

async fn handle_server_message(
    message: ServerMessage,
    mirror: &Arc<Mutex<ClientMirror>>,
    event_tx: &mpsc::UnboundedSender<ClientEvent>,
) {
    match message {
        ServerMessage::Hello { id } => {
            let _ = event_tx.send(ClientEvent::Hello { id });
        }
        ServerMessage::Init { topic_name, value, id } => {
            if let Err(e) = mirror.lock().await.handle_init(&topic_name, value, id) {
                warn!("init for '{topic_name}' did not match its tracked type: {e}");
            }
        }
        ServerMessage::Update { changes, .. } => {
            mirror.lock().await.handle_update(changes);
        }
        ServerMessage::Reject { .. } | ServerMessage::RejectUpdate { .. } => {
            mirror.lock().await.handle_reject();
        }
        ServerMessage::Response { request_id, response } => {
            let _ = event_tx.send(ClientEvent::Response { request_id, response });
        }
    }
}
