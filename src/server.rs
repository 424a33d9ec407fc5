//! # Server
//!
//! Wires a `StateMachine` to a `ClientManager` and an `UpdateBuffer`: owns
//! the authoritative state, accepts client actions, and fans committed
//! changes back out as `update`/`init`/`reject` messages.
//!
//! The topology itself — which topics exist, their type and statefulness —
//! is held in a server-owned meta-topic, `_chatroom/topic_list` (a stateful
//! `DictTopic`). A `manual` listener on that topic is what actually drives
//! `StateMachine::add_topic`/`remove_topic`: mutating the meta-topic *is*
//! how a topic comes into being, matching the "meta-topic mediates topology"
//! design in the external-interfaces section.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use indexmap::IndexMap;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::change::{Change, ChangeBody, DictKind};
use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state_machine::StateMachine;
use crate::transition::ActionSource;
use crate::update_buffer::UpdateBuffer;
use crate::value::{TopicType, Value};

pub const TOPIC_LIST: &str = "_chatroom/topic_list";

/// A pending cross-client RPC: which client asked, waiting for a `response`
/// carrying the same `request_id`.
struct PendingRequest {
    requester: u64,
}

pub struct Server {
    pub config: ServerConfig,
    state: Arc<Mutex<StateMachine>>,
    clients: Arc<Mutex<ClientManager>>,
    /// A plain `std::sync::Mutex`, not `tokio::sync::Mutex`: every access is a
    /// brief, CPU-bound merge/drain with no `.await` inside the critical
    /// section, and the topology listener (synchronous, called from inside
    /// the state-machine lock) needs to drop a removed topic's queued
    /// changes without yielding.
    update_buffer: Arc<StdMutex<UpdateBuffer>>,
    stateful_topics: Arc<StdMutex<HashSet<String>>>,
    pending_requests: Arc<Mutex<HashMap<String, PendingRequest>>>,
    /// Every change committed by the most recently completed top-level
    /// operation, captured by the single `changes_callback` registered in
    /// `new`. Drained and routed after each lock is released, since routing
    /// needs `.await` and the callback itself must stay synchronous.
    last_committed: Arc<StdMutex<Vec<Change>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let mut state = StateMachine::new();
        state
            .add_topic(TOPIC_LIST, TopicType::Dict, true)
            .expect("fresh state machine has no topics yet");

        let stateful_topics: Arc<StdMutex<HashSet<String>>> = Arc::new(StdMutex::new(HashSet::new()));
        stateful_topics.lock().unwrap().insert(TOPIC_LIST.to_string());

        let update_buffer: Arc<StdMutex<UpdateBuffer>> = Arc::new(StdMutex::new(UpdateBuffer::new()));

        let hub_stateful = stateful_topics.clone();
        let hub_buffer = update_buffer.clone();
        state.add_manual_listener(
            TOPIC_LIST,
            Box::new(move |sm, change, _old, _new| {
                apply_topology_change(sm, change, &hub_stateful, &hub_buffer)
            }),
        );

        let last_committed: Arc<StdMutex<Vec<Change>>> = Arc::new(StdMutex::new(Vec::new()));
        let committed_cb = last_committed.clone();
        state.on_changes(move |changes, _action_id| {
            committed_cb.lock().unwrap().extend(changes.iter().cloned());
        });

        Server {
            config,
            state: Arc::new(Mutex::new(state)),
            clients: Arc::new(Mutex::new(ClientManager::new())),
            update_buffer,
            stateful_topics,
            pending_requests: Arc::new(Mutex::new(HashMap::new())),
            last_committed,
        }
    }

    /// Drain and route whatever the most recent state-machine operation
    /// committed. Call after releasing the state lock.
    async fn route_last_committed(&self) {
        let changes: Vec<Change> = self.last_committed.lock().unwrap().drain(..).collect();
        if !changes.is_empty() {
            route_committed(changes, &self.stateful_topics, &self.update_buffer, &self.clients).await;
        }
    }

    pub fn state(&self) -> Arc<Mutex<StateMachine>> {
        self.state.clone()
    }

    pub fn clients(&self) -> Arc<Mutex<ClientManager>> {
        self.clients.clone()
    }

    /// Register a topic by adding it to the topology meta-topic; the manual
    /// listener on `_chatroom/topic_list` performs the actual
    /// `StateMachine::add_topic` once the dict entry lands.
    pub async fn add_topic(&self, name: &str, topic_type: TopicType, is_stateful: bool) -> Result<()> {
        let entry = topology_entry(topic_type, is_stateful);
        let result = {
            let mut state = self.state.lock().await;
            state.add_dict(TOPIC_LIST, name, entry)
        };
        self.route_last_committed().await;
        result
    }

    pub async fn remove_topic(&self, name: &str) -> Result<()> {
        let result = {
            let mut state = self.state.lock().await;
            state.pop_dict(TOPIC_LIST, name)
        };
        self.route_last_committed().await;
        result
    }

    /// Called when a client connects: allocate an id, send `hello`.
    pub async fn accept_client(&self) -> (crate::client_manager::ClientHandle, tokio::sync::mpsc::UnboundedReceiver<ServerMessage>) {
        let mut clients = self.clients.lock().await;
        let (handle, rx) = clients.register();
        let _ = handle.send(ServerMessage::Hello { id: handle.id });
        (handle, rx)
    }

    pub async fn disconnect_client(&self, client_id: u64) {
        let mut clients = self.clients.lock().await;
        clients.disconnect(client_id);
    }

    /// Subscribe `client_id` to `topic_name`: flush anything buffered, add
    /// the subscriber, then send `init` with the topic's current value.
    pub async fn subscribe(&self, client_id: u64, topic_name: &str) -> Result<()> {
        self.flush_update_buffer().await;

        let state = self.state.lock().await;
        let topic = state
            .get_topic(topic_name)
            .ok_or_else(|| crate::error::BrokerError::UnknownTopic(topic_name.to_string()))?;
        let value = topic.value().to_value();
        let version = topic.string_version.clone();
        drop(state);

        let mut clients = self.clients.lock().await;
        clients.subscribe(topic_name, client_id);
        if let Some(handle) = clients.get(client_id) {
            let _ = handle.send(ServerMessage::Init {
                topic_name: topic_name.to_string(),
                value: serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                id: version,
            });
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, client_id: u64, topic_name: &str) {
        let mut clients = self.clients.lock().await;
        clients.unsubscribe(topic_name, client_id);
    }

    /// Handle one incoming frame from `client_id`.
    pub async fn handle_message(&self, client_id: u64, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe { topic_name } => {
                if let Err(e) = self.subscribe(client_id, &topic_name).await {
                    self.reject(client_id, e.to_string()).await;
                }
            }
            ClientMessage::Unsubscribe { topic_name } => {
                self.unsubscribe(client_id, &topic_name).await;
            }
            ClientMessage::Action { action_id, commands } => {
                self.handle_action(client_id, action_id, commands).await;
            }
            ClientMessage::Request { service_name, args, request_id } => {
                self.handle_request(client_id, service_name, args, request_id).await;
            }
            ClientMessage::Response { request_id, response } => {
                self.handle_response(request_id, response).await;
            }
        }
    }

    async fn handle_action(&self, client_id: u64, action_id: String, commands: Vec<Change>) {
        let result = {
            let mut state = self.state.lock().await;
            state.propose(commands, ActionSource::Client(client_id), action_id)
        };
        self.route_last_committed().await;
        if let Err(e) = result {
            self.reject(client_id, e.to_string()).await;
        }
    }

    async fn handle_request(&self, client_id: u64, service_name: String, args: serde_json::Value, request_id: String) {
        let clients = self.clients.lock().await;
        // No service-discovery registry exists yet: broadcast the request to
        // every other connected client and let whichever one answers first
        // claim the correlation id. See DESIGN.md for the resolved Open
        // Question this simplifies.
        let targets: Vec<u64> = clients.subscribers(&format!("_chatroom/services/{service_name}")).collect();
        for target in &targets {
            if *target == client_id {
                continue;
            }
            if let Some(handle) = clients.get(*target) {
                let _ = handle.send(ServerMessage::Response {
                    request_id: request_id.clone(),
                    response: serde_json::json!({ "service_name": service_name, "args": args }),
                });
            }
        }
        drop(clients);
        self.pending_requests
            .lock()
            .await
            .insert(request_id, PendingRequest { requester: client_id });
    }

    async fn handle_response(&self, request_id: String, response: serde_json::Value) {
        let mut pending = self.pending_requests.lock().await;
        if let Some(entry) = pending.remove(&request_id) {
            let clients = self.clients.lock().await;
            if let Some(handle) = clients.get(entry.requester) {
                let _ = handle.send(ServerMessage::Response { request_id, response });
            }
        }
    }

    async fn reject(&self, client_id: u64, reason: String) {
        let clients = self.clients.lock().await;
        if let Some(handle) = clients.get(client_id) {
            let _ = handle.send(ServerMessage::Reject { reason });
        }
    }

    /// Drain the update buffer (periodic clock tick, or forced by a fresh
    /// subscribe) and broadcast one `update` per topic.
    pub async fn flush_update_buffer(&self) {
        let flushed = { self.update_buffer.lock().unwrap().flush() };
        if flushed.is_empty() {
            return;
        }
        let clients = self.clients.lock().await;
        for (topic_name, changes) in flushed {
            clients.broadcast(&topic_name, ServerMessage::Update { changes, action_id: String::new() });
        }
    }
}

/// Route one transition's committed changes: stateful topics broadcast
/// immediately grouped by topic, non-stateful ones queue for the next flush.
async fn route_committed(
    changes: Vec<Change>,
    stateful_topics: &Arc<StdMutex<HashSet<String>>>,
    update_buffer: &Arc<StdMutex<UpdateBuffer>>,
    clients: &Arc<Mutex<ClientManager>>,
) {
    let mut immediate: HashMap<String, Vec<Change>> = HashMap::new();
    {
        let stateful = stateful_topics.lock().unwrap();
        let mut buffer = update_buffer.lock().unwrap();
        for change in changes {
            if stateful.contains(&change.topic_name) {
                immediate.entry(change.topic_name.clone()).or_default().push(change);
            } else {
                buffer.push(change.topic_type, change);
            }
        }
    }
    if !immediate.is_empty() {
        let clients = clients.lock().await;
        for (topic_name, changes) in immediate {
            clients.broadcast(&topic_name, ServerMessage::Update { changes, action_id: String::new() });
        }
    }
}

fn topology_entry(topic_type: TopicType, is_stateful: bool) -> Value {
    let mut map = IndexMap::new();
    map.insert("type".to_string(), Value::Str(topic_type.as_str().to_string()));
    map.insert("is_stateful".to_string(), Value::Bool(is_stateful));
    Value::Dict(map)
}

fn apply_topology_change(
    sm: &mut StateMachine,
    change: &mut Change,
    stateful_topics: &Arc<StdMutex<HashSet<String>>>,
    update_buffer: &Arc<StdMutex<UpdateBuffer>>,
) -> Result<()> {
    match &change.body {
        ChangeBody::Dict(DictKind::Add { key, value }) => {
            let (topic_type, is_stateful) = parse_topology_entry(value)?;
            sm.add_topic(key.clone(), topic_type, is_stateful)?;
            if is_stateful {
                stateful_topics.lock().unwrap().insert(key.clone());
            }
            info!("topic '{key}' registered ({topic_type:?}, stateful={is_stateful})");
        }
        ChangeBody::Dict(DictKind::Pop { key, .. }) => {
            if sm.remove_topic(key).is_err() {
                warn!("topology pop for unknown topic '{key}'");
            }
            stateful_topics.lock().unwrap().remove(key);
            update_buffer.lock().unwrap().drop_topic(key);
        }
        _ => {}
    }
    Ok(())
}

fn parse_topology_entry(value: &Value) -> Result<(TopicType, bool)> {
    let Value::Dict(map) = value else {
        return Err(crate::error::BrokerError::invalid(TOPIC_LIST, "topology entry must be a dict"));
    };
    let type_str = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| crate::error::BrokerError::invalid(TOPIC_LIST, "topology entry missing 'type'"))?;
    let topic_type = match type_str {
        "generic" => TopicType::Generic,
        "string" => TopicType::String,
        "int" => TopicType::Int,
        "float" => TopicType::Float,
        "set" => TopicType::Set,
        "list" => TopicType::List,
        "dict" => TopicType::Dict,
        "event" => TopicType::Event,
        "binary" => TopicType::Binary,
        other => return Err(crate::error::BrokerError::invalid(TOPIC_LIST, format!("unknown topic type '{other}'"))),
    };
    let is_stateful = matches!(map.get("is_stateful"), Some(Value::Bool(true)));
    Ok((topic_type, is_stateful))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_topic_creates_it_via_the_topology_meta_topic() {
        let server = Server::new(ServerConfig::default());
        server.add_topic("room/count", TopicType::Int, true).await.unwrap();
        let state = server.state.lock().await;
        assert!(state.has_topic("room/count"));
    }

    #[tokio::test]
    async fn remove_topic_drops_it_from_the_state_machine() {
        let server = Server::new(ServerConfig::default());
        server.add_topic("room/count", TopicType::Int, true).await.unwrap();
        server.remove_topic("room/count").await.unwrap();
        let state = server.state.lock().await;
        assert!(!state.has_topic("room/count"));
    }
}
