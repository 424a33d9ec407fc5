//! # ClientManager
//!
//! Tracks connected clients and which topics each one subscribes to. Outbound
//! frames for a client go through a single FIFO queue drained by that
//! client's writer task, so handler code never blocks on a slow peer and two
//! messages for the same client can never interleave.

use std::collections::{HashMap, HashSet};

use log::debug;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;

/// A connected client's outbound half: a sender into its writer task's FIFO
/// queue. Dropping every `ClientHandle` for a client signals its writer task
/// to exit.
#[derive(Clone)]
pub struct ClientHandle {
    pub id: u64,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    /// Queue `message` for delivery. Fails only once the client's writer
    /// task has already exited (connection dropped); the caller should treat
    /// that as "this client is gone" and let disconnect cleanup handle it.
    pub fn send(&self, message: ServerMessage) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.sender.send(message)
    }
}

pub struct ClientManager {
    clients: HashMap<u64, ClientHandle>,
    subscriptions: HashMap<String, HashSet<u64>>,
    next_id: u64,
}

impl Default for ClientManager {
    fn default() -> Self {
        ClientManager::new()
    }
}

impl ClientManager {
    pub fn new() -> Self {
        ClientManager { clients: HashMap::new(), subscriptions: HashMap::new(), next_id: 1 }
    }

    /// Register a freshly connected client, returning its handle and a
    /// receiver the caller should hand to a dedicated writer task.
    pub fn register(&mut self) -> (ClientHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle { id, sender: tx };
        self.clients.insert(id, handle.clone());
        (handle, rx)
    }

    pub fn get(&self, id: u64) -> Option<&ClientHandle> {
        self.clients.get(&id)
    }

    /// Add `client_id` to `topic_name`'s subscriber set. Idempotent: a
    /// duplicate subscribe is a no-op rather than an error.
    pub fn subscribe(&mut self, topic_name: &str, client_id: u64) {
        self.subscriptions.entry(topic_name.to_string()).or_default().insert(client_id);
    }

    pub fn unsubscribe(&mut self, topic_name: &str, client_id: u64) {
        if let Some(subs) = self.subscriptions.get_mut(topic_name) {
            subs.remove(&client_id);
        }
    }

    pub fn is_subscribed(&self, topic_name: &str, client_id: u64) -> bool {
        self.subscriptions.get(topic_name).is_some_and(|subs| subs.contains(&client_id))
    }

    pub fn subscribers(&self, topic_name: &str) -> impl Iterator<Item = u64> + '_ {
        self.subscriptions.get(topic_name).into_iter().flatten().copied()
    }

    /// Broadcast `message` to every subscriber of `topic_name`, dropping
    /// (and logging) any client whose writer task has already exited rather
    /// than letting one dead peer stop delivery to the rest.
    pub fn broadcast(&self, topic_name: &str, message: ServerMessage) {
        for client_id in self.subscribers(topic_name) {
            if let Some(handle) = self.clients.get(&client_id) {
                if handle.send(message.clone()).is_err() {
                    debug!("dropping message for disconnected client {client_id}");
                }
            }
        }
    }

    /// Remove every trace of `client_id`: its handle and every subscription.
    pub fn disconnect(&mut self, client_id: u64) {
        self.clients.remove(&client_id);
        for subs in self.subscriptions.values_mut() {
            subs.remove(&client_id);
        }
    }
}
