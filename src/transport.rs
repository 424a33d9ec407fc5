//! # Transport
//!
//! The WebSocket accept loop and per-connection plumbing: one reader task
//! driving `Server::handle_message`, one writer task draining a client's
//! outbound FIFO queue, both ending when the socket closes either way.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::ClientMessage;
use crate::server::Server;

/// Bind `host:port` and accept connections until the process is stopped,
/// spawning one task per connection.
pub async fn serve(server: Arc<Server>) -> Result<()> {
    let addr = format!("{}:{}", server.config.host, server.config.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    spawn_update_buffer_clock(server.clone());

    loop {
        let (stream, peer) = listener.accept().await?;
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server, stream).await {
                warn!("connection {peer} ended: {e}");
            }
        });
    }
}

fn spawn_update_buffer_clock(server: Arc<Server>) {
    let interval = std::time::Duration::from_millis(server.config.update_buffer_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            server.flush_update_buffer().await;
        }
    });
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await.context("WebSocket handshake")?;
    let (mut write, mut read) = ws.split();

    let (handle, mut outbox) = server.accept_client().await;
    let client_id = handle.id;
    info!("client {client_id} connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if write.send(WsMessage::Text(message.to_frame())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(frame) = read.next().await {
        let frame = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                error!("client {client_id} read error: {e}");
                break;
            }
        };
        match ClientMessage::from_frame(&frame) {
            Ok(message) => server.handle_message(client_id, message).await,
            Err(e) => warn!("client {client_id} sent a malformed frame: {e}"),
        }
    }

    server.disconnect_client(client_id).await;
    writer.abort();
    info!("client {client_id} disconnected");
    Ok(())
}
