//! # topicsync-client
//!
//! A Rust client for a topicsync broker. Connects over WebSocket, keeps a
//! local mirror of every subscribed topic in sync with the server, and
//! applies mutations optimistically — locally first, reconciled against
//! whatever the server actually commits.
//!
//! ```rust,no_run
//! use topicsync::change::{ChangeBody, IntKind};
//! use topicsync::{Change, TopicType};
//! use topicsync_client::Client;
//!
//! # #[tokio::main]
//! # async fn main() -> topicsync_client::Result<()> {
//! let (client, _events) = Client::connect("ws://127.0.0.1:9000").await?;
//! client.subscribe("room/visitors", TopicType::Int).await?;
//! client
//!     .propose(vec![Change::new(
//!         "room/visitors".to_string(),
//!         TopicType::Int,
//!         ChangeBody::Int(IntKind::Add { value: 1 }),
//!     )])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
mod mirror;
mod transport;

pub use error::{Error, Result};
pub use mirror::ClientMirror;
pub use transport::{Client, ClientEvent};
