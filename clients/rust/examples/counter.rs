//! Connects to a topicsync server, subscribes to an int topic, and
//! increments it once a second.

use std::time::Duration;

use topicsync::change::{ChangeBody, IntKind};
use topicsync::{Change, TopicType};
use topicsync_client::Client;

#[tokio::main]
async fn main() -> topicsync_client::Result<()> {
    env_logger::init();

    let url = std::env::args().nth(1).unwrap_or_else(|| "ws://127.0.0.1:9000".to_string());
    let (client, mut events) = Client::connect(&url).await?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
        }
    });

    client.subscribe("room/visitors", TopicType::Int).await?;

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        client
            .propose(vec![Change::new(
                "room/visitors".to_string(),
                TopicType::Int,
                ChangeBody::Int(IntKind::Add { value: 1 }),
            )])
            .await?;
        if let Some(value) = client.get("room/visitors").await {
            println!("room/visitors = {value:?}");
        }
    }
}
