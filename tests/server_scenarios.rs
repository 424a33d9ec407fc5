//! End-to-end scenarios exercised against `Server` directly: client
//! subscription, action proposal, and broadcast — without the transport hop
//! (WebSocket framing is covered by `transport.rs`'s own unit of
//! responsibility, not these scenario tests).

use topicsync::change::{Change, ChangeBody, StringKind};
use topicsync::config::ServerConfig;
use topicsync::protocol::ServerMessage;
use topicsync::server::Server;
use topicsync::value::TopicType;

#[tokio::test]
async fn simple_broadcast_reaches_every_subscriber() {
    let server = Server::new(ServerConfig::default());
    server.add_topic("a", TopicType::String, true).await.unwrap();

    let (client1, mut client1_rx) = server.accept_client().await;
    let _hello1 = client1_rx.recv().await.unwrap();
    server.subscribe(client1.id, "a").await.unwrap();
    let _init1 = client1_rx.recv().await.unwrap();

    let set_hello = Change::new(
        "a".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Set { old_value: String::new(), value: "hello".to_string() }),
    );
    server.handle_message(client1.id, topicsync::protocol::ClientMessage::Action {
        action_id: "act1".to_string(),
        commands: vec![set_hello],
    }).await;

    let (client2, mut client2_rx) = server.accept_client().await;
    let _hello2 = client2_rx.recv().await.unwrap();
    server.subscribe(client2.id, "a").await.unwrap();
    match client2_rx.recv().await.unwrap() {
        ServerMessage::Init { value, .. } => assert_eq!(value, serde_json::json!("hello")),
        other => panic!("expected init, got {other:?}"),
    }

    let set_world = Change::new(
        "a".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Set { old_value: "hello".to_string(), value: "world".to_string() }),
    );
    server.handle_message(client1.id, topicsync::protocol::ClientMessage::Action {
        action_id: "act2".to_string(),
        commands: vec![set_world],
    }).await;

    match client2_rx.recv().await.unwrap() {
        ServerMessage::Update { changes, .. } => {
            assert_eq!(changes.len(), 1);
            match &changes[0].body {
                ChangeBody::Str(StringKind::Set { value, .. }) => assert_eq!(value, "world"),
                other => panic!("expected a string set change, got {other:?}"),
            }
        }
        other => panic!("expected update, got {other:?}"),
    }

    let state = server.state();
    let state = state.lock().await;
    match state.get_topic("a").unwrap().value() {
        topicsync::value::TopicValue::Str(s) => assert_eq!(s, "world"),
        other => panic!("expected a string value, got {other:?}"),
    }
}

#[tokio::test]
async fn validator_rejection_sends_reject_and_never_commits() {
    let server = Server::new(ServerConfig::default());
    server.add_topic("a", TopicType::String, true).await.unwrap();
    {
        let state = server.state();
        let mut state = state.lock().await;
        state
            .add_validator(
                "a",
                Box::new(|new, _change| !matches!(new, topicsync::value::TopicValue::Str(s) if s == "world")),
            )
            .unwrap();
    }

    let (client, mut client_rx) = server.accept_client().await;
    let _hello = client_rx.recv().await.unwrap();
    server.subscribe(client.id, "a").await.unwrap();
    let _init = client_rx.recv().await.unwrap();

    let set_world = Change::new(
        "a".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Set { old_value: String::new(), value: "world".to_string() }),
    );
    server.handle_message(client.id, topicsync::protocol::ClientMessage::Action {
        action_id: "act1".to_string(),
        commands: vec![set_world],
    }).await;

    match client_rx.recv().await.unwrap() {
        ServerMessage::Reject { .. } => {}
        other => panic!("expected reject, got {other:?}"),
    }

    let state = server.state();
    let state = state.lock().await;
    match state.get_topic("a").unwrap().value() {
        topicsync::value::TopicValue::Str(s) => assert_eq!(s, ""),
        other => panic!("expected a string value, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_string_inserts_over_the_wire_converge_via_ot_rewind() {
    // Two inserts composed against the same base_version, delivered as raw
    // client actions (the real wire path), must reconcile through the
    // server the same way StateMachine::insert_string does directly.
    let server = Server::new(ServerConfig::default());
    server.add_topic("doc", TopicType::String, true).await.unwrap();

    let (client, mut client_rx) = server.accept_client().await;
    let _hello = client_rx.recv().await.unwrap();
    server.subscribe(client.id, "doc").await.unwrap();
    let _init = client_rx.recv().await.unwrap();

    let set_base = Change::new(
        "doc".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Set { old_value: String::new(), value: "abcd".to_string() }),
    );
    server.handle_message(client.id, topicsync::protocol::ClientMessage::Action {
        action_id: "set".to_string(),
        commands: vec![set_base],
    }).await;
    let _update = client_rx.recv().await.unwrap();

    let base_version = {
        let state = server.state();
        let state = state.lock().await;
        state.get_topic("doc").unwrap().string_version.clone().unwrap()
    };

    let insert_first = Change::new(
        "doc".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Insert { pos: 1, text: "xxxx".to_string(), base_version: base_version.clone() }),
    );
    server.handle_message(client.id, topicsync::protocol::ClientMessage::Action {
        action_id: "ins1".to_string(),
        commands: vec![insert_first],
    }).await;

    let insert_second = Change::new(
        "doc".to_string(),
        TopicType::String,
        ChangeBody::Str(StringKind::Insert { pos: 3, text: "yyyy".to_string(), base_version }),
    );
    server.handle_message(client.id, topicsync::protocol::ClientMessage::Action {
        action_id: "ins2".to_string(),
        commands: vec![insert_second],
    }).await;

    let state = server.state();
    let state = state.lock().await;
    match state.get_topic("doc").unwrap().value() {
        topicsync::value::TopicValue::Str(s) => assert_eq!(s, "axxxxbcyyyyd"),
        other => panic!("expected a string value, got {other:?}"),
    }
}
