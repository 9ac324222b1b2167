//! WebSocket transport against a local tokio-tungstenite hub.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::init_logging;
use futures::{SinkExt, StreamExt};
use huddle_client::protocol::{self, RECORD_SEPARATOR};
use huddle_client::{
    ClientConfig, ConnectionManager, ConnectionState, Connector, HubMessage, ProtocolError,
    TransportError, WebSocketConnector,
};
use huddle_types::UserId;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn config_for(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        hub_url: format!("ws://{addr}/chathub"),
        ..ClientConfig::default()
    }
}

/// Accept one socket and answer the protocol handshake with `reply`.
async fn accept_with(listener: &TcpListener, reply: &str) -> ServerSocket {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(stream).await.unwrap();
    let hello = ws.next().await.unwrap().unwrap();
    let hello = hello.to_text().unwrap();
    assert!(hello.ends_with(RECORD_SEPARATOR));
    assert!(hello.contains("\"protocol\":\"json\""));
    ws.send(Message::text(format!("{reply}{RECORD_SEPARATOR}")))
        .await
        .unwrap();
    ws
}

/// Next hub records the client sent, skipping keep-alive pings.
async fn next_records(ws: &mut ServerSocket) -> Vec<HubMessage> {
    loop {
        let frame = ws.next().await.unwrap().unwrap();
        if let Message::Text(_) = frame {
            let records = protocol::decode_frame(frame.to_text().unwrap()).unwrap();
            let records: Vec<_> = records
                .into_iter()
                .filter(|m| *m != HubMessage::Ping)
                .collect();
            if !records.is_empty() {
                return records;
            }
        }
    }
}

#[tokio::test]
async fn test_handshake_then_push() {
    init_logging();
    let (listener, addr) = listen().await;
    let server = tokio::spawn(async move {
        let mut ws = accept_with(&listener, "{}").await;
        let push = HubMessage::invocation(None, "ReceiveNotification", vec![json!("welcome")]);
        ws.send(Message::text(push.encode())).await.unwrap();
        // Keep the socket open until the client goes away
        while let Some(Ok(_)) = ws.next().await {}
    });

    let connector = WebSocketConnector::new(&config_for(addr));
    let mut link = connector.connect(&UserId::new("5")).await.unwrap();
    let msg = link.inbound.recv().await.unwrap();
    assert_eq!(
        msg,
        HubMessage::invocation(None, "ReceiveNotification", vec![json!("welcome")])
    );

    drop(link);
    server.await.unwrap();
}

#[tokio::test]
async fn test_records_sharing_handshake_frame() {
    init_logging();
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let push = HubMessage::invocation(None, "ReceiveNotification", vec![json!("early")]);
        let reply = format!(
            "{{}}{RECORD_SEPARATOR}{}",
            push.encode().trim_end_matches(RECORD_SEPARATOR)
        );
        let mut ws = accept_with(&listener, &reply).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let connector = WebSocketConnector::new(&config_for(addr));
    let mut link = connector.connect(&UserId::new("5")).await.unwrap();
    match link.inbound.recv().await.unwrap() {
        HubMessage::Invocation { arguments, .. } => assert_eq!(arguments, vec![json!("early")]),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_rejected() {
    init_logging();
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        let mut ws = accept_with(&listener, r#"{"error":"unsupported protocol"}"#).await;
        let _ = ws.close(None).await;
    });

    let connector = WebSocketConnector::new(&config_for(addr));
    let err = connector.connect(&UserId::new("5")).await.unwrap_err();
    assert_eq!(
        err,
        TransportError::Protocol(ProtocolError::HandshakeRejected(
            "unsupported protocol".into()
        ))
    );
}

#[tokio::test]
async fn test_connect_refused() {
    init_logging();
    let (listener, addr) = listen().await;
    drop(listener);

    let connector = WebSocketConnector::new(&config_for(addr));
    assert!(matches!(
        connector.connect(&UserId::new("5")).await,
        Err(TransportError::Connect(_))
    ));
}

#[tokio::test]
async fn test_manager_sends_over_websocket() {
    init_logging();
    let (listener, addr) = listen().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Vec<Value>>();
    tokio::spawn(async move {
        let mut ws = accept_with(&listener, "{}").await;
        loop {
            for record in next_records(&mut ws).await {
                if let HubMessage::Invocation {
                    invocation_id: Some(id),
                    target,
                    arguments,
                } = record
                {
                    assert_eq!(target, "SendMessage");
                    let done = HubMessage::Completion {
                        invocation_id: id,
                        result: None,
                        error: None,
                    };
                    ws.send(Message::text(done.encode())).await.unwrap();
                    let _ = seen_tx.send(arguments);
                }
            }
        }
    });

    let config = config_for(addr);
    let manager = ConnectionManager::spawn(Arc::new(WebSocketConnector::new(&config)), &config);
    manager.connect(Some(&UserId::new("1"))).await.unwrap();
    manager
        .send_message(&UserId::new("1"), &UserId::new("2"), "over the wire")
        .await
        .unwrap();

    assert_eq!(
        seen_rx.recv().await.unwrap(),
        vec![json!(1), json!(2), json!("over the wire")]
    );
}

#[tokio::test]
async fn test_server_close_triggers_reconnect() {
    init_logging();
    let (listener, addr) = listen().await;
    tokio::spawn(async move {
        // First socket: hang up right after the handshake
        let mut first = accept_with(&listener, "{}").await;
        let _ = first.close(None).await;
        // Second socket: stay up
        let mut second = accept_with(&listener, "{}").await;
        while let Some(Ok(_)) = second.next().await {}
    });

    let config = config_for(addr);
    let manager = ConnectionManager::spawn(Arc::new(WebSocketConnector::new(&config)), &config);
    let mut status = manager.subscribe_status();
    let first = manager.connect(Some(&UserId::new("1"))).await.unwrap();

    loop {
        if let huddle_client::ConnectionStatus::Reconnected { generation } =
            status.recv().await.unwrap()
        {
            assert_eq!(generation, first.generation + 1);
            break;
        }
    }
    assert_eq!(manager.state(), ConnectionState::Connected);
}
