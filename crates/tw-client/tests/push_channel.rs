//! Push channel against a real local WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tw_client::{
    ClientIdentity, ConnectionState, PollOptions, PushSettings, StatusSource, TaskClient,
    WsConnector,
};
use tw_common::FetchError;
use tw_protocol::{TaskId, TaskStatusReport, TaskUpdate};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

struct Unreachable;

#[async_trait]
impl StatusSource for Unreachable {
    async fn fetch_status(&self, _task_id: TaskId) -> Result<TaskStatusReport, FetchError> {
        Err(FetchError::Status {
            status: 503,
            body: String::new(),
        })
    }
}

/// Accept WebSocket clients forever, handing each socket to the test.
async fn start_server() -> (SocketAddr, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });
    (addr, rx)
}

fn client_for(addr: SocketAddr) -> TaskClient {
    let identity = ClientIdentity::from_string("client_1700000000000_itest0001");
    let push = PushSettings {
        url: identity.push_url(&format!("ws://{}/api/v1/ws", addr)),
        reconnect_interval: Duration::from_millis(100),
        max_reconnect_attempts: 3,
        keepalive_interval: None,
    };
    TaskClient::new(
        identity,
        push,
        Arc::new(WsConnector),
        Arc::new(Unreachable),
        PollOptions::default(),
    )
}

async fn accept(sockets: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(WAIT, sockets.recv())
        .await
        .expect("client did not connect")
        .expect("server stopped")
}

async fn next_json(ws: &mut ServerSocket) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("no frame from client")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn push_updates_reach_only_matching_observer() {
    let (addr, mut sockets) = start_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    let mut ws = accept(&mut sockets).await;

    let (tx, mut updates) = mpsc::unbounded_channel::<TaskUpdate>();
    let observer = client.observe(42, move |update| {
        let _ = tx.send(update.clone());
    });

    let sub = next_json(&mut ws).await;
    assert_eq!(sub["type"], "subscribe_task");
    assert_eq!(sub["task_id"], 42);

    ws.send(Message::Text(
        r#"{"type":"task_update","task_id":43,"data":{"progress":10,"status":"processing"}}"#
            .into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"type":"task_update","task_id":42,"data":{"progress":50,"status":"processing"}}"#
            .into(),
    ))
    .await
    .unwrap();

    let update = tokio::time::timeout(WAIT, updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.progress, 50.0);
    assert!(updates.try_recv().is_err());

    observer.unobserve();
    let unsub = next_json(&mut ws).await;
    assert_eq!(unsub["type"], "unsubscribe_task");
    assert_eq!(unsub["task_id"], 42);

    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_resubscribes_watched_tasks() {
    let (addr, mut sockets) = start_server().await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    let mut ws = accept(&mut sockets).await;

    let _observer = client.observe(7, |_| {});
    assert_eq!(next_json(&mut ws).await["type"], "subscribe_task");

    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = accept(&mut sockets).await;
    let sub = next_json(&mut ws).await;
    assert_eq!(sub["type"], "subscribe_task");
    assert_eq!(sub["task_id"], 7);

    let mut state = client.stats().state;
    for _ in 0..50 {
        if state == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = client.stats().state;
    }
    assert_eq!(state, ConnectionState::Connected);
    assert_eq!(client.stats().reconnect_attempts, 0);

    client.disconnect().await;
}

#[tokio::test]
async fn connect_to_closed_port_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr);
    assert!(client.connect().await.is_err());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
