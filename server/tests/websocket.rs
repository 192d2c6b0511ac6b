//! Round trips over a real WebSocket connection

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use common::*;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(app: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::app(app.state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(app: &TestApp, addr: SocketAddr, client_id: u64) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws/{client_id}")).await.unwrap();
    // The server registers the client after the upgrade completes
    for _ in 0..200 {
        if app.state.clients.is_connected(client_id) {
            return socket;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client {client_id} never registered");
}

/// Next JSON frame, or None once the server closes the socket.
async fn next_frame(socket: &mut Socket) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .ok()??
            .ok()?;
        match message {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn frames_until_terminal(socket: &mut Socket) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = next_frame(socket).await {
        let kind = frame["type"].as_str().unwrap_or_default().to_string();
        frames.push(frame);
        if matches!(kind.as_str(), "complete" | "error" | "stopped") {
            break;
        }
    }
    frames
}

fn paragraphs(count: usize) -> String {
    (1..=count)
        .map(|i| format!("Paragraph number {i}."))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_over_socket_in_order() {
    let app = TestApp::new(Duration::from_millis(5));
    let addr = serve(&app).await;
    let mut socket = connect(&app, addr, 21).await;

    let response = app
        .post_json("/api/tts/stream", json!({ "text": paragraphs(5), "client_id": 21 }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let frames = frames_until_terminal(&mut socket).await;
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec!["start", "audio_url", "audio_url", "audio_url", "audio_url", "audio_url", "complete"]
    );
    for (i, frame) in frames[1..6].iter().enumerate() {
        assert_eq!(frame["text"], format!("Paragraph number {}.", i + 1));
    }
    assert_eq!(frames[6]["successful_count"], 5);
    assert_eq!(frames[6]["failed_count"], 0);

    let url = frames[3]["url"].as_str().unwrap();
    let response = app.get(url).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"RIFFParagraph number 3.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_message_ends_run() {
    let app = TestApp::new(Duration::from_millis(100));
    let addr = serve(&app).await;
    let mut socket = connect(&app, addr, 22).await;

    let response = app
        .post_json("/api/tts/stream", json!({ "text": paragraphs(40), "client_id": 22 }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    assert_eq!(next_frame(&mut socket).await.unwrap()["type"], "start");
    assert_eq!(next_frame(&mut socket).await.unwrap()["type"], "audio_url");
    socket
        .send(Message::Text(json!({ "type": "stop" }).to_string().into()))
        .await
        .unwrap();

    let frames = frames_until_terminal(&mut socket).await;
    assert_eq!(frames.last().unwrap()["type"], "stopped");
    assert!(frames.iter().all(|f| f["type"] != "complete"));

    let calls = app.provider.calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(app.provider.calls(), calls);
    assert!(calls < 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_stops_synthesis() {
    let app = TestApp::new(Duration::from_millis(100));
    let addr = serve(&app).await;
    let mut socket = connect(&app, addr, 23).await;

    let response = app
        .post_json("/api/tts/stream", json!({ "text": paragraphs(40), "client_id": 23 }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(next_frame(&mut socket).await.unwrap()["type"], "start");

    socket.close(None).await.unwrap();
    for _ in 0..200 {
        if !app.state.clients.is_connected(23) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!app.state.clients.is_connected(23));

    // In-flight calls may still land; nothing new starts after that
    tokio::time::sleep(Duration::from_millis(300)).await;
    let calls = app.provider.calls();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(app.provider.calls(), calls);
    assert!(calls < 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_replaces_connection() {
    let app = TestApp::new(Duration::from_millis(5));
    let addr = serve(&app).await;
    let mut first = connect(&app, addr, 30).await;
    let mut second = connect(&app, addr, 30).await;

    // The older socket is closed once the newer one registers
    assert!(next_frame(&mut first).await.is_none());
    assert!(app.state.clients.is_connected(30));

    let response = app
        .post_json("/api/tts/stream", json!({ "text": paragraphs(2), "client_id": 30 }))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let frames = frames_until_terminal(&mut second).await;
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[3]["type"], "complete");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_metrics_count_connected_clients() {
    let app = TestApp::new(Duration::ZERO);
    let addr = serve(&app).await;
    let _a = connect(&app, addr, 1).await;
    let _b = connect(&app, addr, 2).await;

    let metrics = body_json(app.get("/metrics").await).await;
    assert_eq!(metrics["connected_clients"], 2);
}
