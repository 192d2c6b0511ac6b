// WebSocket connections that receive streamed units

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::AppState;

/// Messages a client may send over its socket
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Stop,
    Ping,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(client_id): Path<u64>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, client_id: u64) {
    let mut connection = state.clients.register(client_id);
    let connection_id = connection.connection;
    let (mut sender, mut receiver) = socket.split();

    // Frames are written by one task so the dispatcher never waits on the socket directly
    let mut forward = tokio::spawn(async move {
        while let Some(frame) = connection.frames.recv().await {
            if let Err(e) = sender.send(Message::Text(frame.to_json().into())).await {
                debug!("Client {} socket closed while sending: {}", client_id, e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut forward => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Stop) => {
                        state.clients.stop(client_id);
                    }
                    Ok(ClientMessage::Ping) => {}
                    Err(e) => warn!("Client {} sent an unknown message: {}", client_id, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {} socket error: {}", client_id, e);
                    break;
                }
            },
        }
    }

    // Stops any run still streaming to this connection
    state.clients.unregister(client_id, connection_id);
    forward.abort();
}
