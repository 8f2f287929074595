use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tcg_realtime::{
    BatchConfig, ClientConfig, ConnectionState, Endpoint, InboundMessage, Message, MessageType,
    OutboundMessage, RealtimeClient, RoomId, Scheme,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::accept_async;

/// Echoes every chat message back to the sender.
async fn start_echo_server() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    if value["type"] != "chat_message" {
                        continue;
                    }
                    let reply = json!({
                        "type": "chat_message",
                        "roomId": value["roomId"],
                        "userId": "echo",
                        "content": value["content"],
                    });
                    if ws.send(Message::text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    Ok(port)
}

#[tokio::test]
async fn round_trip_over_real_socket() -> eyre::Result<()> {
    let port = start_echo_server().await?;
    let config = ClientConfig::new(Endpoint::new(Scheme::Ws, "127.0.0.1").port(port))
        .batch(BatchConfig::default().enabled(false));
    let client = RealtimeClient::new(config)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = client.add_event_listener(MessageType::ChatMessage, move |message| {
        if let InboundMessage::ChatMessage { content, .. } = message {
            let _ = tx.send(content.clone());
        }
    });

    client.connect().await?;
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.send(OutboundMessage::ChatMessage {
        room_id: RoomId::new("lobby"),
        content: "good game".to_string(),
    });

    let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(echoed.as_deref(), Some("good game"));

    client.disconnect();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_fails_connect() -> eyre::Result<()> {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };
    let config = ClientConfig::new(Endpoint::new(Scheme::Ws, "127.0.0.1").port(port))
        .probe_timeout(Duration::from_secs(2));
    let client = RealtimeClient::new(config)?;

    assert!(client.connect().await.is_err());
    assert_eq!(client.connection_state(), ConnectionState::Reconnecting);

    client.disconnect();
    Ok(())
}
