//! Realtime Client Example
//!
//! Joins a game room, prints chat and phase updates, and logs connection
//! state transitions.
//!
//! Run with: `cargo run -p tcg-realtime --example realtime_client -- ws://localhost:5001/ws`

use std::time::Duration;

use tcg_realtime::{
    ClientConfig, ConnectionState, Endpoint, InboundMessage, MessageType, OutboundMessage,
    RealtimeClient, RoomId,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:5001/ws".to_string());
    let config = ClientConfig::new(Endpoint::parse(&url)?)
        .reconnect_base_delay(Duration::from_millis(500))
        .max_reconnect_attempts(8);
    let client = RealtimeClient::new(config)?;

    let _states = client.on_connection_state_change(|state, attempt| match state {
        ConnectionState::Reconnecting => tracing::warn!(attempt, "reconnecting"),
        ConnectionState::Failed => tracing::error!(attempt, "giving up"),
        _ => tracing::info!(%state, "connection state changed"),
    });

    let _chat = client.add_event_listener(MessageType::ChatMessage, |message| {
        if let InboundMessage::ChatMessage {
            user_id, content, ..
        } = message
        {
            tracing::info!(user = user_id.as_deref().unwrap_or("?"), "{content}");
        }
    });
    let _phase = client.add_event_listener(MessageType::PhaseUpdated, |message| {
        if let InboundMessage::PhaseUpdated { room_id, phase } = message {
            tracing::info!(%room_id, %phase, "phase updated");
        }
    });

    let room = RoomId::new("table-7");
    if let Err(e) = client.connect().await {
        // Sends below are queued and replayed once a retry succeeds.
        tracing::warn!(error = %e, "initial connect failed");
    }

    client.set_game_room_id(Some(room.clone()));
    client.send(OutboundMessage::JoinGameRoom {
        room_id: room.clone(),
        player_name: Some("example".to_string()),
    });
    client.send(OutboundMessage::ChatMessage {
        room_id: room.clone(),
        content: "gl hf".to_string(),
    });

    tokio::time::sleep(Duration::from_secs(30)).await;

    client.send(OutboundMessage::LeaveGameRoom { room_id: room });
    client.flush_all_batches();
    client.disconnect();
    Ok(())
}
