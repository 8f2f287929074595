//! # tcg-realtime
//!
//! Reconnecting WebSocket client core for a trading-card-game community and
//! co-streaming platform.
//!
//! ## Features
//!
//! - **Connection State Machine**: `disconnected`, `connected`, `reconnecting`,
//!   `failed`, with change-only notifications to observers
//! - **Auto-Reconnection**: Exponential backoff over an explicit list of
//!   fallback endpoints, each probed with a timeout
//! - **Delivery Guarantees**: Bounded pending queue replayed in order after
//!   reconnect, bounded id tracking to suppress duplicates in both directions
//! - **Priority Batching**: Per-priority flush delays, critical messages
//!   bypass batching, large batches are deflate-compressed
//! - **Event Dispatch**: Typed inbound messages routed to listeners, with
//!   cache invalidation for state-changing events
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  send   ┌────────────────┐  flush   ┌──────────────────┐
//! │ RealtimeClient │───────▶│ MessageBatcher │────────▶│  Connection task │──▶ server
//! │    (Clone)     │         └────────────────┘          │ (one per socket) │
//! └──────┬─────────┘                                     └────────┬─────────┘
//!        │ queue while offline                                     │ inbound
//!        ▼                                                         ▼
//! ┌────────────────┐                                     ┌──────────────────┐
//! │  PendingQueue  │                                     │   EventRouter    │
//! └────────────────┘                                     └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tcg_realtime::{
//!     ClientConfig, Endpoint, MessageType, OutboundMessage, RealtimeClient, RoomId, Scheme,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(Endpoint::new(Scheme::Wss, "play.example.com"))
//!         .fallback(Endpoint::new(Scheme::Ws, "play.example.com").port(5001));
//!     let client = RealtimeClient::new(config)?;
//!
//!     let _chat = client.add_event_listener(MessageType::ChatMessage, |message| {
//!         println!("{message:?}");
//!     });
//!     client.connect().await?;
//!
//!     client.send(OutboundMessage::JoinGameRoom {
//!         room_id: RoomId::new("table-7"),
//!         player_name: Some("ada".into()),
//!     });
//!     Ok(())
//! }
//! ```

pub mod batcher;
pub mod client;
pub mod codec;
pub mod config;
mod connection;
pub mod dedup;
pub mod error;
pub mod message;
pub mod pending;
mod reconnect;
pub mod router;
pub mod state;
pub mod subscription;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::{RealtimeClient, RealtimeClientBuilder, ReconnectionSnapshot};
pub use config::{BatchConfig, ClientConfig, Endpoint, Scheme};
pub use error::{TransportError, TransportResult};
pub use message::{InboundMessage, MessageType, OutboundMessage, Priority};
pub use router::{CacheInvalidator, NoopInvalidator};
pub use state::ConnectionState;
pub use subscription::Subscription;
pub use transport::{Connector, FrameSink, FrameStream, Message, TungsteniteConnector};
pub use types::{MessageId, RoomId};
