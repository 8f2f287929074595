//! Physical transport abstraction.
//!
//! The client only needs a sink for outgoing frames and a stream of incoming
//! ones. [`Connector`] produces both for an [`Endpoint`]; the default
//! implementation is backed by `tokio-tungstenite`.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
pub use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::debug;

use crate::{
    config::Endpoint,
    error::{TransportError, TransportResult},
};

/// Close code used for deliberate client shutdown. Never triggers a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code recorded when the transport drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code recorded when a close frame carries no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Outgoing half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = TransportError> + Send>>;
/// Incoming half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = TransportResult<Message>> + Send>>;

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a transport to `endpoint`. The caller applies the probe timeout.
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<(FrameSink, FrameStream)>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<(FrameSink, FrameStream)> {
        let (ws, response) = connect_async(endpoint.url()).await?;
        debug!(endpoint = %endpoint, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        let sink: FrameSink = Box::pin(sink.sink_map_err(TransportError::from));
        let stream: FrameStream = Box::pin(stream.map(|item| item.map_err(TransportError::from)));
        Ok((sink, stream))
    }
}

/// Connection epoch. Bumped whenever a transport is installed or the session
/// is reset, so work started for an older epoch can recognise itself as stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ConnectionEpoch(pub u64);

/// Frame payload representation.
#[derive(Clone, Debug, PartialEq)]
pub enum WsMessage {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Create a text message.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Create a binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Get as text if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Get as bytes regardless of message type.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    pub(crate) fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::text(text),
            Self::Binary(data) => Message::binary(data),
        }
    }
}

pub(crate) fn normal_close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "Client disconnect".into(),
    }))
}

pub(crate) fn close_code(frame: Option<&CloseFrame>) -> u16 {
    frame.map_or(NO_STATUS_RECEIVED, |frame| u16::from(frame.code))
}
