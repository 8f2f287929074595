#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt, channel::mpsc as fmpsc};
use parking_lot::Mutex;
use serde_json::Value;
use tcg_realtime::{
    CacheInvalidator, ClientConfig, ConnectionState, Connector, Endpoint, FrameSink, FrameStream,
    Message, RealtimeClient, Scheme, Subscription, TransportError, TransportResult, codec,
};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

/// Server side of one in-memory transport.
pub struct ServerConn {
    pub endpoint: Endpoint,
    /// Frames written by the client.
    pub frames: fmpsc::UnboundedReceiver<Message>,
    /// Frames (or errors) delivered to the client.
    pub sender: fmpsc::UnboundedSender<TransportResult<Message>>,
}

impl ServerConn {
    pub async fn next_frame(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client dropped the transport")
    }

    /// Next data frame, unwrapped into its messages.
    pub async fn next_messages(&mut self) -> Vec<Value> {
        match self.next_frame().await {
            Message::Text(text) => codec::decode_text(text.as_str()).unwrap(),
            Message::Binary(data) => codec::decode_binary(&data, 1024 * 1024).unwrap(),
            other => panic!("expected a data frame, got {other:?}"),
        }
    }

    /// A frame the client already wrote, without waiting.
    pub fn try_frame(&mut self) -> Option<Message> {
        self.frames.next().now_or_never().flatten()
    }

    pub fn push(&self, value: Value) {
        self.sender
            .unbounded_send(Ok(Message::text(value.to_string())))
            .unwrap();
    }

    pub fn push_binary(&self, data: Vec<u8>) {
        self.sender.unbounded_send(Ok(Message::binary(data))).unwrap();
    }

    pub fn close(&self, code: CloseCode) {
        self.sender
            .unbounded_send(Ok(Message::Close(Some(CloseFrame {
                code,
                reason: "server closing".into(),
            }))))
            .unwrap();
    }
}

#[derive(Default)]
struct MockState {
    refuse_all: AtomicBool,
    refused: Mutex<HashSet<String>>,
    hung: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
}

/// In-memory [`Connector`]. Every accepted transport is handed to the test
/// through the receiver returned by [`MockConnector::new`].
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
    accepted: mpsc::UnboundedSender<ServerConn>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(MockState::default()),
                accepted,
            },
            rx,
        )
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.state.refuse_all.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse(&self, host: &str) {
        self.state.refused.lock().insert(host.to_string());
    }

    pub fn hang(&self, host: &str) {
        self.state.hung.lock().insert(host.to_string());
    }

    /// Hold every connect for `delay` before answering.
    pub fn delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<(FrameSink, FrameStream)> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.hung.lock().contains(&endpoint.host) {
            futures::future::pending::<()>().await;
        }
        if self.state.refuse_all.load(Ordering::SeqCst)
            || self.state.refused.lock().contains(&endpoint.host)
        {
            return Err(TransportError::websocket("Connection refused"));
        }

        let (to_server, frames) = fmpsc::unbounded::<Message>();
        let (sender, from_server) = fmpsc::unbounded::<TransportResult<Message>>();
        let _ = self.accepted.send(ServerConn {
            endpoint: endpoint.clone(),
            frames,
            sender,
        });

        let sink: FrameSink =
            Box::pin(to_server.sink_map_err(|e| TransportError::websocket(e.to_string())));
        let stream: FrameStream = Box::pin(from_server);
        Ok((sink, stream))
    }
}

#[derive(Clone, Default)]
pub struct RecordingInvalidator {
    pub keys: Arc<Mutex<Vec<Vec<String>>>>,
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, key: &[String]) {
        self.keys.lock().push(key.to_vec());
    }
}

pub fn endpoint(host: &str) -> Endpoint {
    Endpoint::new(Scheme::Ws, host).port(5001)
}

pub fn config() -> ClientConfig {
    ClientConfig::new(endpoint("primary.test"))
}

pub fn client(config: ClientConfig, connector: &MockConnector) -> RealtimeClient {
    RealtimeClient::builder(config)
        .connector(connector.clone())
        .build()
        .unwrap()
}

pub type StateLog = Arc<Mutex<Vec<(ConnectionState, u32)>>>;

pub fn record_states(client: &RealtimeClient) -> (StateLog, Subscription) {
    let log: StateLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let sub = client.on_connection_state_change(move |state, attempt| {
        sink.lock().push((state, attempt));
    });
    (log, sub)
}

pub async fn wait_for_state(client: &RealtimeClient, state: ConnectionState) {
    wait_until(|| client.connection_state() == state).await;
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(120), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn next_conn(accepted: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
    tokio::time::timeout(Duration::from_secs(120), accepted.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}
