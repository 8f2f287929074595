//! Per-transport connection task.
//!
//! One task runs for every open transport. It owns both halves of the
//! transport, writes frames handed over by the client, and feeds inbound
//! frames to the router until either side closes.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    message::Envelope,
    router::EventRouter,
    transport::{
        ABNORMAL_CLOSURE, FrameSink, FrameStream, Message, WsMessage, close_code,
        normal_close_frame,
    },
};

/// Commands from the client to the connection task.
#[derive(Debug)]
pub(crate) enum Outgoing {
    /// Write `frame`. `envelopes` are the messages it carries, kept so they
    /// can be queued again if the write fails.
    Frame {
        frame: WsMessage,
        envelopes: Vec<Envelope>,
    },
    /// Close the transport with a normal closure.
    Close,
}

/// How a transport ended when the client did not close it.
#[derive(Debug)]
pub(crate) struct Closed {
    pub code: u16,
    pub reason: Option<String>,
    /// Messages handed to this transport that were never written.
    pub unsent: Vec<Envelope>,
}

impl Closed {
    fn abnormal(reason: Option<String>) -> Self {
        Self {
            code: ABNORMAL_CLOSURE,
            reason,
            unsent: Vec::new(),
        }
    }
}

/// Drive one transport. Returns `None` when the client closed it.
pub(crate) async fn connection_task(
    router: &EventRouter,
    commands: &mut mpsc::UnboundedReceiver<Outgoing>,
    mut sink: FrameSink,
    mut stream: FrameStream,
) -> Option<Closed> {
    let mut closed = loop {
        tokio::select! {
            biased;
            command = commands.recv() => {
                match command {
                    Some(Outgoing::Frame { frame, envelopes }) => {
                        if let Err(err) = sink.send(frame.into_message()).await {
                            warn!(error = %err, count = envelopes.len(), "WebSocket write failed");
                            break Closed {
                                unsent: envelopes,
                                ..Closed::abnormal(Some(err.to_string()))
                            };
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        if let Err(err) = sink.send(normal_close_frame()).await {
                            debug!(error = %err, "Failed to send close frame");
                        }
                        let _ = sink.close().await;
                        return None;
                    }
                }
            }
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => router.dispatch_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => router.dispatch_binary(&data),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let code = close_code(frame.as_ref());
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty());
                        debug!(code, reason = ?reason, "Server closed connection");
                        break Closed {
                            code,
                            reason,
                            unsent: Vec::new(),
                        };
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "WebSocket read error");
                        break Closed::abnormal(Some(err.to_string()));
                    }
                    None => break Closed::abnormal(None),
                }
            }
        }
    };

    // Frames still waiting in the channel never reached this transport.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Outgoing::Frame { envelopes, .. } = command {
            closed.unsent.extend(envelopes);
        }
    }
    Some(closed)
}
