//! Frame encoding.
//!
//! A single message travels as its plain JSON envelope. Several messages
//! travel as a [`BatchFrame`]; when compression applies, the batch JSON is
//! raw-deflated and sent as a binary frame.

use std::io::{Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use serde_json::Value;

use crate::{
    config::BatchConfig,
    error::{TransportError, TransportResult},
    message::{BatchFrame, Envelope, now_millis},
    transport::WsMessage,
    types::MessageId,
};

/// Encode outgoing envelopes into one frame.
pub fn encode(envelopes: &[Envelope], config: &BatchConfig) -> TransportResult<WsMessage> {
    match envelopes {
        [] => Err(TransportError::internal("Cannot encode an empty batch")),
        [single] => Ok(WsMessage::Text(serde_json::to_string(single)?)),
        many => {
            let compressed = config.compression && many.len() >= config.compression_threshold;
            let frame = BatchFrame {
                messages: many.to_vec(),
                batch_id: MessageId::new().to_string(),
                timestamp: now_millis(),
                compressed,
            };
            if compressed {
                let json = serde_json::to_vec(&frame)?;
                Ok(WsMessage::Binary(deflate(&json)?))
            } else {
                Ok(WsMessage::Text(serde_json::to_string(&frame)?))
            }
        }
    }
}

/// Decode a text frame into its messages, unwrapping batches.
pub fn decode_text(text: &str) -> TransportResult<Vec<Value>> {
    let value: Value = serde_json::from_str(text)?;
    Ok(unwrap_batch(value))
}

/// Decode a compressed binary frame. The inflated payload is bounded by
/// `limit` bytes.
pub fn decode_binary(data: &[u8], limit: usize) -> TransportResult<Vec<Value>> {
    let json = inflate(data, limit)?;
    let value: Value = serde_json::from_slice(&json)?;
    Ok(unwrap_batch(value))
}

fn unwrap_batch(value: Value) -> Vec<Value> {
    let is_batch = value.get("type").and_then(Value::as_str) == Some("batch");
    if !is_batch {
        return vec![value];
    }
    match value {
        Value::Object(mut map) => match map.remove("messages") {
            Some(Value::Array(messages)) => messages,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

pub(crate) fn deflate(data: &[u8]) -> TransportResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn inflate(data: &[u8], limit: usize) -> TransportResult<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    let read = DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;
    if read > limit {
        return Err(TransportError::websocket(format!(
            "Decompressed frame exceeds {limit} bytes"
        )));
    }
    Ok(out)
}
