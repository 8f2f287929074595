//! Wire message types.
//!
//! Every frame is one JSON object discriminated by its `type` field. Outbound
//! and inbound messages are closed enums, so adding a message type forces the
//! priority table and the dispatch router to be updated with it.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MessageId, RoomId};

/// Messages the client sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    JoinGameRoom {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_name: Option<String>,
    },
    LeaveGameRoom {
        room_id: RoomId,
    },
    JoinCollabRoom {
        room_id: RoomId,
        user_id: String,
    },
    LeaveCollabRoom {
        room_id: RoomId,
    },
    ChatMessage {
        room_id: RoomId,
        content: String,
    },
    GameAction {
        room_id: RoomId,
        action: String,
        #[serde(default)]
        data: Value,
    },
    WebrtcOffer {
        room_id: RoomId,
        target_id: String,
        offer: Value,
    },
    WebrtcAnswer {
        room_id: RoomId,
        target_id: String,
        answer: Value,
    },
    IceCandidate {
        room_id: RoomId,
        target_id: String,
        candidate: Value,
    },
    PhaseChange {
        room_id: RoomId,
        phase: String,
    },
    CoordinationEvent {
        room_id: RoomId,
        event_type: String,
        #[serde(default)]
        data: Value,
    },
    StatusUpdate {
        room_id: RoomId,
        status: String,
    },
    Typing {
        room_id: RoomId,
        is_typing: bool,
    },
    /// Ask the server for a full state resync.
    SyncRequest {
        room_id: RoomId,
    },
}

impl OutboundMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::JoinGameRoom { .. } => MessageType::JoinGameRoom,
            Self::LeaveGameRoom { .. } => MessageType::LeaveGameRoom,
            Self::JoinCollabRoom { .. } => MessageType::JoinCollabRoom,
            Self::LeaveCollabRoom { .. } => MessageType::LeaveCollabRoom,
            Self::ChatMessage { .. } => MessageType::ChatMessage,
            Self::GameAction { .. } => MessageType::GameAction,
            Self::WebrtcOffer { .. } => MessageType::WebrtcOffer,
            Self::WebrtcAnswer { .. } => MessageType::WebrtcAnswer,
            Self::IceCandidate { .. } => MessageType::IceCandidate,
            Self::PhaseChange { .. } => MessageType::PhaseChange,
            Self::CoordinationEvent { .. } => MessageType::CoordinationEvent,
            Self::StatusUpdate { .. } => MessageType::StatusUpdate,
            Self::Typing { .. } => MessageType::Typing,
            Self::SyncRequest { .. } => MessageType::SyncRequest,
        }
    }

    pub fn priority(&self) -> Priority {
        self.message_type().priority()
    }
}

/// Messages the client receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    CollaboratorJoined {
        room_id: RoomId,
        user_id: String,
        #[serde(default)]
        user_name: Option<String>,
    },
    CollaboratorLeft {
        room_id: RoomId,
        user_id: String,
    },
    PhaseUpdated {
        room_id: RoomId,
        phase: String,
    },
    RoomState {
        room_id: RoomId,
        #[serde(default)]
        state: Value,
    },
    StateSync {
        room_id: RoomId,
        #[serde(default)]
        state: Value,
    },
    TournamentUpdated {
        tournament_id: String,
    },
    ChatMessage {
        room_id: RoomId,
        #[serde(default)]
        user_id: Option<String>,
        content: String,
    },
    GameAction {
        room_id: RoomId,
        #[serde(default)]
        player_id: Option<String>,
        action: String,
        #[serde(default)]
        data: Value,
    },
    WebrtcOffer {
        room_id: RoomId,
        from_id: String,
        offer: Value,
    },
    WebrtcAnswer {
        room_id: RoomId,
        from_id: String,
        answer: Value,
    },
    IceCandidate {
        room_id: RoomId,
        from_id: String,
        candidate: Value,
    },
    CoordinationEvent {
        room_id: RoomId,
        event_type: String,
        #[serde(default)]
        data: Value,
    },
    StatusUpdate {
        room_id: RoomId,
        #[serde(default)]
        user_id: Option<String>,
        status: String,
    },
    Typing {
        room_id: RoomId,
        user_id: String,
        is_typing: bool,
    },
    Error {
        message: String,
    },
    Pong,
}

impl InboundMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::CollaboratorJoined { .. } => MessageType::CollaboratorJoined,
            Self::CollaboratorLeft { .. } => MessageType::CollaboratorLeft,
            Self::PhaseUpdated { .. } => MessageType::PhaseUpdated,
            Self::RoomState { .. } => MessageType::RoomState,
            Self::StateSync { .. } => MessageType::StateSync,
            Self::TournamentUpdated { .. } => MessageType::TournamentUpdated,
            Self::ChatMessage { .. } => MessageType::ChatMessage,
            Self::GameAction { .. } => MessageType::GameAction,
            Self::WebrtcOffer { .. } => MessageType::WebrtcOffer,
            Self::WebrtcAnswer { .. } => MessageType::WebrtcAnswer,
            Self::IceCandidate { .. } => MessageType::IceCandidate,
            Self::CoordinationEvent { .. } => MessageType::CoordinationEvent,
            Self::StatusUpdate { .. } => MessageType::StatusUpdate,
            Self::Typing { .. } => MessageType::Typing,
            Self::Error { .. } => MessageType::Error,
            Self::Pong => MessageType::Pong,
        }
    }
}

/// The `type` discriminant of any frame, used for priority lookup and
/// listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    JoinGameRoom,
    LeaveGameRoom,
    JoinCollabRoom,
    LeaveCollabRoom,
    ChatMessage,
    GameAction,
    WebrtcOffer,
    WebrtcAnswer,
    IceCandidate,
    PhaseChange,
    CoordinationEvent,
    StatusUpdate,
    Typing,
    SyncRequest,
    StateSync,
    CollaboratorJoined,
    CollaboratorLeft,
    PhaseUpdated,
    RoomState,
    TournamentUpdated,
    Error,
    Pong,
}

impl MessageType {
    /// Static priority classification.
    pub fn priority(self) -> Priority {
        match self {
            Self::SyncRequest | Self::StateSync => Priority::Critical,
            Self::WebrtcOffer
            | Self::WebrtcAnswer
            | Self::IceCandidate
            | Self::PhaseChange
            | Self::PhaseUpdated
            | Self::GameAction
            | Self::CoordinationEvent => Priority::High,
            Self::StatusUpdate | Self::Typing => Priority::Low,
            Self::JoinGameRoom
            | Self::LeaveGameRoom
            | Self::JoinCollabRoom
            | Self::LeaveCollabRoom
            | Self::ChatMessage
            | Self::CollaboratorJoined
            | Self::CollaboratorLeft
            | Self::RoomState
            | Self::TournamentUpdated
            | Self::Error
            | Self::Pong => Priority::Normal,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self) {
            Ok(Value::String(name)) => f.write_str(&name),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// Batching priority class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Sent immediately, never batched.
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Batch priorities in flush order.
    pub const BATCHED: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Priority-adjusted batch delay, `None` for messages that bypass batching.
    pub fn batch_delay(self, base: Duration) -> Option<Duration> {
        match self {
            Self::Critical => None,
            Self::High => Some(base / 2),
            Self::Normal => Some(base),
            Self::Low => Some(base * 2),
        }
    }
}

/// An outbound message together with its deduplication id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    #[serde(flatten)]
    pub message: OutboundMessage,
}

impl Envelope {
    pub fn new(id: MessageId, message: OutboundMessage) -> Self {
        Self { id, message }
    }
}

/// An inbound message with the optional id the sender declared.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub id: Option<MessageId>,
    #[serde(flatten)]
    pub message: InboundMessage,
}

/// `{ "type": "batch", "messages": [...], "batchId", "timestamp", "compressed" }`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "batch", rename_all = "camelCase")]
pub struct BatchFrame<M> {
    pub messages: Vec<M>,
    pub batch_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
}

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_envelope_is_flat_json() {
        let envelope = Envelope::new(
            MessageId::from("m-1"),
            OutboundMessage::ChatMessage {
                room_id: RoomId::new("r1"),
                content: "gg".to_string(),
            },
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({"id": "m-1", "type": "chat_message", "roomId": "r1", "content": "gg"})
        );
    }

    #[test]
    fn inbound_frame_parses_with_and_without_id() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type":"phase_updated","id":"e-9","roomId":"r1","phase":"combat"}"#,
        )
        .unwrap();
        assert_eq!(frame.id, Some(MessageId::from("e-9")));
        assert_eq!(frame.message.message_type(), MessageType::PhaseUpdated);

        let frame: InboundFrame = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(frame.id.is_none());
        assert_eq!(frame.message, InboundMessage::Pong);
    }

    #[test]
    fn batch_frame_wire_shape() {
        let frame = BatchFrame {
            messages: vec![json!({"type": "pong"})],
            batch_id: "b-1".to_string(),
            timestamp: 10,
            compressed: false,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "batch", "messages": [{"type": "pong"}], "batchId": "b-1", "timestamp": 10})
        );
    }

    #[test]
    fn priority_classification() {
        assert_eq!(MessageType::SyncRequest.priority(), Priority::Critical);
        assert_eq!(MessageType::IceCandidate.priority(), Priority::High);
        assert_eq!(MessageType::ChatMessage.priority(), Priority::Normal);
        assert_eq!(MessageType::StatusUpdate.priority(), Priority::Low);
    }

    #[test]
    fn priority_delays_scale_with_base() {
        let base = Duration::from_millis(50);
        assert_eq!(Priority::Critical.batch_delay(base), None);
        assert_eq!(Priority::High.batch_delay(base), Some(Duration::from_millis(25)));
        assert_eq!(Priority::Normal.batch_delay(base), Some(base));
        assert_eq!(Priority::Low.batch_delay(base), Some(Duration::from_millis(100)));
    }

    #[test]
    fn message_type_display_matches_wire_name() {
        assert_eq!(MessageType::CollaboratorJoined.to_string(), "collaborator_joined");
    }
}
