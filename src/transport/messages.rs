use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::device::types::{Device, DeviceType};
use crate::domains::resource::types::{Conversation, Message};
use crate::domains::sync::types::{
    ConflictResolution, ResourceType, SyncConflict, SyncEvent, SyncEventType,
};

/// Messages a device sends to the sync core.
///
/// The core is transport-agnostic: anything that can deliver these tagged
/// records (WebSocket frames, a test channel) works as a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    RegisterDevice {
        device_id: Uuid,
        device_name: String,
        device_type: DeviceType,
        user_agent: Option<String>,
    },
    SyncEvent {
        event_type: SyncEventType,
        resource_type: ResourceType,
        resource_id: Uuid,
        event_data: serde_json::Value,
        sync_version: i64,
    },
    ResolveConflict {
        conflict_id: Uuid,
        resolution: ConflictResolution,
    },
    GetSyncStatus,
    RequestSync {
        last_sync_time: Option<DateTime<Utc>>,
    },
    Heartbeat,
}

/// Outcome reported in a `sync_event_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Processed,
    Conflict,
}

/// Payload carried inside the `sync_message` broadcast envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastData {
    SyncEvent {
        event: SyncEvent,
    },
    ConflictResolved {
        conflict_id: Uuid,
        resolution: ConflictResolution,
        resource_type: ResourceType,
        resource_id: Uuid,
    },
}

/// Messages the sync core sends to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        user_id: Uuid,
    },
    AuthError {
        message: String,
    },
    DeviceRegistered {
        device_id: Uuid,
    },
    Error {
        message: String,
    },
    InitialSync {
        conversations: Vec<Conversation>,
        messages: Vec<Message>,
        device_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    SyncEventAck {
        event_id: Uuid,
        status: AckStatus,
        /// Present when `status` is `Conflict`: the recorded divergence,
        /// both payloads included, so the device can ask the user to pick a
        /// resolution and send `resolve_conflict` with this id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict: Option<SyncConflict>,
    },
    SyncEventError {
        event_id: Option<Uuid>,
        error: String,
    },
    /// Fan-out envelope delivered to a user's other devices.
    SyncMessage {
        data: BroadcastData,
    },
    ConflictResolved {
        conflict_id: Uuid,
        resolution: ConflictResolution,
    },
    SyncStatus {
        active_devices: Vec<Device>,
        current_device: Option<Uuid>,
        last_sync_time: Option<DateTime<Utc>>,
    },
    SyncData {
        events: Vec<SyncEvent>,
        timestamp: DateTime<Utc>,
    },
    HeartbeatAck {
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_deserialize_from_tagged_json() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "authenticate", "token": "abc"})).unwrap();
        assert!(matches!(msg, ClientMessage::Authenticate { ref token } if token == "abc"));

        let msg: ClientMessage = serde_json::from_value(json!({"type": "heartbeat"})).unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat));

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "sync_event",
            "event_type": "message_sent",
            "resource_type": "message",
            "resource_id": Uuid::new_v4(),
            "event_data": {"conversation_id": Uuid::new_v4(), "content": "hi"},
            "sync_version": 1
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::SyncEvent { .. }));
    }

    #[test]
    fn server_messages_serialize_with_snake_case_tags() {
        let value = serde_json::to_value(ServerMessage::HeartbeatAck {
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(value["type"], json!("heartbeat_ack"));

        let value = serde_json::to_value(ServerMessage::SyncMessage {
            data: BroadcastData::ConflictResolved {
                conflict_id: Uuid::new_v4(),
                resolution: ConflictResolution::AutoMerge,
                resource_type: ResourceType::Conversation,
                resource_id: Uuid::new_v4(),
            },
        })
        .unwrap();
        assert_eq!(value["type"], json!("sync_message"));
        assert_eq!(value["data"]["type"], json!("conflict_resolved"));
        assert_eq!(value["data"]["resolution"], json!("auto_merge"));

        // A clean ack omits the conflict field entirely.
        let value = serde_json::to_value(ServerMessage::SyncEventAck {
            event_id: Uuid::new_v4(),
            status: AckStatus::Processed,
            conflict: None,
        })
        .unwrap();
        assert_eq!(value["type"], json!("sync_event_ack"));
        assert_eq!(value["status"], json!("processed"));
        assert!(value.get("conflict").is_none());
    }
}
