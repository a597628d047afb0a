use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domains::core::{
    parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid,
};
use crate::errors::{DomainError, DomainResult, SyncError, ValidationError};

/// The kind of change a device produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    MessageSent,
    MessageEdited,
    MessageDeleted,
    ConversationCreated,
    ConversationUpdated,
    SettingsUpdated,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::MessageSent => "message_sent",
            SyncEventType::MessageEdited => "message_edited",
            SyncEventType::MessageDeleted => "message_deleted",
            SyncEventType::ConversationCreated => "conversation_created",
            SyncEventType::ConversationUpdated => "conversation_updated",
            SyncEventType::SettingsUpdated => "settings_updated",
        }
    }

    /// The resource type this event kind is allowed to mutate.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            SyncEventType::MessageSent
            | SyncEventType::MessageEdited
            | SyncEventType::MessageDeleted => ResourceType::Message,
            SyncEventType::ConversationCreated | SyncEventType::ConversationUpdated => {
                ResourceType::Conversation
            }
            SyncEventType::SettingsUpdated => ResourceType::Settings,
        }
    }

    /// Whether this event creates its resource rather than mutating an
    /// existing one.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            SyncEventType::MessageSent
                | SyncEventType::ConversationCreated
                | SyncEventType::SettingsUpdated
        )
    }
}

impl FromStr for SyncEventType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_sent" => Ok(SyncEventType::MessageSent),
            "message_edited" => Ok(SyncEventType::MessageEdited),
            "message_deleted" => Ok(SyncEventType::MessageDeleted),
            "conversation_created" => Ok(SyncEventType::ConversationCreated),
            "conversation_updated" => Ok(SyncEventType::ConversationUpdated),
            "settings_updated" => Ok(SyncEventType::SettingsUpdated),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "event_type",
                &format!("Unknown event type: {}", s),
            ))),
        }
    }
}

impl From<SyncEventType> for String {
    fn from(event_type: SyncEventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// The kind of resource an event targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Conversation,
    Message,
    Settings,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Conversation => "conversation",
            ResourceType::Message => "message",
            ResourceType::Settings => "settings",
        }
    }
}

impl FromStr for ResourceType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(ResourceType::Conversation),
            "message" => Ok(ResourceType::Message),
            "settings" => Ok(ResourceType::Settings),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "resource_type",
                &format!("Unknown resource type: {}", s),
            ))),
        }
    }
}

impl From<ResourceType> for String {
    fn from(resource_type: ResourceType) -> Self {
        resource_type.as_str().to_string()
    }
}

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Manual,
    AutoMerge,
    Device1Wins,
    Device2Wins,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Manual => "manual",
            ConflictResolution::AutoMerge => "auto_merge",
            ConflictResolution::Device1Wins => "device1_wins",
            ConflictResolution::Device2Wins => "device2_wins",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ConflictResolution::Manual),
            "auto_merge" => Ok(ConflictResolution::AutoMerge),
            "device1_wins" => Ok(ConflictResolution::Device1Wins),
            "device2_wins" => Ok(ConflictResolution::Device2Wins),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "resolution",
                &format!("Unknown resolution mode: {}", s),
            ))),
        }
    }
}

impl From<ConflictResolution> for String {
    fn from(resolution: ConflictResolution) -> Self {
        resolution.as_str().to_string()
    }
}

/// An immutable fact in the per-user ledger: device D produced a change of
/// type T to resource R, declaring local version V.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub event_type: SyncEventType,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub event_data: serde_json::Value,
    /// Server-assigned; total order for audit and catch-up only.
    pub timestamp: DateTime<Utc>,
    /// Client-declared logical version of the resource being mutated.
    pub sync_version: i64,
    pub is_processed: bool,
}

/// Incoming event fields as carried by a `sync_event` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventInput {
    pub event_type: SyncEventType,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub event_data: serde_json::Value,
    pub sync_version: i64,
}

impl SyncEventInput {
    pub fn validate(&self) -> DomainResult<()> {
        if self.event_type.resource_type() != self.resource_type {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "resource_type",
                &format!(
                    "{} events target {} resources, not {}",
                    self.event_type.as_str(),
                    self.event_type.resource_type().as_str(),
                    self.resource_type.as_str()
                ),
            )));
        }
        if self.sync_version < 1 {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "sync_version",
                "must be a positive version number",
            )));
        }
        Ok(())
    }
}

/// Two divergent versions of the same resource, kept forever as an audit
/// trail. `data_1`/`device_id_1` describe the already-applied state,
/// `data_2`/`device_id_2` the incoming edit that lost the race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub user_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub device_id_1: Uuid,
    pub device_id_2: Uuid,
    pub version_1: i64,
    pub version_2: i64,
    pub data_1: serde_json::Value,
    pub data_2: serde_json::Value,
    pub resolution: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Typed event payloads, keyed by event type.
///
/// `event_data` arrives as opaque JSON; it is parsed into this union before
/// any mutation so stringly-typed access never leaks past the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    MessageSent(MessageSentPayload),
    MessageEdited(MessageEditedPayload),
    MessageDeleted,
    ConversationCreated(ConversationCreatedPayload),
    ConversationUpdated(ConversationUpdatedPayload),
    SettingsUpdated(SettingsUpdatedPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSentPayload {
    pub conversation_id: Uuid,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEditedPayload {
    pub content: String,
    pub last_edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationCreatedPayload {
    pub title: String,
    pub content: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationUpdatedPayload {
    pub title: Option<String>,
    pub content: Option<String>,
    pub last_edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdatedPayload {
    pub settings: serde_json::Value,
    pub updated_at: Option<DateTime<Utc>>,
}

impl EventPayload {
    /// Parse raw `event_data` according to the event type.
    pub fn parse(event_type: SyncEventType, data: &serde_json::Value) -> DomainResult<Self> {
        let invalid = |e: serde_json::Error| {
            DomainError::Sync(SyncError::InvalidPayload {
                event_type: event_type.as_str().to_string(),
                reason: e.to_string(),
            })
        };

        match event_type {
            SyncEventType::MessageSent => Ok(EventPayload::MessageSent(
                serde_json::from_value(data.clone()).map_err(invalid)?,
            )),
            SyncEventType::MessageEdited => Ok(EventPayload::MessageEdited(
                serde_json::from_value(data.clone()).map_err(invalid)?,
            )),
            SyncEventType::MessageDeleted => Ok(EventPayload::MessageDeleted),
            SyncEventType::ConversationCreated => Ok(EventPayload::ConversationCreated(
                serde_json::from_value(data.clone()).map_err(invalid)?,
            )),
            SyncEventType::ConversationUpdated => Ok(EventPayload::ConversationUpdated(
                serde_json::from_value(data.clone()).map_err(invalid)?,
            )),
            SyncEventType::SettingsUpdated => Ok(EventPayload::SettingsUpdated(
                serde_json::from_value(data.clone()).map_err(invalid)?,
            )),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncEventRow {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: String,
    pub event_data: String,
    pub timestamp: String,
    pub sync_version: i64,
    pub is_processed: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncConflictRow {
    pub id: String,
    pub user_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub device_id_1: String,
    pub device_id_2: String,
    pub version_1: i64,
    pub version_2: i64,
    pub data_1: String,
    pub data_2: String,
    pub resolution: Option<String>,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
    pub created_at: String,
}

impl TryFrom<SyncEventRow> for SyncEvent {
    type Error = DomainError;
    fn try_from(row: SyncEventRow) -> Result<Self, Self::Error> {
        let event_data = serde_json::from_str(&row.event_data)
            .map_err(|e| DomainError::Internal(format!("Corrupt event_data JSON: {}", e)))?;
        Ok(Self {
            id: parse_uuid(&row.id, "sync_events.id")?,
            user_id: parse_uuid(&row.user_id, "sync_events.user_id")?,
            device_id: parse_uuid(&row.device_id, "sync_events.device_id")?,
            event_type: SyncEventType::from_str(&row.event_type)?,
            resource_type: ResourceType::from_str(&row.resource_type)?,
            resource_id: parse_uuid(&row.resource_id, "sync_events.resource_id")?,
            event_data,
            timestamp: parse_datetime(&row.timestamp, "sync_events.timestamp")?,
            sync_version: row.sync_version,
            is_processed: row.is_processed == 1,
        })
    }
}

impl TryFrom<SyncConflictRow> for SyncConflict {
    type Error = DomainError;
    fn try_from(row: SyncConflictRow) -> Result<Self, Self::Error> {
        let data_1 = serde_json::from_str(&row.data_1)
            .map_err(|e| DomainError::Internal(format!("Corrupt data_1 JSON: {}", e)))?;
        let data_2 = serde_json::from_str(&row.data_2)
            .map_err(|e| DomainError::Internal(format!("Corrupt data_2 JSON: {}", e)))?;
        Ok(Self {
            id: parse_uuid(&row.id, "sync_conflicts.id")?,
            user_id: parse_uuid(&row.user_id, "sync_conflicts.user_id")?,
            resource_type: ResourceType::from_str(&row.resource_type)?,
            resource_id: parse_uuid(&row.resource_id, "sync_conflicts.resource_id")?,
            device_id_1: parse_uuid(&row.device_id_1, "sync_conflicts.device_id_1")?,
            device_id_2: parse_uuid(&row.device_id_2, "sync_conflicts.device_id_2")?,
            version_1: row.version_1,
            version_2: row.version_2,
            data_1,
            data_2,
            resolution: row
                .resolution
                .map(|s| ConflictResolution::from_str(&s))
                .transpose()?,
            resolved_at: parse_optional_datetime(row.resolved_at, "sync_conflicts.resolved_at")?,
            resolved_by: parse_optional_uuid(row.resolved_by, "sync_conflicts.resolved_by")?,
            created_at: parse_datetime(&row.created_at, "sync_conflicts.created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_maps_to_resource_type() {
        assert_eq!(
            SyncEventType::MessageSent.resource_type(),
            ResourceType::Message
        );
        assert_eq!(
            SyncEventType::ConversationUpdated.resource_type(),
            ResourceType::Conversation
        );
        assert_eq!(
            SyncEventType::SettingsUpdated.resource_type(),
            ResourceType::Settings
        );
    }

    #[test]
    fn input_validation_rejects_mismatched_resource_type() {
        let input = SyncEventInput {
            event_type: SyncEventType::MessageSent,
            resource_type: ResourceType::Conversation,
            resource_id: Uuid::new_v4(),
            event_data: json!({}),
            sync_version: 1,
        };
        assert!(input.validate().is_err());

        let input = SyncEventInput {
            resource_type: ResourceType::Message,
            ..input
        };
        assert!(input.validate().is_ok());
    }

    #[test]
    fn input_validation_rejects_non_positive_version() {
        let input = SyncEventInput {
            event_type: SyncEventType::SettingsUpdated,
            resource_type: ResourceType::Settings,
            resource_id: Uuid::new_v4(),
            event_data: json!({"settings": {}}),
            sync_version: 0,
        };
        assert!(input.validate().is_err());
    }

    #[test]
    fn payload_parse_by_event_type() {
        let conversation_id = Uuid::new_v4();
        let payload = EventPayload::parse(
            SyncEventType::MessageSent,
            &json!({"conversation_id": conversation_id, "content": "hello"}),
        )
        .unwrap();
        assert_eq!(
            payload,
            EventPayload::MessageSent(MessageSentPayload {
                conversation_id,
                content: "hello".to_string(),
                created_at: None,
            })
        );

        // message_sent without content is malformed
        assert!(EventPayload::parse(
            SyncEventType::MessageSent,
            &json!({"conversation_id": conversation_id})
        )
        .is_err());

        // deletion carries no payload fields
        assert_eq!(
            EventPayload::parse(SyncEventType::MessageDeleted, &json!({})).unwrap(),
            EventPayload::MessageDeleted
        );
    }

    #[test]
    fn resolution_string_round_trip() {
        for r in [
            ConflictResolution::Manual,
            ConflictResolution::AutoMerge,
            ConflictResolution::Device1Wins,
            ConflictResolution::Device2Wins,
        ] {
            assert_eq!(ConflictResolution::from_str(r.as_str()).unwrap(), r);
        }
    }
}
