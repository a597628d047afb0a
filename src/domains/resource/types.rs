use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::core::{
    parse_datetime, parse_optional_datetime, parse_optional_uuid, parse_uuid,
};
use crate::errors::DomainError;

/// Current materialized state of a conversation.
///
/// `sync_version` is the version of the last applied event and
/// `last_edited_by` the device that produced it; both drive conflict
/// detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub content: Option<String>,
    pub sync_version: i64,
    pub last_edited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Current materialized state of a chat message. Deletions are soft so the
/// event ledger can still be replayed against history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub content: String,
    pub is_deleted: bool,
    pub sync_version: i64,
    pub last_edited_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_edited_at: Option<DateTime<Utc>>,
}

/// Per-user settings blob. One row per user; the payload itself stays an
/// opaque JSON document owned by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub data: serde_json::Value,
    pub sync_version: i64,
    pub last_edited_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: Option<String>,
    pub sync_version: i64,
    pub last_edited_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub content: String,
    pub is_deleted: i64,
    pub sync_version: i64,
    pub last_edited_by: Option<String>,
    pub created_at: String,
    pub last_edited_at: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserSettingsRow {
    pub user_id: String,
    pub data: String,
    pub sync_version: i64,
    pub last_edited_by: Option<String>,
    pub updated_at: String,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = DomainError;
    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "conversations.id")?,
            user_id: parse_uuid(&row.user_id, "conversations.user_id")?,
            title: row.title,
            content: row.content,
            sync_version: row.sync_version,
            last_edited_by: parse_optional_uuid(row.last_edited_by, "conversations.last_edited_by")?,
            created_at: parse_datetime(&row.created_at, "conversations.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "conversations.updated_at")?,
        })
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = DomainError;
    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "messages.id")?,
            user_id: parse_uuid(&row.user_id, "messages.user_id")?,
            conversation_id: parse_uuid(&row.conversation_id, "messages.conversation_id")?,
            content: row.content,
            is_deleted: row.is_deleted == 1,
            sync_version: row.sync_version,
            last_edited_by: parse_optional_uuid(row.last_edited_by, "messages.last_edited_by")?,
            created_at: parse_datetime(&row.created_at, "messages.created_at")?,
            last_edited_at: parse_optional_datetime(row.last_edited_at, "messages.last_edited_at")?,
        })
    }
}

impl TryFrom<UserSettingsRow> for UserSettings {
    type Error = DomainError;
    fn try_from(row: UserSettingsRow) -> Result<Self, Self::Error> {
        let data = serde_json::from_str(&row.data)
            .map_err(|e| DomainError::Internal(format!("Corrupt settings JSON: {}", e)))?;
        Ok(Self {
            user_id: parse_uuid(&row.user_id, "user_settings.user_id")?,
            data,
            sync_version: row.sync_version,
            last_edited_by: parse_optional_uuid(row.last_edited_by, "user_settings.last_edited_by")?,
            updated_at: parse_datetime(&row.updated_at, "user_settings.updated_at")?,
        })
    }
}
