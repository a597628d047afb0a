use async_trait::async_trait;
use sqlx::{query, query_as, QueryBuilder, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::resource::types::{
    Conversation, ConversationRow, Message, MessageRow, UserSettings, UserSettingsRow,
};
use crate::errors::{DbError, DomainError, DomainResult};

/// Repository for materialized resource state.
///
/// Event application and conflict resolution read and write resources inside
/// the caller's transaction so a persisted-but-unapplied event cannot
/// survive a crash; the pool-based reads serve initial-sync snapshots.
///
/// Lookups are scoped to the owning user: a resource id that exists but
/// belongs to someone else reads as `EntityNotFound`, never as the row.
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    async fn get_conversation_tx<'t>(
        &self,
        id: Uuid,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Conversation>>;

    async fn save_conversation_tx<'t>(
        &self,
        conversation: &Conversation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn get_message_tx<'t>(
        &self,
        id: Uuid,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Message>>;

    async fn save_message_tx<'t>(
        &self,
        message: &Message,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn get_settings_tx<'t>(
        &self,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<UserSettings>>;

    async fn save_settings_tx<'t>(
        &self,
        settings: &UserSettings,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Most-recently-updated conversations for the initial sync snapshot.
    async fn recent_conversations(
        &self,
        user_id: Uuid,
        limit: u32,
    ) -> DomainResult<Vec<Conversation>>;

    /// Non-deleted messages belonging to the given conversations, oldest
    /// first.
    async fn messages_for_conversations(
        &self,
        conversation_ids: &[Uuid],
    ) -> DomainResult<Vec<Message>>;
}

/// SQLite implementation of the ResourceRepository
pub struct SqliteResourceRepository {
    pool: SqlitePool,
}

impl SqliteResourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceRepository for SqliteResourceRepository {
    async fn get_conversation_tx<'t>(
        &self,
        id: Uuid,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Conversation>> {
        let row = query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;

        match row.map(Conversation::try_from).transpose()? {
            // Another user's row is indistinguishable from a missing one to
            // the caller, but it must not fall through to an overwrite.
            Some(conversation) if conversation.user_id != user_id => Err(
                DomainError::EntityNotFound("conversations".to_string(), id.to_string()),
            ),
            other => Ok(other),
        }
    }

    async fn save_conversation_tx<'t>(
        &self,
        conversation: &Conversation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"
            INSERT OR REPLACE INTO conversations (
                id, user_id, title, content, sync_version, last_edited_by,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.user_id.to_string())
        .bind(&conversation.title)
        .bind(&conversation.content)
        .bind(conversation.sync_version)
        .bind(conversation.last_edited_by.map(|id| id.to_string()))
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn get_message_tx<'t>(
        &self,
        id: Uuid,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Message>> {
        let row = query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;

        match row.map(Message::try_from).transpose()? {
            Some(message) if message.user_id != user_id => Err(DomainError::EntityNotFound(
                "messages".to_string(),
                id.to_string(),
            )),
            other => Ok(other),
        }
    }

    async fn save_message_tx<'t>(
        &self,
        message: &Message,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"
            INSERT OR REPLACE INTO messages (
                id, user_id, conversation_id, content, is_deleted, sync_version,
                last_edited_by, created_at, last_edited_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.user_id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(&message.content)
        .bind(message.is_deleted as i64)
        .bind(message.sync_version)
        .bind(message.last_edited_by.map(|id| id.to_string()))
        .bind(message.created_at.to_rfc3339())
        .bind(message.last_edited_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn get_settings_tx<'t>(
        &self,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<UserSettings>> {
        let row = query_as::<_, UserSettingsRow>("SELECT * FROM user_settings WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;

        row.map(UserSettings::try_from).transpose()
    }

    async fn save_settings_tx<'t>(
        &self,
        settings: &UserSettings,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let data = serde_json::to_string(&settings.data)
            .map_err(|e| DbError::Query(format!("Settings payload not serializable: {}", e)))?;

        query(
            r#"
            INSERT OR REPLACE INTO user_settings (
                user_id, data, sync_version, last_edited_by, updated_at
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(settings.user_id.to_string())
        .bind(data)
        .bind(settings.sync_version)
        .bind(settings.last_edited_by.map(|id| id.to_string()))
        .bind(settings.updated_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn recent_conversations(
        &self,
        user_id: Uuid,
        limit: u32,
    ) -> DomainResult<Vec<Conversation>> {
        let rows = query_as::<_, ConversationRow>(
            r#"
            SELECT * FROM conversations
            WHERE user_id = ?
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(Conversation::try_from).collect()
    }

    async fn messages_for_conversations(
        &self,
        conversation_ids: &[Uuid],
    ) -> DomainResult<Vec<Message>> {
        if conversation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::new(
            "SELECT * FROM messages WHERE is_deleted = 0 AND conversation_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in conversation_ids {
            separated.push_bind(id.to_string());
        }
        separated.push_unseparated(") ORDER BY created_at ASC");

        let rows = builder
            .build_query_as::<MessageRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(Message::try_from).collect()
    }
}
