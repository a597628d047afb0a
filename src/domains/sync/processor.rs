use std::sync::Arc;

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::resource::repository::ResourceRepository;
use crate::domains::resource::types::{Conversation, Message, UserSettings};
use crate::domains::sync::repository::{SyncConflictRepository, SyncEventRepository};
use crate::domains::sync::types::{
    EventPayload, ResourceType, SyncConflict, SyncEvent, SyncEventInput,
};
use crate::errors::{DbError, DomainError, DomainResult, SyncError};

/// Result of processing one inbound event.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The event was applied to canonical state and should be broadcast to
    /// the user's other devices.
    Applied(SyncEvent),
    /// The event diverged from canonical state; a conflict row was recorded
    /// instead of applying, and nothing is broadcast until resolution.
    Conflict {
        event_id: Uuid,
        conflict: SyncConflict,
    },
}

/// Current materialized state of whichever resource an event targets.
enum ResourceState {
    Conversation(Conversation),
    Message(Message),
    Settings(UserSettings),
}

impl ResourceState {
    fn sync_version(&self) -> i64 {
        match self {
            ResourceState::Conversation(c) => c.sync_version,
            ResourceState::Message(m) => m.sync_version,
            ResourceState::Settings(s) => s.sync_version,
        }
    }

    fn last_edited_by(&self) -> Option<Uuid> {
        match self {
            ResourceState::Conversation(c) => c.last_edited_by,
            ResourceState::Message(m) => m.last_edited_by,
            ResourceState::Settings(s) => s.last_edited_by,
        }
    }

    fn snapshot(&self) -> DomainResult<serde_json::Value> {
        let value = match self {
            ResourceState::Conversation(c) => serde_json::to_value(c),
            ResourceState::Message(m) => serde_json::to_value(m),
            ResourceState::Settings(s) => serde_json::to_value(s),
        };
        value.map_err(|e| DomainError::Internal(format!("Snapshot serialization failed: {}", e)))
    }
}

/// Wraps a failure that left the event row in the ledger, so callers can
/// report which event went unapplied.
fn not_applied(event_id: Uuid, source: DomainError) -> DomainError {
    DomainError::Sync(SyncError::EventNotApplied {
        event_id,
        source: Box::new(source),
    })
}

/// Validates, persists and applies one inbound sync event.
///
/// The event row, the resource mutation (or conflict row) and the processed
/// flag all land in a single transaction, so a crash can never leave a
/// persisted-but-unapplied event behind. Version divergence is a
/// classification, not a rejection: the event always enters the ledger.
pub struct EventProcessor {
    pool: SqlitePool,
    events: Arc<dyn SyncEventRepository>,
    conflicts: Arc<dyn SyncConflictRepository>,
    resources: Arc<dyn ResourceRepository>,
}

impl EventProcessor {
    pub fn new(
        pool: SqlitePool,
        events: Arc<dyn SyncEventRepository>,
        conflicts: Arc<dyn SyncConflictRepository>,
        resources: Arc<dyn ResourceRepository>,
    ) -> Self {
        Self {
            pool,
            events,
            conflicts,
            resources,
        }
    }

    pub async fn process(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        input: SyncEventInput,
    ) -> DomainResult<ProcessOutcome> {
        input.validate()?;

        let mut event = SyncEvent {
            id: Uuid::new_v4(),
            user_id,
            device_id,
            event_type: input.event_type,
            resource_type: input.resource_type,
            resource_id: input.resource_id,
            event_data: input.event_data.clone(),
            timestamp: Utc::now(),
            sync_version: input.sync_version,
            is_processed: false,
        };

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        self.events.create_event_tx(&event, &mut tx).await?;

        // A malformed payload still enters the ledger, unprocessed, so the
        // device can retry via request_sync after fixing itself.
        let payload = match EventPayload::parse(event.event_type, &event.event_data) {
            Ok(payload) => payload,
            Err(e) => {
                tx.commit().await.map_err(DbError::from)?;
                return Err(not_applied(event.id, e));
            }
        };

        // A resource id owned by another user reads as not-found here; the
        // event keeps its ledger row either way.
        let current = match self
            .load_current(input.resource_type, input.resource_id, user_id, &mut tx)
            .await
        {
            Ok(current) => current,
            Err(e @ DomainError::EntityNotFound(_, _)) => {
                tx.commit().await.map_err(DbError::from)?;
                return Err(not_applied(event.id, e));
            }
            Err(e) => return Err(e),
        };

        // Mutating a resource that does not exist is a processing error for
        // edit events (deletes are idempotent no-ops, creations proceed).
        if current.is_none()
            && !event.event_type.is_creation()
            && !matches!(payload, EventPayload::MessageDeleted)
        {
            tx.commit().await.map_err(DbError::from)?;
            return Err(not_applied(
                event.id,
                DomainError::EntityNotFound(
                    input.resource_type.as_str().to_string(),
                    input.resource_id.to_string(),
                ),
            ));
        }

        let divergent = match &current {
            None => false,
            Some(state) => {
                event.sync_version <= state.sync_version()
                    && state.last_edited_by() != Some(device_id)
            }
        };

        if divergent {
            let state = current.as_ref().ok_or_else(|| {
                DomainError::Internal("Divergence detected without current state".to_string())
            })?;
            let conflict = SyncConflict {
                id: Uuid::new_v4(),
                user_id,
                resource_type: event.resource_type,
                resource_id: event.resource_id,
                device_id_1: state.last_edited_by().unwrap_or_else(Uuid::nil),
                device_id_2: device_id,
                version_1: state.sync_version(),
                version_2: event.sync_version,
                data_1: state.snapshot()?,
                data_2: event.event_data.clone(),
                resolution: None,
                resolved_at: None,
                resolved_by: None,
                created_at: Utc::now(),
            };
            self.conflicts.create_conflict_tx(&conflict, &mut tx).await?;
            self.events.mark_processed_tx(event.id, &mut tx).await?;
            tx.commit().await.map_err(DbError::from)?;

            log::debug!(
                "Conflict {} recorded for {} {} (v{} vs incoming v{})",
                conflict.id,
                conflict.resource_type.as_str(),
                conflict.resource_id,
                conflict.version_1,
                conflict.version_2
            );
            return Ok(ProcessOutcome::Conflict {
                event_id: event.id,
                conflict,
            });
        }

        self.apply(&event, &payload, current, &mut tx).await?;
        self.events.mark_processed_tx(event.id, &mut tx).await?;
        tx.commit().await.map_err(DbError::from)?;

        event.is_processed = true;
        Ok(ProcessOutcome::Applied(event))
    }

    async fn load_current<'t>(
        &self,
        resource_type: ResourceType,
        resource_id: Uuid,
        user_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<ResourceState>> {
        let state = match resource_type {
            ResourceType::Conversation => self
                .resources
                .get_conversation_tx(resource_id, user_id, tx)
                .await?
                .map(ResourceState::Conversation),
            ResourceType::Message => self
                .resources
                .get_message_tx(resource_id, user_id, tx)
                .await?
                .map(ResourceState::Message),
            ResourceType::Settings => self
                .resources
                .get_settings_tx(user_id, tx)
                .await?
                .map(ResourceState::Settings),
        };
        Ok(state)
    }

    /// Apply the mutation for one event. The new version never moves
    /// backwards: an idempotent same-device retry keeps the current version.
    async fn apply<'t>(
        &self,
        event: &SyncEvent,
        payload: &EventPayload,
        current: Option<ResourceState>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now();
        let current_version = current.as_ref().map(ResourceState::sync_version).unwrap_or(0);
        let new_version = event.sync_version.max(current_version);

        match payload {
            EventPayload::MessageSent(p) => {
                let existing = match current {
                    Some(ResourceState::Message(m)) => Some(m),
                    _ => None,
                };
                let message = Message {
                    id: event.resource_id,
                    user_id: event.user_id,
                    conversation_id: p.conversation_id,
                    content: p.content.clone(),
                    is_deleted: existing.as_ref().map(|m| m.is_deleted).unwrap_or(false),
                    sync_version: new_version,
                    last_edited_by: Some(event.device_id),
                    created_at: p
                        .created_at
                        .or(existing.as_ref().map(|m| m.created_at))
                        .unwrap_or(now),
                    last_edited_at: existing.and_then(|m| m.last_edited_at),
                };
                self.resources.save_message_tx(&message, tx).await?;
            }
            EventPayload::MessageEdited(p) => {
                let mut message = match current {
                    Some(ResourceState::Message(m)) => m,
                    _ => {
                        return Err(DomainError::EntityNotFound(
                            "messages".to_string(),
                            event.resource_id.to_string(),
                        ))
                    }
                };
                message.content = p.content.clone();
                message.last_edited_at = Some(p.last_edited_at.unwrap_or(now));
                message.last_edited_by = Some(event.device_id);
                message.sync_version = new_version;
                self.resources.save_message_tx(&message, tx).await?;
            }
            EventPayload::MessageDeleted => {
                // Deleting an already-absent message re-confirms the same
                // outcome; nothing to write.
                if let Some(ResourceState::Message(mut message)) = current {
                    message.is_deleted = true;
                    message.last_edited_at = Some(now);
                    message.last_edited_by = Some(event.device_id);
                    message.sync_version = new_version;
                    self.resources.save_message_tx(&message, tx).await?;
                }
            }
            EventPayload::ConversationCreated(p) => {
                let existing = match current {
                    Some(ResourceState::Conversation(c)) => Some(c),
                    _ => None,
                };
                let conversation = Conversation {
                    id: event.resource_id,
                    user_id: event.user_id,
                    title: p.title.clone(),
                    content: p.content.clone(),
                    sync_version: new_version,
                    last_edited_by: Some(event.device_id),
                    created_at: p
                        .created_at
                        .or(existing.map(|c| c.created_at))
                        .unwrap_or(now),
                    updated_at: now,
                };
                self.resources.save_conversation_tx(&conversation, tx).await?;
            }
            EventPayload::ConversationUpdated(p) => {
                let mut conversation = match current {
                    Some(ResourceState::Conversation(c)) => c,
                    _ => {
                        return Err(DomainError::EntityNotFound(
                            "conversations".to_string(),
                            event.resource_id.to_string(),
                        ))
                    }
                };
                if let Some(title) = &p.title {
                    conversation.title = title.clone();
                }
                if let Some(content) = &p.content {
                    conversation.content = Some(content.clone());
                }
                conversation.updated_at = p.last_edited_at.unwrap_or(now);
                conversation.last_edited_by = Some(event.device_id);
                conversation.sync_version = new_version;
                self.resources.save_conversation_tx(&conversation, tx).await?;
            }
            EventPayload::SettingsUpdated(p) => {
                let settings = UserSettings {
                    user_id: event.user_id,
                    data: p.settings.clone(),
                    sync_version: new_version,
                    last_edited_by: Some(event.device_id),
                    updated_at: p.updated_at.unwrap_or(now),
                };
                self.resources.save_settings_tx(&settings, tx).await?;
            }
        }

        Ok(())
    }
}
