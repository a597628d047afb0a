use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::resource::repository::ResourceRepository;
use crate::domains::resource::types::UserSettings;
use crate::domains::sync::repository::SyncConflictRepository;
use crate::domains::sync::types::{ConflictResolution, ResourceType, SyncConflict};
use crate::errors::{DbError, DomainError, DomainResult, SyncError};
use crate::transport::messages::{BroadcastData, ServerMessage};
use crate::transport::router::BroadcastRouter;

/// Separator used when auto-merging two conversation payloads. The merge is
/// textual, not semantic: both sides are kept, data_1 first.
pub const MERGE_SEPARATOR: &str = "\n\n---\n\n";

/// Owns a conflict's lifecycle from detection to resolution.
///
/// Resolution is whole-payload: one side wins, or both are concatenated.
/// Field-level merging is deliberately out of scope; the two divergent
/// payloads are retained on the conflict row forever, so nothing is ever
/// silently lost even after a destructive resolution choice.
pub struct ConflictResolver {
    pool: SqlitePool,
    conflicts: Arc<dyn SyncConflictRepository>,
    resources: Arc<dyn ResourceRepository>,
    router: Arc<BroadcastRouter>,
}

impl ConflictResolver {
    pub fn new(
        pool: SqlitePool,
        conflicts: Arc<dyn SyncConflictRepository>,
        resources: Arc<dyn ResourceRepository>,
        router: Arc<BroadcastRouter>,
    ) -> Self {
        Self {
            pool,
            conflicts,
            resources,
            router,
        }
    }

    /// Resolve a pending conflict. Resolving an already-resolved conflict is
    /// rejected so a resolution can never be silently reapplied with a
    /// different outcome.
    pub async fn resolve(
        &self,
        user_id: Uuid,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        resolved_by: Uuid,
    ) -> DomainResult<SyncConflict> {
        let mut conflict = self
            .conflicts
            .find_by_id(conflict_id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or(DomainError::Sync(SyncError::ConflictNotFound(conflict_id)))?;

        if conflict.is_resolved() {
            return Err(DomainError::Sync(SyncError::AlreadyResolved { conflict_id }));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        match resolution {
            // The caller has already written final state through the normal
            // event path; only the bookkeeping happens here.
            ConflictResolution::Manual => {}
            ConflictResolution::Device1Wins => {
                self.apply_resolved(&conflict, &conflict.data_1.clone(), resolved_by, &mut tx)
                    .await?;
            }
            ConflictResolution::Device2Wins => {
                self.apply_resolved(&conflict, &conflict.data_2.clone(), resolved_by, &mut tx)
                    .await?;
            }
            ConflictResolution::AutoMerge => {
                let merged = auto_merge(&conflict);
                self.apply_resolved(&conflict, &merged, resolved_by, &mut tx)
                    .await?;
            }
        }

        self.conflicts
            .mark_resolved_tx(conflict.id, resolution, resolved_by, now, &mut tx)
            .await?;
        tx.commit().await.map_err(DbError::from)?;

        conflict.resolution = Some(resolution);
        conflict.resolved_at = Some(now);
        conflict.resolved_by = Some(resolved_by);

        // Both conflicted devices may hold stale copies, so the resolution
        // goes to every device, originator included.
        let delivered = self
            .router
            .to_all_devices(
                user_id,
                &ServerMessage::SyncMessage {
                    data: BroadcastData::ConflictResolved {
                        conflict_id: conflict.id,
                        resolution,
                        resource_type: conflict.resource_type,
                        resource_id: conflict.resource_id,
                    },
                },
            )
            .await;
        log::debug!(
            "Conflict {} resolved as {} ({} device(s) notified)",
            conflict.id,
            resolution.as_str(),
            delivered
        );

        Ok(conflict)
    }

    /// Write the chosen payload back to the resource table with a version
    /// bump, so resolution never reuses a prior version number.
    async fn apply_resolved<'t>(
        &self,
        conflict: &SyncConflict,
        payload: &serde_json::Value,
        resolved_by: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now();

        match conflict.resource_type {
            ResourceType::Message => {
                let mut message = self
                    .resources
                    .get_message_tx(conflict.resource_id, conflict.user_id, tx)
                    .await?
                    .ok_or_else(|| {
                        DomainError::EntityNotFound(
                            "messages".to_string(),
                            conflict.resource_id.to_string(),
                        )
                    })?;
                let content = payload
                    .get("content")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        DomainError::Sync(SyncError::MissingResolutionPayload(
                            "message resolution payload has no content field".to_string(),
                        ))
                    })?;
                message.content = content.to_string();
                message.last_edited_at = Some(now);
                message.last_edited_by = Some(resolved_by);
                message.sync_version += 1;
                self.resources.save_message_tx(&message, tx).await?;
            }
            ResourceType::Conversation => {
                let mut conversation = self
                    .resources
                    .get_conversation_tx(conflict.resource_id, conflict.user_id, tx)
                    .await?
                    .ok_or_else(|| {
                        DomainError::EntityNotFound(
                            "conversations".to_string(),
                            conflict.resource_id.to_string(),
                        )
                    })?;
                if let Some(title) = payload.get("title").and_then(|v| v.as_str()) {
                    conversation.title = title.to_string();
                }
                if let Some(content) = payload.get("content").and_then(|v| v.as_str()) {
                    conversation.content = Some(content.to_string());
                }
                conversation.updated_at = now;
                conversation.last_edited_by = Some(resolved_by);
                conversation.sync_version += 1;
                self.resources.save_conversation_tx(&conversation, tx).await?;
            }
            ResourceType::Settings => {
                // Snapshots carry the blob under `data`, raw event payloads
                // under `settings`.
                let data = payload
                    .get("settings")
                    .or_else(|| payload.get("data"))
                    .cloned()
                    .unwrap_or_else(|| payload.clone());
                let current = self.resources.get_settings_tx(conflict.user_id, tx).await?;
                let settings = UserSettings {
                    user_id: conflict.user_id,
                    data,
                    sync_version: current.map(|s| s.sync_version).unwrap_or(0) + 1,
                    last_edited_by: Some(resolved_by),
                    updated_at: now,
                };
                self.resources.save_settings_tx(&settings, tx).await?;
            }
        }

        Ok(())
    }
}

/// Resource-type-specific merge heuristic.
///
/// Conversations get a textual both-sides merge; messages and settings are
/// whole-payload last-write-wins on the later edit timestamp, with the
/// already-applied side winning ties.
fn auto_merge(conflict: &SyncConflict) -> serde_json::Value {
    match conflict.resource_type {
        ResourceType::Conversation => {
            let content_1 = conflict
                .data_1
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let content_2 = conflict
                .data_2
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            let mut merged = conflict.data_1.clone();
            if let Some(obj) = merged.as_object_mut() {
                obj.insert(
                    "content".to_string(),
                    serde_json::Value::String(format!(
                        "{}{}{}",
                        content_1, MERGE_SEPARATOR, content_2
                    )),
                );
                obj.insert(
                    "last_edited_at".to_string(),
                    serde_json::Value::String(Utc::now().to_rfc3339()),
                );
            }
            merged
        }
        ResourceType::Message | ResourceType::Settings => {
            let ts_1 = payload_timestamp(&conflict.data_1);
            let ts_2 = payload_timestamp(&conflict.data_2);
            if ts_2 > ts_1 {
                conflict.data_2.clone()
            } else {
                conflict.data_1.clone()
            }
        }
    }
}

/// Best edit timestamp a payload carries, for last-write-wins comparison.
fn payload_timestamp(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    ["last_edited_at", "updated_at", "created_at"]
        .iter()
        .find_map(|key| payload.get(*key))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::device::registry::DeviceRegistry;
    use crate::domains::resource::repository::SqliteResourceRepository;
    use crate::domains::sync::processor::ProcessOutcome;
    use crate::domains::sync::repository::SqliteSyncConflictRepository;
    use crate::domains::sync::types::{ResourceType, SyncEventInput, SyncEventType};
    use crate::test_utils::{build_processor, device_repo, setup_pool};
    use serde_json::json;
    use sqlx::SqlitePool;

    fn build_resolver(pool: &SqlitePool) -> ConflictResolver {
        let registry = Arc::new(DeviceRegistry::new(device_repo(pool)));
        ConflictResolver::new(
            pool.clone(),
            Arc::new(SqliteSyncConflictRepository::new(pool.clone())),
            Arc::new(SqliteResourceRepository::new(pool.clone())),
            Arc::new(BroadcastRouter::new(registry)),
        )
    }

    /// Drive two devices into a conversation conflict and return it.
    async fn conversation_conflict(
        pool: &SqlitePool,
        user: Uuid,
        device_a: Uuid,
        device_b: Uuid,
        conv_id: Uuid,
    ) -> SyncConflict {
        let processor = build_processor(pool);

        processor
            .process(
                user,
                device_a,
                SyncEventInput {
                    event_type: SyncEventType::ConversationCreated,
                    resource_type: ResourceType::Conversation,
                    resource_id: conv_id,
                    event_data: json!({"title": "Shared", "content": "base"}),
                    sync_version: 1,
                },
            )
            .await
            .unwrap();
        processor
            .process(
                user,
                device_a,
                SyncEventInput {
                    event_type: SyncEventType::ConversationUpdated,
                    resource_type: ResourceType::Conversation,
                    resource_id: conv_id,
                    event_data: json!({"content": "A's edit"}),
                    sync_version: 2,
                },
            )
            .await
            .unwrap();

        let outcome = processor
            .process(
                user,
                device_b,
                SyncEventInput {
                    event_type: SyncEventType::ConversationUpdated,
                    resource_type: ResourceType::Conversation,
                    resource_id: conv_id,
                    event_data: json!({"content": "B's edit"}),
                    sync_version: 2,
                },
            )
            .await
            .unwrap();

        match outcome {
            ProcessOutcome::Conflict { conflict, .. } => conflict,
            ProcessOutcome::Applied(_) => panic!("expected conflict"),
        }
    }

    async fn conversation_state(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
    ) -> crate::domains::resource::types::Conversation {
        let repo = SqliteResourceRepository::new(pool.clone());
        let mut tx = pool.begin().await.unwrap();
        let conversation = repo
            .get_conversation_tx(id, user_id, &mut tx)
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();
        conversation
    }

    #[tokio::test]
    async fn device1_wins_keeps_applied_state_and_bumps_version() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        let resolved = resolver
            .resolve(user, conflict.id, ConflictResolution::Device1Wins, device_a)
            .await
            .unwrap();

        assert_eq!(resolved.resolution, Some(ConflictResolution::Device1Wins));
        assert!(resolved.resolved_at.is_some());

        let state = conversation_state(&pool, conv_id, user).await;
        assert_eq!(state.content.as_deref(), Some("A's edit"));
        // Resolution never reuses a version number.
        assert_eq!(state.sync_version, 3);
    }

    #[tokio::test]
    async fn device2_wins_adopts_the_losing_payload() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        resolver
            .resolve(user, conflict.id, ConflictResolution::Device2Wins, device_b)
            .await
            .unwrap();

        let state = conversation_state(&pool, conv_id, user).await;
        assert_eq!(state.content.as_deref(), Some("B's edit"));
        assert_eq!(state.sync_version, 3);
    }

    #[tokio::test]
    async fn auto_merge_concatenates_conversation_contents() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        resolver
            .resolve(user, conflict.id, ConflictResolution::AutoMerge, device_b)
            .await
            .unwrap();

        let state = conversation_state(&pool, conv_id, user).await;
        assert_eq!(
            state.content.as_deref(),
            Some("A's edit\n\n---\n\nB's edit")
        );
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        resolver
            .resolve(user, conflict.id, ConflictResolution::Device1Wins, device_a)
            .await
            .unwrap();

        let second = resolver
            .resolve(user, conflict.id, ConflictResolution::Device2Wins, device_b)
            .await;
        assert!(matches!(
            second,
            Err(DomainError::Sync(SyncError::AlreadyResolved { .. }))
        ));

        // The first outcome stands.
        let state = conversation_state(&pool, conv_id, user).await;
        assert_eq!(state.content.as_deref(), Some("A's edit"));
    }

    #[tokio::test]
    async fn manual_resolution_marks_the_conflict_without_writing_state() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        let before = conversation_state(&pool, conv_id, user).await;

        let resolved = resolver
            .resolve(user, conflict.id, ConflictResolution::Manual, device_a)
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Some(ConflictResolution::Manual));

        let after = conversation_state(&pool, conv_id, user).await;
        assert_eq!(after.content, before.content);
        assert_eq!(after.sync_version, before.sync_version);
    }

    #[tokio::test]
    async fn resolving_someone_elses_conflict_is_not_found() {
        let pool = setup_pool().await;
        let resolver = build_resolver(&pool);
        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let conv_id = Uuid::new_v4();

        let conflict = conversation_conflict(&pool, user, device_a, device_b, conv_id).await;
        let result = resolver
            .resolve(
                Uuid::new_v4(), // different user
                conflict.id,
                ConflictResolution::Device1Wins,
                device_a,
            )
            .await;
        assert!(matches!(
            result,
            Err(DomainError::Sync(SyncError::ConflictNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn message_auto_merge_is_last_write_wins() {
        let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let earlier = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();

        let conflict = SyncConflict {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            resource_type: ResourceType::Message,
            resource_id: Uuid::new_v4(),
            device_id_1: Uuid::new_v4(),
            device_id_2: Uuid::new_v4(),
            version_1: 2,
            version_2: 2,
            data_1: json!({"content": "older", "last_edited_at": earlier}),
            data_2: json!({"content": "newer", "last_edited_at": later}),
            resolution: None,
            resolved_at: None,
            resolved_by: None,
            created_at: Utc::now(),
        };
        assert_eq!(auto_merge(&conflict)["content"], json!("newer"));

        // Ties and missing timestamps keep the already-applied side.
        let conflict = SyncConflict {
            data_1: json!({"content": "applied"}),
            data_2: json!({"content": "incoming"}),
            ..conflict
        };
        assert_eq!(auto_merge(&conflict)["content"], json!("applied"));
    }
}
