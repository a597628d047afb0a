use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::auth::context::AuthContext;
use crate::auth::jwt::TokenVerifier;
use crate::domains::device::registry::DeviceRegistry;
use crate::domains::device::repository::DeviceRepository;
use crate::domains::device::types::RegisterDeviceDto;
use crate::domains::resource::repository::ResourceRepository;
use crate::domains::sync::processor::{EventProcessor, ProcessOutcome};
use crate::domains::sync::repository::SyncEventRepository;
use crate::domains::sync::resolver::ConflictResolver;
use crate::domains::sync::types::{SyncEventInput, SyncEventType};
use crate::errors::{DomainError, SyncError};
use crate::transport::messages::{AckStatus, BroadcastData, ClientMessage, ServerMessage};
use crate::transport::router::BroadcastRouter;

/// How many conversations the initial snapshot carries. Older history is
/// fetched on demand, not at connect time.
pub const INITIAL_SYNC_CONVERSATIONS: u32 = 50;

/// Cap on one catch-up response. A device further behind than this issues
/// another `request_sync` with the last timestamp it received.
pub const CATCH_UP_EVENT_LIMIT: u32 = 500;

/// Lifecycle of one device connection.
///
/// A connection must authenticate before anything else, then register its
/// device before it may sync. Closing is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

/// Drives one device connection through its lifecycle and dispatches every
/// inbound message to the right collaborator.
///
/// The coordinator owns no transport: replies go out through the same
/// unbounded channel the registry fans broadcasts into, so a WebSocket
/// layer (or a test) only has to pump both ends.
pub struct SessionCoordinator {
    connection_id: Uuid,
    state: SessionState,
    auth: Option<AuthContext>,
    outbound: UnboundedSender<ServerMessage>,
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<DeviceRegistry>,
    router: Arc<BroadcastRouter>,
    processor: Arc<EventProcessor>,
    resolver: Arc<ConflictResolver>,
    devices: Arc<dyn DeviceRepository>,
    events: Arc<dyn SyncEventRepository>,
    resources: Arc<dyn ResourceRepository>,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: Uuid,
        outbound: UnboundedSender<ServerMessage>,
        verifier: Arc<dyn TokenVerifier>,
        registry: Arc<DeviceRegistry>,
        router: Arc<BroadcastRouter>,
        processor: Arc<EventProcessor>,
        resolver: Arc<ConflictResolver>,
        devices: Arc<dyn DeviceRepository>,
        events: Arc<dyn SyncEventRepository>,
        resources: Arc<dyn ResourceRepository>,
    ) -> Self {
        Self {
            connection_id,
            state: SessionState::Connecting,
            auth: None,
            outbound,
            verifier,
            registry,
            router,
            processor,
            resolver,
            devices,
            events,
            resources,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Dispatch one inbound message. Failures are reported back on the
    /// connection's own channel; they never tear the session down.
    pub async fn handle(&mut self, message: ClientMessage) {
        if self.state == SessionState::Closed {
            log::warn!(
                "Message on closed connection {} dropped",
                self.connection_id
            );
            return;
        }

        match message {
            ClientMessage::Authenticate { token } => self.handle_authenticate(&token),
            ClientMessage::RegisterDevice {
                device_id,
                device_name,
                device_type,
                user_agent,
            } => {
                self.handle_register_device(RegisterDeviceDto {
                    device_id,
                    device_name,
                    device_type,
                    user_agent,
                })
                .await
            }
            ClientMessage::SyncEvent {
                event_type,
                resource_type,
                resource_id,
                event_data,
                sync_version,
            } => {
                self.handle_sync_event(SyncEventInput {
                    event_type,
                    resource_type,
                    resource_id,
                    event_data,
                    sync_version,
                })
                .await
            }
            ClientMessage::ResolveConflict {
                conflict_id,
                resolution,
            } => self.handle_resolve_conflict(conflict_id, resolution).await,
            ClientMessage::GetSyncStatus => self.handle_sync_status().await,
            ClientMessage::RequestSync { last_sync_time } => {
                self.handle_request_sync(last_sync_time).await
            }
            ClientMessage::Heartbeat => self.handle_heartbeat().await,
        }
    }

    /// Tear the session down and release its registry entry. Safe to call
    /// more than once; only the first call does anything.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        if let Some((user_id, device_id)) = self.registry.unregister(self.connection_id).await {
            log::info!(
                "Connection {} closed (user {}, device {})",
                self.connection_id,
                user_id,
                device_id
            );
        }
    }

    fn handle_authenticate(&mut self, token: &str) {
        if self.state != SessionState::Connecting {
            self.send(ServerMessage::Error {
                message: "Connection is already authenticated".to_string(),
            });
            return;
        }

        match self.verifier.verify(token) {
            Ok(user_id) => {
                self.auth = Some(AuthContext::new(user_id));
                self.state = SessionState::Authenticated;
                self.send(ServerMessage::Authenticated { user_id });
            }
            Err(e) => {
                log::debug!(
                    "Authentication failed on connection {}: {}",
                    self.connection_id,
                    e
                );
                self.send(ServerMessage::AuthError {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn handle_register_device(&mut self, dto: RegisterDeviceDto) {
        let user_id = match &self.auth {
            Some(auth) => auth.user_id,
            None => {
                self.send(ServerMessage::AuthError {
                    message: "Authenticate before registering a device".to_string(),
                });
                return;
            }
        };

        let device = match self
            .registry
            .register(self.connection_id, user_id, &dto, self.outbound.clone())
            .await
        {
            Ok(device) => device,
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: format!("Device registration failed: {}", e),
                });
                return;
            }
        };

        self.auth = Some(AuthContext::with_device(user_id, device.device_id));
        self.state = SessionState::Active;
        self.send(ServerMessage::DeviceRegistered {
            device_id: device.device_id,
        });

        self.send_initial_sync(user_id, device.device_id).await;
    }

    /// Snapshot of recent conversations and their messages, sent right after
    /// registration so a fresh device has something to render immediately.
    async fn send_initial_sync(&self, user_id: Uuid, device_id: Uuid) {
        let conversations = match self
            .resources
            .recent_conversations(user_id, INITIAL_SYNC_CONVERSATIONS)
            .await
        {
            Ok(conversations) => conversations,
            Err(e) => {
                log::error!("Initial sync snapshot failed for user {}: {:?}", user_id, e);
                self.send(ServerMessage::Error {
                    message: "Initial sync failed".to_string(),
                });
                return;
            }
        };

        let conversation_ids: Vec<Uuid> = conversations.iter().map(|c| c.id).collect();
        let messages = match self
            .resources
            .messages_for_conversations(&conversation_ids)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                log::error!("Initial sync snapshot failed for user {}: {:?}", user_id, e);
                self.send(ServerMessage::Error {
                    message: "Initial sync failed".to_string(),
                });
                return;
            }
        };

        self.send(ServerMessage::InitialSync {
            conversations,
            messages,
            device_id,
            timestamp: Utc::now(),
        });
    }

    async fn handle_sync_event(&mut self, input: SyncEventInput) {
        let (user_id, device_id) = match self.active_identity() {
            Some(identity) => identity,
            None => return,
        };

        match self.processor.process(user_id, device_id, input).await {
            Ok(ProcessOutcome::Applied(event)) => {
                self.send(ServerMessage::SyncEventAck {
                    event_id: event.id,
                    status: AckStatus::Processed,
                    conflict: None,
                });
                // Settings changes go back to the originator as well; any of
                // its other open tabs or views may hold a stale copy.
                let everyone = event.event_type == SyncEventType::SettingsUpdated;
                let message = ServerMessage::SyncMessage {
                    data: BroadcastData::SyncEvent { event },
                };
                let delivered = if everyone {
                    self.router.to_all_devices(user_id, &message).await
                } else {
                    self.router
                        .to_other_devices(user_id, device_id, &message)
                        .await
                };
                log::debug!(
                    "Event from device {} broadcast to {} device(s)",
                    device_id,
                    delivered
                );
            }
            // Divergent state is recorded and held back until a resolution is
            // chosen; only the originator learns of the conflict, with both
            // payloads attached so it can offer the choice.
            Ok(ProcessOutcome::Conflict { event_id, conflict }) => {
                self.send(ServerMessage::SyncEventAck {
                    event_id,
                    status: AckStatus::Conflict,
                    conflict: Some(conflict),
                });
            }
            // An event that made it into the ledger without being applied is
            // reported with its id, so the device can correlate the failure.
            Err(DomainError::Sync(SyncError::EventNotApplied { event_id, source })) => {
                self.send(ServerMessage::SyncEventError {
                    event_id: Some(event_id),
                    error: source.to_string(),
                });
            }
            Err(e) => {
                self.send(ServerMessage::SyncEventError {
                    event_id: None,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn handle_resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        resolution: crate::domains::sync::types::ConflictResolution,
    ) {
        let (user_id, device_id) = match self.active_identity() {
            Some(identity) => identity,
            None => return,
        };

        match self
            .resolver
            .resolve(user_id, conflict_id, resolution, device_id)
            .await
        {
            Ok(conflict) => {
                self.send(ServerMessage::ConflictResolved {
                    conflict_id: conflict.id,
                    resolution,
                });
            }
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: format!("Conflict resolution failed: {}", e),
                });
            }
        }
    }

    async fn handle_sync_status(&mut self) {
        let user_id = match &self.auth {
            Some(auth) => auth.user_id,
            None => {
                self.send(ServerMessage::AuthError {
                    message: "Authenticate before requesting sync status".to_string(),
                });
                return;
            }
        };
        let current_device = self.auth.as_ref().and_then(|auth| auth.device_id);

        let active_devices = match self.registry.active_devices(user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: format!("Sync status unavailable: {}", e),
                });
                return;
            }
        };
        let last_sync_time = match self.events.latest_event_timestamp(user_id).await {
            Ok(timestamp) => timestamp,
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: format!("Sync status unavailable: {}", e),
                });
                return;
            }
        };

        self.send(ServerMessage::SyncStatus {
            active_devices,
            current_device,
            last_sync_time,
        });
    }

    async fn handle_request_sync(
        &mut self,
        last_sync_time: Option<chrono::DateTime<Utc>>,
    ) {
        let (user_id, device_id) = match self.active_identity() {
            Some(identity) => identity,
            None => return,
        };

        match self
            .events
            .events_since(user_id, device_id, last_sync_time, CATCH_UP_EVENT_LIMIT)
            .await
        {
            Ok(events) => {
                log::debug!(
                    "Catch-up for device {}: {} event(s) since {:?}",
                    device_id,
                    events.len(),
                    last_sync_time
                );
                self.send(ServerMessage::SyncData {
                    events,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                self.send(ServerMessage::Error {
                    message: format!("Catch-up failed: {}", e),
                });
            }
        }
    }

    async fn handle_heartbeat(&mut self) {
        let (user_id, device_id) = match self.active_identity() {
            Some(identity) => identity,
            None => return,
        };

        match self.devices.touch_last_seen(user_id, device_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                // Swept while the connection idled; the row comes back on
                // the next register_device.
                log::debug!("Heartbeat from device {} found no active row", device_id);
            }
            Err(e) => {
                log::warn!("Heartbeat refresh failed for device {}: {:?}", device_id, e);
            }
        }

        self.send(ServerMessage::HeartbeatAck {
            timestamp: Utc::now(),
        });
    }

    /// User and device of an active session, or a rejection sent to the
    /// caller when the session has not completed registration.
    fn active_identity(&self) -> Option<(Uuid, Uuid)> {
        match self
            .auth
            .as_ref()
            .and_then(|auth| auth.device_id.map(|device_id| (auth.user_id, device_id)))
        {
            Some(identity) if self.state == SessionState::Active => Some(identity),
            _ => {
                self.send(ServerMessage::Error {
                    message: "Register a device before syncing".to_string(),
                });
                None
            }
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            log::debug!(
                "Outbound channel for connection {} is closed",
                self.connection_id
            );
        }
    }
}
