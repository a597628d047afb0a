use std::sync::Arc;

use uuid::Uuid;

use crate::domains::device::registry::DeviceRegistry;
use crate::transport::messages::ServerMessage;

/// Fans processed events and conflict resolutions out to a user's live
/// connections.
///
/// Delivery is best-effort at-most-once per connection: a device that is
/// offline catches up from the durable event ledger on reconnect, and a
/// failed send to one connection never aborts delivery to the rest.
pub struct BroadcastRouter {
    registry: Arc<DeviceRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver to every live connection for the user except the originating
    /// device. Returns how many connections were reached.
    pub async fn to_other_devices(
        &self,
        user_id: Uuid,
        exclude_device_id: Uuid,
        message: &ServerMessage,
    ) -> usize {
        self.send_to(
            self.registry
                .connections_for_user(user_id, Some(exclude_device_id))
                .await,
            message,
        )
    }

    /// Deliver to every live connection for the user, the originator
    /// included. Used for conflict resolutions and settings changes where
    /// the originating device may itself hold a stale copy.
    pub async fn to_all_devices(&self, user_id: Uuid, message: &ServerMessage) -> usize {
        self.send_to(
            self.registry.connections_for_user(user_id, None).await,
            message,
        )
    }

    fn send_to(
        &self,
        targets: Vec<(Uuid, tokio::sync::mpsc::UnboundedSender<ServerMessage>)>,
        message: &ServerMessage,
    ) -> usize {
        let mut delivered = 0;
        for (device_id, sender) in targets {
            match sender.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    log::warn!(
                        "Broadcast to device {} failed, connection is gone",
                        device_id
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::device::registry::DeviceRegistry;
    use crate::domains::device::types::{DeviceType, RegisterDeviceDto};
    use crate::test_utils::{device_repo, setup_pool};
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn dto(device_id: Uuid) -> RegisterDeviceDto {
        RegisterDeviceDto {
            device_id,
            device_name: "router test".to_string(),
            device_type: DeviceType::Desktop,
            user_agent: None,
        }
    }

    fn heartbeat_ack() -> ServerMessage {
        ServerMessage::HeartbeatAck {
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn excludes_the_originating_device() {
        let pool = setup_pool().await;
        let registry = Arc::new(DeviceRegistry::new(device_repo(&pool)));
        let router = BroadcastRouter::new(registry.clone());

        let user = Uuid::new_v4();
        let (device_a, device_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        registry
            .register(Uuid::new_v4(), user, &dto(device_a), tx_a)
            .await
            .unwrap();
        registry
            .register(Uuid::new_v4(), user, &dto(device_b), tx_b)
            .await
            .unwrap();

        let delivered = router
            .to_other_devices(user, device_a, &heartbeat_ack())
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn to_all_devices_reaches_everyone_for_that_user_only() {
        let pool = setup_pool().await;
        let registry = Arc::new(DeviceRegistry::new(device_repo(&pool)));
        let router = BroadcastRouter::new(registry.clone());

        let user = Uuid::new_v4();
        let other_user = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();

        registry
            .register(Uuid::new_v4(), user, &dto(Uuid::new_v4()), tx_a)
            .await
            .unwrap();
        registry
            .register(Uuid::new_v4(), user, &dto(Uuid::new_v4()), tx_b)
            .await
            .unwrap();
        registry
            .register(Uuid::new_v4(), other_user, &dto(Uuid::new_v4()), tx_other)
            .await
            .unwrap();

        let delivered = router.to_all_devices(user, &heartbeat_ack()).await;
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_dead_connection_does_not_abort_the_fan_out() {
        let pool = setup_pool().await;
        let registry = Arc::new(DeviceRegistry::new(device_repo(&pool)));
        let router = BroadcastRouter::new(registry.clone());

        let user = Uuid::new_v4();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        drop(rx_dead); // receiver gone, sends will fail

        registry
            .register(Uuid::new_v4(), user, &dto(Uuid::new_v4()), tx_dead)
            .await
            .unwrap();
        registry
            .register(Uuid::new_v4(), user, &dto(Uuid::new_v4()), tx_live)
            .await
            .unwrap();

        let delivered = router.to_all_devices(user, &heartbeat_ack()).await;
        assert_eq!(delivered, 1);
        assert!(rx_live.try_recv().is_ok());
    }
}
