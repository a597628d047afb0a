use uuid::Uuid;

/// Represents the authenticated identity for one device connection.
///
/// Issued by the session coordinator after a successful `authenticate`
/// message and threaded through every repository call so that all rows a
/// connection touches stay scoped to its user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,

    /// The ID of the device this connection belongs to, once registered
    pub device_id: Option<Uuid>,
}

impl AuthContext {
    /// Create a context for a freshly authenticated connection that has not
    /// yet registered a device.
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            device_id: None,
        }
    }

    /// Attach the device identity once registration completes.
    pub fn with_device(user_id: Uuid, device_id: Uuid) -> Self {
        Self {
            user_id,
            device_id: Some(device_id),
        }
    }
}
