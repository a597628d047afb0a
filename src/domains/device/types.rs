use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domains::core::{parse_datetime, parse_uuid};
use crate::errors::{DomainError, DomainResult, ValidationError};

pub const MAX_DEVICE_NAME_LEN: usize = 128;

/// The kind of client installation a device represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Desktop => "desktop",
            DeviceType::Tablet => "tablet",
        }
    }
}

impl FromStr for DeviceType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(DeviceType::Mobile),
            "desktop" => Ok(DeviceType::Desktop),
            "tablet" => Ok(DeviceType::Tablet),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "device_type",
                &format!("Unknown device type: {}", s),
            ))),
        }
    }
}

impl From<DeviceType> for String {
    fn from(device_type: DeviceType) -> Self {
        device_type.as_str().to_string()
    }
}

/// One client installation for a user.
///
/// Rows are upserted on connect and flipped inactive on disconnect or
/// silence; they are never hard-deleted so conflict attribution keeps
/// working after a device goes away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_agent: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub sync_token: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Registration payload from a `register_device` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDeviceDto {
    pub device_id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub user_agent: Option<String>,
}

impl RegisterDeviceDto {
    pub fn validate(&self) -> DomainResult<()> {
        if self.device_name.trim().is_empty() {
            return Err(DomainError::Validation(ValidationError::required(
                "device_name",
            )));
        }
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(DomainError::Validation(ValidationError::max_length(
                "device_name",
                MAX_DEVICE_NAME_LEN,
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRow {
    pub id: String,
    pub device_id: String,
    pub user_id: String,
    pub device_name: String,
    pub device_type: String,
    pub user_agent: Option<String>,
    pub last_seen: String,
    pub is_active: i64,
    pub sync_token: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<DeviceRow> for Device {
    type Error = DomainError;
    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "devices.id")?,
            device_id: parse_uuid(&row.device_id, "devices.device_id")?,
            user_id: parse_uuid(&row.user_id, "devices.user_id")?,
            device_name: row.device_name,
            device_type: DeviceType::from_str(&row.device_type)?,
            user_agent: row.user_agent,
            last_seen: parse_datetime(&row.last_seen, "devices.last_seen")?,
            is_active: row.is_active == 1,
            sync_token: row.sync_token,
            created_at: parse_datetime(&row.created_at, "devices.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "devices.updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_round_trip() {
        for dt in [DeviceType::Mobile, DeviceType::Desktop, DeviceType::Tablet] {
            assert_eq!(DeviceType::from_str(dt.as_str()).unwrap(), dt);
        }
        assert!(DeviceType::from_str("watch").is_err());
    }

    #[test]
    fn register_dto_validation() {
        let mut dto = RegisterDeviceDto {
            device_id: Uuid::new_v4(),
            device_name: "Living room iPad".to_string(),
            device_type: DeviceType::Tablet,
            user_agent: None,
        };
        assert!(dto.validate().is_ok());

        dto.device_name = "   ".to_string();
        assert!(dto.validate().is_err());

        dto.device_name = "x".repeat(MAX_DEVICE_NAME_LEN + 1);
        assert!(dto.validate().is_err());
    }
}
