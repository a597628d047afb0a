//! Shared helpers for converting SQLite TEXT columns into domain types.
//!
//! All timestamps are stored as RFC3339 TEXT and all IDs as UUID TEXT, so
//! every repository shares the same parsing rules.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{DomainError, ValidationError};

pub(crate) fn parse_uuid(uuid_str: &str, field_name: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

pub(crate) fn parse_optional_uuid(
    uuid_str: Option<String>,
    field_name: &str,
) -> Result<Option<Uuid>, DomainError> {
    uuid_str.map(|s| parse_uuid(&s, field_name)).transpose()
}

pub(crate) fn parse_datetime(dt_str: &str, field_name: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

pub(crate) fn parse_optional_datetime(
    dt_str: Option<String>,
    field_name: &str,
) -> Result<Option<DateTime<Utc>>, DomainError> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}
