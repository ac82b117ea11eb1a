//! Small value types shared by the entity and mutation model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Generate a new offline-safe entity identifier.
///
/// Identifiers are minted on the device so entities can be created while
/// offline without coordinating with the remote store.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    /// Create a point, validating coordinate ranges.
    ///
    /// # Errors
    /// - Latitude outside [-90, 90] or longitude outside [-180, 180]
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::Validation(format!(
                "Latitude out of range: {}",
                latitude
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::Validation(format!(
                "Longitude out of range: {}",
                longitude
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// Who changed an entity and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    /// User that performed the change.
    pub user_id: String,
    /// Device clock at the time of the change.
    pub client_time: DateTime<Utc>,
    /// Server clock, once the change has been accepted remotely.
    pub server_time: Option<DateTime<Utc>>,
}

impl AuditInfo {
    /// Audit info for a change made on this device.
    pub fn new(user_id: impl Into<String>, client_time: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            client_time,
            server_time: None,
        }
    }
}

/// Lifecycle flag stored alongside local entity rows.
///
/// Deletion is logical: rows are flagged rather than removed so the pending
/// queue can still refer to them until the delete has been delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Default,
    Deleted,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityState::Default => "DEFAULT",
            EntityState::Deleted => "DELETED",
        }
    }
}

impl FromStr for EntityState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEFAULT" => Ok(EntityState::Default),
            "DELETED" => Ok(EntityState::Deleted),
            other => Err(Error::Validation(format!("Unknown entity state: {}", other))),
        }
    }
}
