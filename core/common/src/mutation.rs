//! Queued changes to features and observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::response::ResponseDelta;
use crate::types::Point;
use crate::{Error, Result};

/// Kind of change a mutation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    Create,
    Update,
    Delete,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "CREATE",
            MutationType::Update => "UPDATE",
            MutationType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(MutationType::Create),
            "UPDATE" => Ok(MutationType::Update),
            "DELETE" => Ok(MutationType::Delete),
            other => Err(Error::UnsupportedMutationType(other.to_string())),
        }
    }
}

/// Payload of a change to a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDelta {
    pub feature_id: String,
    /// New location; `None` leaves the point unchanged on update.
    pub new_location: Option<Point>,
}

/// Payload of a change to an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDelta {
    pub observation_id: String,
    pub feature_id: String,
    pub form_id: String,
    pub response_deltas: Vec<ResponseDelta>,
}

/// The entity a mutation targets, with its kind-specific delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationTarget {
    Feature(FeatureDelta),
    Observation(ObservationDelta),
}

/// One immutable, queued change to an entity.
///
/// `id` is `None` until the local store assigns one on insert. Ids increase
/// monotonically and define queue order; a later edit to the same entity is
/// always a new mutation with a fresh id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub id: Option<i64>,
    pub mutation_type: MutationType,
    pub project_id: String,
    pub layer_id: String,
    pub user_id: String,
    pub client_timestamp: DateTime<Utc>,
    pub target: MutationTarget,
}

impl Mutation {
    /// Build a feature mutation stamped with the current time.
    pub fn feature(
        mutation_type: MutationType,
        project_id: impl Into<String>,
        layer_id: impl Into<String>,
        user_id: impl Into<String>,
        delta: FeatureDelta,
    ) -> Self {
        Self {
            id: None,
            mutation_type,
            project_id: project_id.into(),
            layer_id: layer_id.into(),
            user_id: user_id.into(),
            client_timestamp: Utc::now(),
            target: MutationTarget::Feature(delta),
        }
    }

    /// Build an observation mutation stamped with the current time.
    pub fn observation(
        mutation_type: MutationType,
        project_id: impl Into<String>,
        layer_id: impl Into<String>,
        user_id: impl Into<String>,
        delta: ObservationDelta,
    ) -> Self {
        Self {
            id: None,
            mutation_type,
            project_id: project_id.into(),
            layer_id: layer_id.into(),
            user_id: user_id.into(),
            client_timestamp: Utc::now(),
            target: MutationTarget::Observation(delta),
        }
    }

    /// Return a copy carrying an explicit queue id.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Id of the entity this mutation changes.
    pub fn entity_id(&self) -> &str {
        match &self.target {
            MutationTarget::Feature(delta) => &delta.feature_id,
            MutationTarget::Observation(delta) => &delta.observation_id,
        }
    }

    /// Id of the feature that owns the changed entity.
    ///
    /// Features own themselves. This is the key the pending queue and the
    /// delivery scheduler group mutations by.
    pub fn feature_id(&self) -> &str {
        match &self.target {
            MutationTarget::Feature(delta) => &delta.feature_id,
            MutationTarget::Observation(delta) => &delta.feature_id,
        }
    }

    /// Check the fields every mutation must carry.
    ///
    /// # Errors
    /// - `Error::Validation` naming the first missing field
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("projectId", self.project_id.as_str()),
            ("layerId", self.layer_id.as_str()),
            ("userId", self.user_id.as_str()),
            ("entityId", self.entity_id()),
            ("featureId", self.feature_id()),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(Error::Validation(format!("Missing {}", name)));
            }
        }
        if let MutationTarget::Observation(delta) = &self.target {
            if delta.form_id.is_empty() {
                return Err(Error::Validation("Missing formId".to_string()));
            }
        }
        Ok(())
    }
}
