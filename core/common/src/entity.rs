//! Domain entities: map features and the observations collected on them.
//!
//! Entities are immutable values. Local state changes only by applying a
//! [`Mutation`](crate::Mutation) or by merging a remote snapshot; both
//! produce new values through the constructors and `with_*` builders here.

use serde::{Deserialize, Serialize};

use crate::response::ResponseMap;
use crate::types::{AuditInfo, Point};

/// A located map feature within a project layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    id: String,
    project_id: String,
    layer_id: String,
    point: Point,
    created: AuditInfo,
    last_modified: AuditInfo,
}

impl Feature {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        layer_id: impl Into<String>,
        point: Point,
        created: AuditInfo,
        last_modified: AuditInfo,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            layer_id: layer_id.into(),
            point,
            created,
            last_modified,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }

    pub fn point(&self) -> Point {
        self.point
    }

    pub fn created(&self) -> &AuditInfo {
        &self.created
    }

    pub fn last_modified(&self) -> &AuditInfo {
        &self.last_modified
    }

    pub fn with_point(mut self, point: Point) -> Self {
        self.point = point;
        self
    }

    pub fn with_last_modified(mut self, audit: AuditInfo) -> Self {
        self.last_modified = audit;
        self
    }
}

/// One filled-in form attached to a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    id: String,
    project_id: String,
    feature_id: String,
    form_id: String,
    responses: ResponseMap,
    created: AuditInfo,
    last_modified: AuditInfo,
}

impl Observation {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        feature_id: impl Into<String>,
        form_id: impl Into<String>,
        responses: ResponseMap,
        created: AuditInfo,
        last_modified: AuditInfo,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            feature_id: feature_id.into(),
            form_id: form_id.into(),
            responses,
            created,
            last_modified,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    pub fn responses(&self) -> &ResponseMap {
        &self.responses
    }

    pub fn created(&self) -> &AuditInfo {
        &self.created
    }

    pub fn last_modified(&self) -> &AuditInfo {
        &self.last_modified
    }

    pub fn with_responses(mut self, responses: ResponseMap) -> Self {
        self.responses = responses;
        self
    }

    pub fn with_last_modified(mut self, audit: AuditInfo) -> Self {
        self.last_modified = audit;
        self
    }
}

/// Either kind of entity, as handed to `LocalStore::merge_entity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Feature(Feature),
    Observation(Observation),
}

impl Entity {
    pub fn id(&self) -> &str {
        match self {
            Entity::Feature(feature) => feature.id(),
            Entity::Observation(observation) => observation.id(),
        }
    }
}

impl From<Feature> for Entity {
    fn from(feature: Feature) -> Self {
        Entity::Feature(feature)
    }
}

impl From<Observation> for Entity {
    fn from(observation: Observation) -> Self {
        Entity::Observation(observation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{Response, ResponseDelta};
    use chrono::Utc;

    #[test]
    fn test_builders_return_new_values() {
        let audit = AuditInfo::new("user id", Utc::now());
        let feature = Feature::new(
            "feature id",
            "project id",
            "layer id",
            Point::new(51.0, 44.0).unwrap(),
            audit.clone(),
            audit,
        );
        let moved = feature.clone().with_point(Point::new(1.0, 2.0).unwrap());

        assert_eq!(feature.point(), Point::new(51.0, 44.0).unwrap());
        assert_eq!(moved.point(), Point::new(1.0, 2.0).unwrap());
        assert_eq!(Entity::from(moved).id(), "feature id");
    }

    #[test]
    fn test_observation_responses() {
        let audit = AuditInfo::new("user id", Utc::now());
        let responses = ResponseMap::from_deltas(&[ResponseDelta::set(
            "foo field",
            Response::Text("foo value".to_string()),
        )]);
        let observation = Observation::new(
            "observation id",
            "project id",
            "feature id",
            "form id",
            responses,
            audit.clone(),
            audit,
        );
        assert_eq!(
            observation.responses().get("foo field").map(|r| r.to_string()),
            Some("foo value".to_string())
        );
    }
}
