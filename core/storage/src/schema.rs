//! Remote document schema.
//!
//! Remote records are loosely typed JSON. Every field is optional at the
//! serde level and checked explicitly, so a record missing a required field
//! fails with `Decode("Missing <field>")` instead of a generic parse error.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use groundsync_common::{
    AuditInfo, Error, Feature, Mutation, MutationTarget, Observation, Point, Response,
    ResponseMap, Result,
};

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::Decode(format!("Missing {}", field)))
}

fn time_from_millis(millis: i64, field: &str) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Decode(format!("Invalid {}: {}", field, millis)))
}

/// Audit block nested in remote entity documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditInfoDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_time_millis: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time_millis: Option<i64>,
}

impl AuditInfoDocument {
    pub fn from_audit_info(audit: &AuditInfo) -> Self {
        Self {
            user_id: Some(audit.user_id.clone()),
            client_time_millis: Some(audit.client_time.timestamp_millis()),
            server_time_millis: audit.server_time.map(|t| t.timestamp_millis()),
        }
    }

    pub fn into_audit_info(self) -> Result<AuditInfo> {
        let client_time_millis = require(self.client_time_millis, "clientTimeMillis")?;
        Ok(AuditInfo {
            user_id: self.user_id.unwrap_or_default(),
            client_time: time_from_millis(client_time_millis, "clientTimeMillis")?,
            server_time: self
                .server_time_millis
                .map(|millis| time_from_millis(millis, "serverTimeMillis"))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationDocument {
    pub latitude: f64,
    pub longitude: f64,
}

/// Remote feature record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub layer_id: Option<String>,
    #[serde(default)]
    pub location: Option<LocationDocument>,
    #[serde(default)]
    pub created: Option<AuditInfoDocument>,
    #[serde(default)]
    pub modified: Option<AuditInfoDocument>,
}

impl FeatureDocument {
    /// Decode into a feature of `project_id`.
    ///
    /// # Errors
    /// - `Decode` when a required field is missing or malformed
    pub fn into_feature(self, project_id: &str) -> Result<Feature> {
        let id = require(self.id, "id")?;
        let layer_id = require(self.layer_id, "layerId")?;
        let location = require(self.location, "location")?;
        let point = Point::new(location.latitude, location.longitude)
            .map_err(|e| Error::Decode(format!("Feature {}: {}", id, e)))?;
        let created = require(self.created, "created")?.into_audit_info()?;
        // Records never edited carry no modified block.
        let modified = match self.modified {
            Some(doc) => doc.into_audit_info()?,
            None => created.clone(),
        };
        Ok(Feature::new(id, project_id, layer_id, point, created, modified))
    }
}

/// Remote observation record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub form_id: Option<String>,
    #[serde(default)]
    pub created: Option<AuditInfoDocument>,
    #[serde(default)]
    pub modified: Option<AuditInfoDocument>,
    #[serde(default)]
    pub responses: Option<Map<String, Value>>,
}

impl ObservationDocument {
    /// Decode into an observation of `feature`.
    ///
    /// Unreadable responses are dropped field by field; only missing
    /// identity or audit fields fail the whole record.
    pub fn into_observation(self, feature: &Feature) -> Result<Observation> {
        let id = require(self.id, "id")?;
        let feature_id = require(self.feature_id, "featureId")?;
        if feature_id != feature.id() {
            return Err(Error::Decode(format!(
                "Observation {} belongs to feature {}, expected {}",
                id,
                feature_id,
                feature.id()
            )));
        }
        let form_id = require(self.form_id, "formId")?;
        let created = require(self.created, "created")?.into_audit_info()?;
        let modified = match self.modified {
            Some(doc) => doc.into_audit_info()?,
            None => created.clone(),
        };
        let responses = decode_responses(&id, self.responses.unwrap_or_default());

        Ok(Observation::new(
            id,
            feature.project_id(),
            feature_id,
            form_id,
            responses,
            created,
            modified,
        ))
    }
}

/// Decode one response value.
///
/// Strings are text, numbers are numeric, string arrays are choice lists;
/// dates and times use the tagged `{"type": ..., "value": ...}` form.
pub fn decode_response(value: Value) -> Result<Response> {
    match value {
        Value::String(text) => Ok(Response::Text(text)),
        Value::Number(number) => number
            .as_f64()
            .map(Response::Number)
            .ok_or_else(|| Error::Decode(format!("Unrepresentable number {}", number))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(option) => Ok(option),
                other => Err(Error::Decode(format!("Invalid option id {}", other))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Response::MultipleChoice),
        tagged @ Value::Object(_) => serde_json::from_value(tagged)
            .map_err(|e| Error::Decode(format!("Invalid response: {}", e))),
        other => Err(Error::Decode(format!("Unsupported response {}", other))),
    }
}

fn decode_responses(observation_id: &str, raw: Map<String, Value>) -> ResponseMap {
    let mut responses = ResponseMap::new();
    for (field_id, value) in raw {
        match decode_response(value) {
            Ok(response) if !response.is_empty() => responses.insert(field_id, response),
            Ok(_) => {}
            Err(e) => warn!(
                "Skipping response {} of observation {}: {}",
                field_id, observation_id, e
            ),
        }
    }
    responses
}

/// Decode a raw feature record.
pub fn decode_feature(project_id: &str, value: Value) -> Result<Feature> {
    serde_json::from_value::<FeatureDocument>(value)
        .map_err(|e| Error::Decode(format!("Invalid feature document: {}", e)))?
        .into_feature(project_id)
}

/// Decode a raw observation record of `feature`.
pub fn decode_observation(feature: &Feature, value: Value) -> Result<Observation> {
    serde_json::from_value::<ObservationDocument>(value)
        .map_err(|e| Error::Decode(format!("Invalid observation document: {}", e)))?
        .into_observation(feature)
}

/// Wire form of a pushed mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationDocument<'a> {
    pub id: Option<i64>,
    #[serde(rename = "type")]
    pub mutation_type: &'a str,
    pub layer_id: &'a str,
    pub user_id: &'a str,
    pub client_time_millis: i64,
    pub target: &'a MutationTarget,
}

impl<'a> From<&'a Mutation> for MutationDocument<'a> {
    fn from(mutation: &'a Mutation) -> Self {
        Self {
            id: mutation.id,
            mutation_type: mutation.mutation_type.as_str(),
            layer_id: &mutation.layer_id,
            user_id: &mutation.user_id,
            client_time_millis: mutation.client_timestamp.timestamp_millis(),
            target: &mutation.target,
        }
    }
}
