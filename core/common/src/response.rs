//! Field responses and the delta fold that produces an observation's
//! response set.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A user's answer to one form field.
///
/// One variant per field kind; code that handles responses matches on
/// this exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Response {
    Text(String),
    Number(f64),
    MultipleChoice(Vec<String>),
    Date(NaiveDate),
    Time(DateTime<Utc>),
}

impl Response {
    /// Whether this response carries no information and should be treated
    /// as a cleared field.
    pub fn is_empty(&self) -> bool {
        match self {
            Response::Text(text) => text.trim().is_empty(),
            Response::Number(_) => false,
            Response::MultipleChoice(codes) => codes.is_empty(),
            Response::Date(_) => false,
            Response::Time(time) => time.timestamp_millis() == 0,
        }
    }

    /// Short text for list views.
    pub fn summary_text(&self) -> String {
        match self {
            Response::Text(text) => text.clone(),
            Response::Number(n) => n.to_string(),
            Response::MultipleChoice(codes) => codes.join(", "),
            Response::Date(date) => date.format("%Y-%m-%d").to_string(),
            Response::Time(time) => time.format("%H:%M").to_string(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary_text())
    }
}

/// A single field-level change.
///
/// `new_response: None` clears the field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseDelta {
    pub field_id: String,
    pub new_response: Option<Response>,
}

impl ResponseDelta {
    /// Delta that sets `field_id` to `response`.
    pub fn set(field_id: impl Into<String>, response: Response) -> Self {
        Self {
            field_id: field_id.into(),
            new_response: Some(response),
        }
    }

    /// Delta that clears `field_id`.
    pub fn clear(field_id: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            new_response: None,
        }
    }
}

/// Responses of one observation keyed by field id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMap {
    responses: BTreeMap<String, Response>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an ordered sequence of deltas over an empty map.
    pub fn from_deltas<'a>(deltas: impl IntoIterator<Item = &'a ResponseDelta>) -> Self {
        let mut map = Self::new();
        map.apply_deltas(deltas);
        map
    }

    /// Apply one delta in place. Empty responses clear the field.
    pub fn apply_delta(&mut self, delta: &ResponseDelta) {
        match &delta.new_response {
            Some(response) if !response.is_empty() => {
                self.responses
                    .insert(delta.field_id.clone(), response.clone());
            }
            _ => {
                self.responses.remove(&delta.field_id);
            }
        }
    }

    /// Apply deltas in iteration order.
    pub fn apply_deltas<'a>(&mut self, deltas: impl IntoIterator<Item = &'a ResponseDelta>) {
        for delta in deltas {
            self.apply_delta(delta);
        }
    }

    /// Return a copy with `deltas` applied.
    pub fn with_deltas<'a>(&self, deltas: impl IntoIterator<Item = &'a ResponseDelta>) -> Self {
        let mut map = self.clone();
        map.apply_deltas(deltas);
        map
    }

    pub fn insert(&mut self, field_id: impl Into<String>, response: Response) {
        self.responses.insert(field_id.into(), response);
    }

    pub fn get(&self, field_id: &str) -> Option<&Response> {
        self.responses.get(field_id)
    }

    pub fn remove(&mut self, field_id: &str) -> Option<Response> {
        self.responses.remove(field_id)
    }

    pub fn field_ids(&self) -> impl Iterator<Item = &String> {
        self.responses.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Response)> {
        self.responses.iter()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}
