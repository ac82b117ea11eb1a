//! Mutation applicator.
//!
//! Turns one mutation plus the current local row into the row that must be
//! written. Engines call [`apply_mutation`] inside the same transaction that
//! appends the mutation to the pending queue, so the two writes commit or
//! roll back together.

use groundsync_common::{
    AuditInfo, EntityState, Error, Feature, FeatureDelta, Mutation, MutationTarget, MutationType,
    Observation, ObservationDelta, ResponseMap, Result,
};

/// Row-level effect of applying a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityWrite {
    Feature {
        feature: Feature,
        state: EntityState,
    },
    Observation {
        observation: Observation,
        state: EntityState,
    },
}

/// Reads the applicator needs, served from inside the enclosing transaction.
pub trait EntityLookup {
    /// Feature row by id, deleted or not.
    fn feature(&self, feature_id: &str) -> Result<Option<(Feature, EntityState)>>;

    /// Observation row by id, deleted or not.
    fn observation(&self, observation_id: &str) -> Result<Option<(Observation, EntityState)>>;
}

/// Compute the entity write for `mutation`.
///
/// # Errors
/// - `Validation` when required fields are missing
/// - `AlreadyExists` when creating an entity that is live locally
/// - `NotFound` when updating or deleting an entity that is absent or
///   deleted, or creating an observation on an unknown feature
pub fn apply_mutation(lookup: &impl EntityLookup, mutation: &Mutation) -> Result<EntityWrite> {
    mutation.validate()?;
    match &mutation.target {
        MutationTarget::Feature(delta) => apply_feature(lookup, mutation, delta),
        MutationTarget::Observation(delta) => apply_observation(lookup, mutation, delta),
    }
}

fn audit_of(mutation: &Mutation) -> AuditInfo {
    AuditInfo::new(mutation.user_id.clone(), mutation.client_timestamp)
}

fn live<T>(row: Option<(T, EntityState)>) -> Option<T> {
    match row {
        Some((value, EntityState::Default)) => Some(value),
        _ => None,
    }
}

fn apply_feature(
    lookup: &impl EntityLookup,
    mutation: &Mutation,
    delta: &FeatureDelta,
) -> Result<EntityWrite> {
    let audit = audit_of(mutation);
    let current = live(lookup.feature(&delta.feature_id)?);

    let (feature, state) = match mutation.mutation_type {
        MutationType::Create => {
            if current.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "Feature {}",
                    delta.feature_id
                )));
            }
            let point = delta
                .new_location
                .ok_or_else(|| Error::Validation("Missing newLocation".to_string()))?;
            let feature = Feature::new(
                delta.feature_id.clone(),
                mutation.project_id.clone(),
                mutation.layer_id.clone(),
                point,
                audit.clone(),
                audit,
            );
            (feature, EntityState::Default)
        }
        MutationType::Update => {
            let current = current
                .ok_or_else(|| Error::NotFound(format!("Feature {}", delta.feature_id)))?;
            let point = delta.new_location.unwrap_or_else(|| current.point());
            (
                current.with_point(point).with_last_modified(audit),
                EntityState::Default,
            )
        }
        MutationType::Delete => {
            let current = current
                .ok_or_else(|| Error::NotFound(format!("Feature {}", delta.feature_id)))?;
            (current.with_last_modified(audit), EntityState::Deleted)
        }
    };

    Ok(EntityWrite::Feature { feature, state })
}

fn apply_observation(
    lookup: &impl EntityLookup,
    mutation: &Mutation,
    delta: &ObservationDelta,
) -> Result<EntityWrite> {
    let audit = audit_of(mutation);
    let current = live(lookup.observation(&delta.observation_id)?);

    let (observation, state) = match mutation.mutation_type {
        MutationType::Create => {
            if current.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "Observation {}",
                    delta.observation_id
                )));
            }
            if live(lookup.feature(&delta.feature_id)?).is_none() {
                return Err(Error::NotFound(format!("Feature {}", delta.feature_id)));
            }
            let observation = Observation::new(
                delta.observation_id.clone(),
                mutation.project_id.clone(),
                delta.feature_id.clone(),
                delta.form_id.clone(),
                ResponseMap::from_deltas(&delta.response_deltas),
                audit.clone(),
                audit,
            );
            (observation, EntityState::Default)
        }
        MutationType::Update => {
            let current = current.ok_or_else(|| {
                Error::NotFound(format!("Observation {}", delta.observation_id))
            })?;
            let responses = current.responses().with_deltas(&delta.response_deltas);
            (
                current.with_responses(responses).with_last_modified(audit),
                EntityState::Default,
            )
        }
        MutationType::Delete => {
            let current = current.ok_or_else(|| {
                Error::NotFound(format!("Observation {}", delta.observation_id))
            })?;
            (current.with_last_modified(audit), EntityState::Deleted)
        }
    };

    Ok(EntityWrite::Observation { observation, state })
}
