//! SQLite-backed local store.
//!
//! Entities, the pending mutation queue, tiles and offline areas live in one
//! database so that applying a mutation and queueing it share a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use groundsync_common::{
    AuditInfo, Entity, EntityState, Error, Feature, Mutation, MutationTarget, Observation,
    OfflineArea, Point, ResponseMap, Result, Tile, TileId,
};

use crate::apply::{apply_mutation, EntityLookup, EntityWrite};
use crate::local::LocalStore;
use crate::watch::{Subscription, WatchRegistry};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS feature (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        layer_id TEXT NOT NULL,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        created TEXT NOT NULL,
        last_modified TEXT NOT NULL,
        state TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_feature_project ON feature(project_id);

    CREATE TABLE IF NOT EXISTS observation (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        feature_id TEXT NOT NULL,
        form_id TEXT NOT NULL,
        responses TEXT NOT NULL,
        created TEXT NOT NULL,
        last_modified TEXT NOT NULL,
        state TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_observation_feature ON observation(feature_id, form_id);

    CREATE TABLE IF NOT EXISTS mutation (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL,
        feature_id TEXT NOT NULL,
        type TEXT NOT NULL,
        project_id TEXT NOT NULL,
        layer_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        client_timestamp TEXT NOT NULL,
        target TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_mutation_feature ON mutation(feature_id);
    CREATE INDEX IF NOT EXISTS idx_mutation_entity ON mutation(entity_id);

    CREATE TABLE IF NOT EXISTS tile (
        id TEXT PRIMARY KEY,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        z INTEGER NOT NULL,
        url TEXT NOT NULL,
        path TEXT NOT NULL,
        state TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS offline_area (
        id TEXT PRIMARY KEY,
        bounds TEXT NOT NULL,
        state TEXT NOT NULL
    );
"#;

fn storage_err(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("Bad timestamp {}: {}", value, e)))
}

/// Raw feature columns, converted outside the rusqlite row closure.
struct FeatureRow {
    id: String,
    project_id: String,
    layer_id: String,
    latitude: f64,
    longitude: f64,
    created: String,
    last_modified: String,
    state: String,
}

impl FeatureRow {
    const COLUMNS: &'static str =
        "id, project_id, layer_id, latitude, longitude, created, last_modified, state";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            layer_id: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            created: row.get(5)?,
            last_modified: row.get(6)?,
            state: row.get(7)?,
        })
    }

    fn into_feature(self) -> Result<(Feature, EntityState)> {
        let created: AuditInfo = serde_json::from_str(&self.created)?;
        let last_modified: AuditInfo = serde_json::from_str(&self.last_modified)?;
        let point = Point {
            latitude: self.latitude,
            longitude: self.longitude,
        };
        let state = self.state.parse()?;
        Ok((
            Feature::new(
                self.id,
                self.project_id,
                self.layer_id,
                point,
                created,
                last_modified,
            ),
            state,
        ))
    }
}

struct ObservationRow {
    id: String,
    project_id: String,
    feature_id: String,
    form_id: String,
    responses: String,
    created: String,
    last_modified: String,
    state: String,
}

impl ObservationRow {
    const COLUMNS: &'static str =
        "id, project_id, feature_id, form_id, responses, created, last_modified, state";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            feature_id: row.get(2)?,
            form_id: row.get(3)?,
            responses: row.get(4)?,
            created: row.get(5)?,
            last_modified: row.get(6)?,
            state: row.get(7)?,
        })
    }

    fn into_observation(self) -> Result<(Observation, EntityState)> {
        let responses: ResponseMap = serde_json::from_str(&self.responses)?;
        let created: AuditInfo = serde_json::from_str(&self.created)?;
        let last_modified: AuditInfo = serde_json::from_str(&self.last_modified)?;
        let state = self.state.parse()?;
        Ok((
            Observation::new(
                self.id,
                self.project_id,
                self.feature_id,
                self.form_id,
                responses,
                created,
                last_modified,
            ),
            state,
        ))
    }
}

struct MutationRow {
    id: i64,
    mutation_type: String,
    project_id: String,
    layer_id: String,
    user_id: String,
    client_timestamp: String,
    target: String,
}

impl MutationRow {
    const COLUMNS: &'static str =
        "id, type, project_id, layer_id, user_id, client_timestamp, target";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            mutation_type: row.get(1)?,
            project_id: row.get(2)?,
            layer_id: row.get(3)?,
            user_id: row.get(4)?,
            client_timestamp: row.get(5)?,
            target: row.get(6)?,
        })
    }

    fn into_mutation(self) -> Result<Mutation> {
        let target: MutationTarget = serde_json::from_str(&self.target)?;
        Ok(Mutation {
            id: Some(self.id),
            mutation_type: self.mutation_type.parse()?,
            project_id: self.project_id,
            layer_id: self.layer_id,
            user_id: self.user_id,
            client_timestamp: parse_time(&self.client_timestamp)?,
            target,
        })
    }
}

type TileRow = (u32, u32, u32, String, String, String);

fn tile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TileRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_tile((x, y, z, url, path, state): TileRow) -> Result<Tile> {
    Ok(Tile {
        id: TileId::new(x, y, z),
        url,
        path,
        state: state.parse()?,
    })
}

fn query_feature(conn: &Connection, feature_id: &str) -> Result<Option<(Feature, EntityState)>> {
    let sql = format!("SELECT {} FROM feature WHERE id = ?1", FeatureRow::COLUMNS);
    conn.query_row(&sql, [feature_id], FeatureRow::from_row)
        .optional()
        .map_err(storage_err)?
        .map(FeatureRow::into_feature)
        .transpose()
}

fn query_features(conn: &Connection, project_id: &str) -> Result<Vec<Feature>> {
    let sql = format!(
        "SELECT {} FROM feature WHERE project_id = ?1 AND state = ?2 ORDER BY id",
        FeatureRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(
            params![project_id, EntityState::Default.as_str()],
            FeatureRow::from_row,
        )
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    rows.into_iter()
        .map(|row| row.into_feature().map(|(feature, _)| feature))
        .collect()
}

fn query_observation(
    conn: &Connection,
    observation_id: &str,
) -> Result<Option<(Observation, EntityState)>> {
    let sql = format!(
        "SELECT {} FROM observation WHERE id = ?1",
        ObservationRow::COLUMNS
    );
    conn.query_row(&sql, [observation_id], ObservationRow::from_row)
        .optional()
        .map_err(storage_err)?
        .map(ObservationRow::into_observation)
        .transpose()
}

fn query_tiles(conn: &Connection, pending_only: bool) -> Result<Vec<Tile>> {
    let sql = if pending_only {
        "SELECT x, y, z, url, path, state FROM tile \
         WHERE state IN ('PENDING', 'IN_PROGRESS', 'FAILED') ORDER BY x, y, z"
    } else {
        "SELECT x, y, z, url, path, state FROM tile ORDER BY x, y, z"
    };
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map([], tile_from_row)
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    rows.into_iter().map(into_tile).collect()
}

fn query_offline_areas(conn: &Connection) -> Result<Vec<OfflineArea>> {
    let mut stmt = conn
        .prepare("SELECT id, bounds, state FROM offline_area ORDER BY id")
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(storage_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;

    rows.into_iter()
        .map(|(id, bounds, state)| {
            Ok(OfflineArea {
                id,
                bounds: serde_json::from_str(&bounds)?,
                state: state.parse()?,
            })
        })
        .collect()
}

fn upsert_feature(conn: &Connection, feature: &Feature, state: Option<EntityState>) -> Result<()> {
    let created = serde_json::to_string(feature.created())?;
    let last_modified = serde_json::to_string(feature.last_modified())?;
    let point = feature.point();

    // A merge passes no state: new rows start live, existing rows keep theirs.
    let sql = if state.is_some() {
        r#"
        INSERT INTO feature
        (id, project_id, layer_id, latitude, longitude, created, last_modified, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            layer_id = excluded.layer_id,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            created = excluded.created,
            last_modified = excluded.last_modified,
            state = excluded.state
        "#
    } else {
        r#"
        INSERT INTO feature
        (id, project_id, layer_id, latitude, longitude, created, last_modified, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            layer_id = excluded.layer_id,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            created = excluded.created,
            last_modified = excluded.last_modified
        "#
    };

    conn.execute(
        sql,
        params![
            feature.id(),
            feature.project_id(),
            feature.layer_id(),
            point.latitude,
            point.longitude,
            created,
            last_modified,
            state.unwrap_or(EntityState::Default).as_str(),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn upsert_observation(
    conn: &Connection,
    observation: &Observation,
    state: Option<EntityState>,
) -> Result<()> {
    let responses = serde_json::to_string(observation.responses())?;
    let created = serde_json::to_string(observation.created())?;
    let last_modified = serde_json::to_string(observation.last_modified())?;

    let sql = if state.is_some() {
        r#"
        INSERT INTO observation
        (id, project_id, feature_id, form_id, responses, created, last_modified, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            feature_id = excluded.feature_id,
            form_id = excluded.form_id,
            responses = excluded.responses,
            created = excluded.created,
            last_modified = excluded.last_modified,
            state = excluded.state
        "#
    } else {
        r#"
        INSERT INTO observation
        (id, project_id, feature_id, form_id, responses, created, last_modified, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            project_id = excluded.project_id,
            feature_id = excluded.feature_id,
            form_id = excluded.form_id,
            responses = excluded.responses,
            created = excluded.created,
            last_modified = excluded.last_modified
        "#
    };

    conn.execute(
        sql,
        params![
            observation.id(),
            observation.project_id(),
            observation.feature_id(),
            observation.form_id(),
            responses,
            created,
            last_modified,
            state.unwrap_or(EntityState::Default).as_str(),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

/// Append to the queue. The id always comes from AUTOINCREMENT so it is
/// larger than every id ever queued, removed ones included.
fn insert_mutation(conn: &Connection, mutation: &Mutation) -> Result<i64> {
    let target = serde_json::to_string(&mutation.target)?;
    conn.execute(
        r#"
        INSERT INTO mutation
        (entity_id, feature_id, type, project_id, layer_id, user_id, client_timestamp, target)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            mutation.entity_id(),
            mutation.feature_id(),
            mutation.mutation_type.as_str(),
            mutation.project_id,
            mutation.layer_id,
            mutation.user_id,
            mutation.client_timestamp.to_rfc3339(),
            target,
        ],
    )
    .map_err(storage_err)?;
    Ok(conn.last_insert_rowid())
}

struct TxLookup<'a>(&'a Connection);

impl EntityLookup for TxLookup<'_> {
    fn feature(&self, feature_id: &str) -> Result<Option<(Feature, EntityState)>> {
        query_feature(self.0, feature_id)
    }

    fn observation(&self, observation_id: &str) -> Result<Option<(Observation, EntityState)>> {
        query_observation(self.0, observation_id)
    }
}

/// Local store on a single SQLite connection.
pub struct SqliteLocalStore {
    conn: Mutex<Connection>,
    feature_watches: Arc<WatchRegistry<String, Vec<Feature>>>,
    tile_watches: Arc<WatchRegistry<(), Vec<Tile>>>,
    area_watches: Arc<WatchRegistry<(), Vec<OfflineArea>>>,
}

impl SqliteLocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        let store = Self::with_connection(conn)?;
        info!("Local store opened at {}", db_path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            feature_watches: WatchRegistry::new(),
            tile_watches: WatchRegistry::new(),
            area_watches: WatchRegistry::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Notifications run while the connection lock is held, so a watcher
    // registered concurrently never misses a committed write.
    fn notify_features(&self, conn: &Connection) {
        self.feature_watches
            .notify(|project_id| query_features(conn, project_id));
    }

    fn notify_tiles(&self, conn: &Connection) {
        self.tile_watches.notify(|_| query_tiles(conn, false));
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn apply_and_enqueue(&self, mutation: Mutation) -> Result<Mutation> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(storage_err)?;

        let write = apply_mutation(&TxLookup(&tx), &mutation)?;
        match &write {
            EntityWrite::Feature { feature, state } => upsert_feature(&tx, feature, Some(*state))?,
            EntityWrite::Observation { observation, state } => {
                upsert_observation(&tx, observation, Some(*state))?
            }
        }
        let id = insert_mutation(&tx, &mutation)?;
        tx.commit().map_err(storage_err)?;

        debug!(
            "Applied and queued {} mutation {} for {}",
            mutation.mutation_type,
            id,
            mutation.entity_id()
        );
        if matches!(write, EntityWrite::Feature { .. }) {
            self.notify_features(&conn);
        }
        Ok(mutation.with_id(id))
    }

    async fn get_pending_mutations(&self, entity_id: &str) -> Result<Vec<Mutation>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM mutation WHERE feature_id = ?1 OR entity_id = ?1 ORDER BY id",
            MutationRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map([entity_id], MutationRow::from_row)
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        rows.into_iter().map(MutationRow::into_mutation).collect()
    }

    async fn update_mutations(&self, mutations: &[Mutation]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        for mutation in mutations {
            let id = mutation
                .id
                .ok_or_else(|| {
                    Error::Validation("Cannot update a mutation without id".to_string())
                })?;
            let target = serde_json::to_string(&mutation.target)?;
            tx.execute(
                r#"
                UPDATE mutation SET
                    entity_id = ?2, feature_id = ?3, type = ?4, project_id = ?5,
                    layer_id = ?6, user_id = ?7, client_timestamp = ?8, target = ?9
                WHERE id = ?1
                "#,
                params![
                    id,
                    mutation.entity_id(),
                    mutation.feature_id(),
                    mutation.mutation_type.as_str(),
                    mutation.project_id,
                    mutation.layer_id,
                    mutation.user_id,
                    mutation.client_timestamp.to_rfc3339(),
                    target,
                ],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)
    }

    async fn remove_pending_mutations(&self, mutations: &[Mutation]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        let mut removed = 0;
        for id in mutations.iter().filter_map(|m| m.id) {
            removed += tx
                .execute("DELETE FROM mutation WHERE id = ?1", [id])
                .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        debug!("Removed {} of {} pending mutations", removed, mutations.len());
        Ok(())
    }

    async fn merge_entity(&self, entity: Entity) -> Result<()> {
        let conn = self.lock();
        match &entity {
            Entity::Feature(feature) => {
                upsert_feature(&conn, feature, None)?;
                self.notify_features(&conn);
            }
            Entity::Observation(observation) => upsert_observation(&conn, observation, None)?,
        }
        debug!("Merged remote entity {}", entity.id());
        Ok(())
    }

    async fn get_feature(&self, project_id: &str, feature_id: &str) -> Result<Option<Feature>> {
        let conn = self.lock();
        Ok(match query_feature(&conn, feature_id)? {
            Some((feature, EntityState::Default)) if feature.project_id() == project_id => {
                Some(feature)
            }
            _ => None,
        })
    }

    async fn get_features(&self, project_id: &str) -> Result<Vec<Feature>> {
        let conn = self.lock();
        query_features(&conn, project_id)
    }

    async fn features_once_and_stream(
        &self,
        project_id: &str,
    ) -> Result<Subscription<Vec<Feature>>> {
        let conn = self.lock();
        let initial = query_features(&conn, project_id)?;
        Ok(self
            .feature_watches
            .subscribe(project_id.to_string(), initial))
    }

    async fn get_observation(
        &self,
        feature_id: &str,
        observation_id: &str,
    ) -> Result<Option<Observation>> {
        let conn = self.lock();
        Ok(match query_observation(&conn, observation_id)? {
            Some((observation, EntityState::Default)) if observation.feature_id() == feature_id => {
                Some(observation)
            }
            _ => None,
        })
    }

    async fn get_observations(&self, feature_id: &str, form_id: &str) -> Result<Vec<Observation>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {} FROM observation \
             WHERE feature_id = ?1 AND form_id = ?2 AND state = ?3 ORDER BY id",
            ObservationRow::COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(
                params![feature_id, form_id, EntityState::Default.as_str()],
                ObservationRow::from_row,
            )
            .map_err(storage_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?;

        rows.into_iter()
            .map(|row| row.into_observation().map(|(observation, _)| observation))
            .collect()
    }

    async fn insert_or_update_tile(&self, tile: &Tile) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO tile (id, x, y, z, url, path, state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                tile.id.to_string(),
                tile.id.x,
                tile.id.y,
                tile.id.z,
                tile.url,
                tile.path,
                tile.state.as_str(),
            ],
        )
        .map_err(storage_err)?;
        self.notify_tiles(&conn);
        Ok(())
    }

    async fn get_tile(&self, id: &TileId) -> Result<Option<Tile>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT x, y, z, url, path, state FROM tile WHERE id = ?1",
            [id.to_string()],
            tile_from_row,
        )
        .optional()
        .map_err(storage_err)?
        .map(into_tile)
        .transpose()
    }

    async fn get_tiles(&self) -> Result<Vec<Tile>> {
        let conn = self.lock();
        query_tiles(&conn, false)
    }

    async fn get_pending_tiles(&self) -> Result<Vec<Tile>> {
        let conn = self.lock();
        query_tiles(&conn, true)
    }

    async fn tiles_once_and_stream(&self) -> Result<Subscription<Vec<Tile>>> {
        let conn = self.lock();
        let initial = query_tiles(&conn, false)?;
        Ok(self.tile_watches.subscribe((), initial))
    }

    async fn insert_or_update_offline_area(&self, area: &OfflineArea) -> Result<()> {
        let conn = self.lock();
        let bounds = serde_json::to_string(&area.bounds)?;
        conn.execute(
            "INSERT OR REPLACE INTO offline_area (id, bounds, state) VALUES (?1, ?2, ?3)",
            params![area.id, bounds, area.state.as_str()],
        )
        .map_err(storage_err)?;
        self.area_watches.notify(|_| query_offline_areas(&conn));
        Ok(())
    }

    async fn offline_areas_once_and_stream(&self) -> Result<Subscription<Vec<OfflineArea>>> {
        let conn = self.lock();
        let initial = query_offline_areas(&conn)?;
        Ok(self.area_watches.subscribe((), initial))
    }
}
