//! Offline map tiles and their download lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Slippy-map tile coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TileId {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl FromStr for TileId {
    type Err = Error;

    /// Parse the `(x, y, z)` form produced by `Display`, or bare `x,y,z`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let inner = match trimmed.strip_prefix('(') {
            Some(rest) => rest
                .strip_suffix(')')
                .ok_or_else(|| Error::Validation(format!("Malformed tile id: {}", s)))?,
            None => trimmed,
        };

        let fields = inner
            .split(',')
            .map(|field| field.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Validation(format!("Malformed tile id {}: {}", s, e)))?;

        match fields.as_slice() {
            [x, y, z] => Ok(Self::new(*x, *y, *z)),
            _ => Err(Error::Validation(format!(
                "Tile id must have three coordinates: {}",
                s
            ))),
        }
    }
}

/// Download state of a tile.
///
/// ```text
/// PENDING -> IN_PROGRESS -> DOWNLOADED | FAILED
/// FAILED -> IN_PROGRESS            (retry)
/// DOWNLOADED -> IN_PROGRESS        (asset file missing on disk)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TileState {
    Pending,
    InProgress,
    Downloaded,
    Failed,
}

impl TileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileState::Pending => "PENDING",
            TileState::InProgress => "IN_PROGRESS",
            TileState::Downloaded => "DOWNLOADED",
            TileState::Failed => "FAILED",
        }
    }

    /// Whether the state still needs download work.
    pub fn is_pending(&self) -> bool {
        !matches!(self, TileState::Downloaded)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: TileState) -> bool {
        use TileState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Downloaded)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Downloaded, InProgress)
        )
    }
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TileState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TileState::Pending),
            "IN_PROGRESS" => Ok(TileState::InProgress),
            "DOWNLOADED" => Ok(TileState::Downloaded),
            "FAILED" => Ok(TileState::Failed),
            other => Err(Error::Validation(format!("Unknown tile state: {}", other))),
        }
    }
}

/// One offline map tile asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub id: TileId,
    pub url: String,
    pub path: String,
    pub state: TileState,
}

impl Tile {
    /// A new tile awaiting download. The storage path is derived from `id`.
    pub fn new(id: TileId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            path: Self::path_for(&id),
            state: TileState::Pending,
        }
    }

    /// File name for a tile: coordinates reordered to `z-x-y.mbtiles`.
    pub fn path_for(id: &TileId) -> String {
        format!("{}-{}-{}.mbtiles", id.z, id.x, id.y)
    }

    pub fn with_state(&self, state: TileState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_reorders_coordinates() {
        let tile = Tile::new(TileId::new(1, 2, 3), "u");
        assert_eq!(tile.path, "3-1-2.mbtiles");
        assert_eq!(tile.state, TileState::Pending);
        assert_eq!(Tile::path_for(&TileId::new(1, 2, 3)), tile.path);
    }

    #[test]
    fn test_tile_id_display_and_parse() {
        let id = TileId::new(10, 20, 5);
        assert_eq!(id.to_string(), "(10, 20, 5)");
        assert_eq!("(10, 20, 5)".parse::<TileId>().unwrap(), id);
        assert_eq!("(10,20,5)".parse::<TileId>().unwrap(), id);
        assert_eq!("10,20,5".parse::<TileId>().unwrap(), id);
        assert!("(10,20,5".parse::<TileId>().is_err());
        assert!("10-20-5".parse::<TileId>().is_err());
        assert!("(1, 2)".parse::<TileId>().is_err());
    }

    #[test]
    fn test_state_transitions() {
        use TileState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Failed.can_transition_to(InProgress));
        assert!(Downloaded.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Downloaded));
        assert!(!Failed.can_transition_to(Downloaded));
        assert!(Downloaded.can_transition_to(InProgress));
    }

    #[test]
    fn test_state_strings() {
        for state in [
            TileState::Pending,
            TileState::InProgress,
            TileState::Downloaded,
            TileState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<TileState>().unwrap(), state);
        }
    }
}
