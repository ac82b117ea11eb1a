//! User-selected regions for offline map use.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::str::FromStr;

use crate::tile::TileId;
use crate::types::Point;
use crate::{Error, Result};

/// Web Mercator cannot represent latitudes beyond this.
const MAX_MERCATOR_LATITUDE: f64 = 85.051_128_78;

/// Highest zoom level accepted when enumerating tiles.
pub const MAX_ZOOM: u32 = 22;

/// Rectangular geographic bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south_west: Point,
    pub north_east: Point,
}

impl Bounds {
    /// # Errors
    /// - South-west corner is not south and west of the north-east corner
    pub fn new(south_west: Point, north_east: Point) -> Result<Self> {
        if south_west.latitude > north_east.latitude
            || south_west.longitude > north_east.longitude
        {
            return Err(Error::Validation(format!(
                "Bounds corners out of order: {} / {}",
                south_west, north_east
            )));
        }
        Ok(Self {
            south_west,
            north_east,
        })
    }

    /// Enumerate the tiles at `zoom` that cover these bounds, row by row.
    pub fn tile_ids(&self, zoom: u32) -> Result<Vec<TileId>> {
        if zoom > MAX_ZOOM {
            return Err(Error::Validation(format!("Zoom out of range: {}", zoom)));
        }
        // North maps to the smaller y.
        let (min_x, min_y) = tile_xy(self.north_east.latitude, self.south_west.longitude, zoom);
        let (max_x, max_y) = tile_xy(self.south_west.latitude, self.north_east.longitude, zoom);

        let mut ids = Vec::new();
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                ids.push(TileId::new(x, y, zoom));
            }
        }
        Ok(ids)
    }
}

fn tile_xy(latitude: f64, longitude: f64, zoom: u32) -> (u32, u32) {
    let n = f64::from(1u32 << zoom);
    let max_index = (1u32 << zoom) - 1;
    let lat = latitude
        .clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE)
        .to_radians();

    let x = ((longitude + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * n).floor();

    let clamp = |v: f64| (v.max(0.0) as u32).min(max_index);
    (clamp(x), clamp(y))
}

/// Download state of an offline area, mirroring the tile lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfflineAreaState {
    Pending,
    InProgress,
    Downloaded,
    Failed,
}

impl OfflineAreaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineAreaState::Pending => "PENDING",
            OfflineAreaState::InProgress => "IN_PROGRESS",
            OfflineAreaState::Downloaded => "DOWNLOADED",
            OfflineAreaState::Failed => "FAILED",
        }
    }
}

impl FromStr for OfflineAreaState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(OfflineAreaState::Pending),
            "IN_PROGRESS" => Ok(OfflineAreaState::InProgress),
            "DOWNLOADED" => Ok(OfflineAreaState::Downloaded),
            "FAILED" => Ok(OfflineAreaState::Failed),
            other => Err(Error::Validation(format!(
                "Unknown offline area state: {}",
                other
            ))),
        }
    }
}

/// A region the user wants available offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineArea {
    pub id: String,
    pub bounds: Bounds,
    pub state: OfflineAreaState,
}

impl OfflineArea {
    pub fn new(id: impl Into<String>, bounds: Bounds) -> Self {
        Self {
            id: id.into(),
            bounds,
            state: OfflineAreaState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lat: f64, lng: f64) -> Point {
        Point::new(lat, lng).unwrap()
    }

    #[test]
    fn test_zoom_zero_is_single_tile() {
        let bounds = Bounds::new(point(-10.0, -10.0), point(10.0, 10.0)).unwrap();
        assert_eq!(bounds.tile_ids(0).unwrap(), vec![TileId::new(0, 0, 0)]);
    }

    #[test]
    fn test_quadrants_at_zoom_one() {
        let bounds = Bounds::new(point(-10.0, -10.0), point(10.0, 10.0)).unwrap();
        let ids = bounds.tile_ids(1).unwrap();
        assert_eq!(
            ids,
            vec![
                TileId::new(0, 0, 1),
                TileId::new(1, 0, 1),
                TileId::new(0, 1, 1),
                TileId::new(1, 1, 1),
            ]
        );
    }

    #[test]
    fn test_small_area_single_tile() {
        // Around Greenwich, zoom 10.
        let bounds = Bounds::new(point(51.47, -0.01), point(51.48, -0.001)).unwrap();
        let ids = bounds.tile_ids(10).unwrap();
        assert_eq!(ids, vec![TileId::new(511, 340, 10)]);
    }

    #[test]
    fn test_rejects_inverted_bounds_and_zoom() {
        assert!(Bounds::new(point(10.0, 0.0), point(0.0, 10.0)).is_err());
        let bounds = Bounds::new(point(0.0, 0.0), point(1.0, 1.0)).unwrap();
        assert!(bounds.tile_ids(MAX_ZOOM + 1).is_err());
    }

    #[test]
    fn test_new_area_is_pending() {
        let bounds = Bounds::new(point(0.0, 0.0), point(1.0, 1.0)).unwrap();
        let area = OfflineArea::new("id_1", bounds);
        assert_eq!(area.state, OfflineAreaState::Pending);
    }
}
