//! GLAD ARD tile identifiers and their geographic bounds.

use crate::{RasterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a tile identifier such as `105W_40N`.
pub const TILE_ID_LEN: usize = 8;

/// Identifier of a 1x1 degree grid cell, e.g. `105W_40N`.
///
/// The first four characters are the longitude band (three digits and `E`/`W`),
/// the last three the latitude band (two digits and `N`/`S`). Both name the
/// north-west corner of the cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId(String);

/// Geographic bounds of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TileBounds {
    /// Minimum latitude (south edge).
    pub min_lat: f64,
    /// Maximum latitude (north edge).
    pub max_lat: f64,
    /// Minimum longitude (west edge).
    pub min_lon: f64,
    /// Maximum longitude (east edge).
    pub max_lon: f64,
}

impl TileBounds {
    /// Check if a coordinate is within the bounds.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

impl TileId {
    /// Parse and validate a tile identifier.
    pub fn parse(id: &str) -> Result<Self> {
        let invalid = || RasterError::InvalidTileId(id.to_string());
        let bytes = id.as_bytes();
        if bytes.len() != TILE_ID_LEN || bytes[4] != b'_' {
            return Err(invalid());
        }
        let lon_ok = bytes[..3].iter().all(u8::is_ascii_digit) && matches!(bytes[3], b'E' | b'W');
        let lat_ok = bytes[5..7].iter().all(u8::is_ascii_digit) && matches!(bytes[7], b'N' | b'S');
        if !lon_ok || !lat_ok {
            return Err(invalid());
        }

        let tile = TileId(id.to_string());
        let (lat, lon) = tile.corner();
        if lon.abs() > 180 || lat.abs() > 90 {
            return Err(invalid());
        }
        Ok(tile)
    }

    /// Create a tile id from its north-west corner in whole degrees.
    pub fn from_corner(lat: i32, lon: i32) -> Result<Self> {
        let lon_hemi = if lon < 0 { 'W' } else { 'E' };
        let lat_hemi = if lat < 0 { 'S' } else { 'N' };
        Self::parse(&format!("{:03}{}_{:02}{}", lon.abs(), lon_hemi, lat.abs(), lat_hemi))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Longitude band, e.g. `105W`.
    pub fn lon_band(&self) -> &str {
        &self.0[0..4]
    }

    /// Latitude band, e.g. `40N`. Source imagery is grouped by this band.
    pub fn lat_band(&self) -> &str {
        &self.0[5..8]
    }

    /// North-west corner as (lat, lon) in whole degrees.
    fn corner(&self) -> (i32, i32) {
        // Shape is validated before any caller gets here, so the digit slices parse.
        let lon: i32 = self.0[0..3].parse().unwrap_or(0);
        let lat: i32 = self.0[5..7].parse().unwrap_or(0);
        let lon = if &self.0[3..4] == "W" { -lon } else { lon };
        let lat = if &self.0[7..8] == "S" { -lat } else { lat };
        (lat, lon)
    }

    /// Geographic bounds of the 1x1 degree cell.
    pub fn bounds(&self) -> TileBounds {
        let (lat, lon) = self.corner();
        TileBounds {
            min_lat: f64::from(lat) - 1.0,
            max_lat: f64::from(lat),
            min_lon: f64::from(lon),
            max_lon: f64::from(lon) + 1.0,
        }
    }

    /// Tile containing a coordinate.
    pub fn for_coord(lat: f64, lon: f64) -> Result<Self> {
        Self::from_corner(lat.ceil() as i32, lon.floor() as i32)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TileId {
    type Err = RasterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TileId {
    type Error = RasterError;

    fn try_from(id: String) -> Result<Self> {
        Self::parse(&id)
    }
}

impl From<TileId> for String {
    fn from(tile: TileId) -> Self {
        tile.0
    }
}

impl AsRef<str> for TileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_bands() {
        let tile = TileId::parse("105W_40N").expect("valid tile");
        assert_eq!(tile.lon_band(), "105W");
        assert_eq!(tile.lat_band(), "40N");
        assert_eq!(tile.to_string(), "105W_40N");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["105W40N", "105W_40", "10WW_40N", "105X_40N", "105W_4AN", "190E_40N", "105W_95N"] {
            assert!(TileId::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_bounds_north_west_corner() {
        let bounds = TileId::parse("105W_40N").unwrap().bounds();
        assert_eq!(bounds.min_lat, 39.0);
        assert_eq!(bounds.max_lat, 40.0);
        assert_eq!(bounds.min_lon, -105.0);
        assert_eq!(bounds.max_lon, -104.0);

        let bounds = TileId::parse("012E_05S").unwrap().bounds();
        assert_eq!(bounds.max_lat, -5.0);
        assert_eq!(bounds.min_lon, 12.0);
    }

    #[test]
    fn test_for_coord_roundtrip() {
        let test_points = [(39.5, -104.5), (-4.2, 12.7), (0.5, 0.5)];
        for (lat, lon) in test_points {
            let tile = TileId::for_coord(lat, lon).unwrap();
            assert!(tile.bounds().contains(lat, lon), "{} should contain ({}, {})", tile, lat, lon);
        }
    }

    #[test]
    fn test_serde_validates() {
        let tile: TileId = serde_json::from_str("\"105W_40N\"").unwrap();
        assert_eq!(serde_json::to_string(&tile).unwrap(), "\"105W_40N\"");
        assert!(serde_json::from_str::<TileId>("\"nope\"").is_err());
    }
}
