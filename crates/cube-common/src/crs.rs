//! Coordinate reference system handling.
//!
//! CRSes are identified by EPSG code and validated against the
//! crs-definitions database. Transformations between codes go through
//! proj4rs, which works entirely in Rust (no PROJ system dependency).

use std::fmt;

use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use serde::{Deserialize, Serialize};

use crate::bbox::BoundingBox;
use crate::error::{CubeError, CubeResult};

/// Number of points sampled along each bbox edge when transforming
/// an extent between CRSes. Curved edges need more than the corners.
const DENSIFY_POINTS: usize = 21;

/// A coordinate reference system identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Crs {
    epsg: u16,
}

impl Crs {
    /// WGS 84 geographic coordinates.
    pub const WGS84: Crs = Crs { epsg: 4326 };

    /// Create a CRS from an EPSG code, validating it against the
    /// crs-definitions database.
    pub fn from_epsg(epsg: u16) -> CubeResult<Self> {
        if crs_definitions::from_code(epsg).is_none() {
            return Err(CubeError::Config(format!(
                "EPSG:{epsg} is not in the CRS database"
            )));
        }
        Ok(Self { epsg })
    }

    /// Parse user input such as `"EPSG:4326"`, `"epsg:4326"`, or `"4326"`.
    pub fn from_user_input(s: &str) -> CubeResult<Self> {
        let code = s
            .trim()
            .strip_prefix("EPSG:")
            .or_else(|| s.trim().strip_prefix("epsg:"))
            .unwrap_or_else(|| s.trim());
        let epsg: u16 = code
            .parse()
            .map_err(|_| CubeError::Config(format!("invalid CRS specifier: '{s}'")))?;
        Self::from_epsg(epsg)
    }

    /// The numeric EPSG code.
    pub fn epsg(&self) -> u16 {
        self.epsg
    }

    /// PROJ string for this CRS from the crs-definitions database.
    fn proj_string(&self) -> CubeResult<&'static str> {
        crs_definitions::from_code(self.epsg)
            .map(|def| def.proj4)
            .ok_or_else(|| {
                CubeError::Config(format!("EPSG:{} is not in the CRS database", self.epsg))
            })
    }

    /// Whether this CRS uses geographic (lon/lat degree) coordinates.
    pub fn is_geographic(&self) -> bool {
        crs_definitions::from_code(self.epsg)
            .map(|def| def.proj4.contains("+proj=longlat"))
            .unwrap_or(false)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg)
    }
}

impl TryFrom<String> for Crs {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Crs::from_user_input(&s).map_err(|e| e.to_string())
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> String {
        crs.to_string()
    }
}

/// A reusable transformation between two CRSes.
pub struct Transformer {
    src: Proj,
    dst: Proj,
    src_geographic: bool,
    dst_geographic: bool,
    identity: bool,
}

impl Transformer {
    /// Build a transformer from `src` to `dst`.
    pub fn new(src: Crs, dst: Crs) -> CubeResult<Self> {
        let src_proj = Proj::from_proj_string(src.proj_string()?)
            .map_err(|e| CubeError::Config(format!("invalid projection {src}: {e:?}")))?;
        let dst_proj = Proj::from_proj_string(dst.proj_string()?)
            .map_err(|e| CubeError::Config(format!("invalid projection {dst}: {e:?}")))?;
        Ok(Self {
            src: src_proj,
            dst: dst_proj,
            src_geographic: src.is_geographic(),
            dst_geographic: dst.is_geographic(),
            identity: src == dst,
        })
    }

    /// Transform a single coordinate pair.
    pub fn transform(&self, x: f64, y: f64) -> CubeResult<(f64, f64)> {
        if self.identity {
            return Ok((x, y));
        }

        // proj4rs works in radians for geographic coordinates
        let (x_in, y_in) = if self.src_geographic {
            (x.to_radians(), y.to_radians())
        } else {
            (x, y)
        };

        let mut point = (x_in, y_in, 0.0);
        transform(&self.src, &self.dst, &mut point)
            .map_err(|e| CubeError::Harmonize(format!("coordinate transform failed: {e:?}")))?;

        if self.dst_geographic {
            Ok((point.0.to_degrees(), point.1.to_degrees()))
        } else {
            Ok((point.0, point.1))
        }
    }

    /// Transform a bounding box, sampling points along each edge so that
    /// curvature introduced by the projection is captured in the result.
    pub fn transform_bbox(&self, bbox: &BoundingBox) -> CubeResult<BoundingBox> {
        if self.identity {
            return Ok(*bbox);
        }

        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;

        let n = DENSIFY_POINTS;
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let x = bbox.min_x + t * bbox.width();
            let y = bbox.min_y + t * bbox.height();
            for (px, py) in [
                (x, bbox.min_y),
                (x, bbox.max_y),
                (bbox.min_x, y),
                (bbox.max_x, y),
            ] {
                let (tx, ty) = self.transform(px, py)?;
                min_x = min_x.min(tx);
                min_y = min_y.min(ty);
                max_x = max_x.max(tx);
                max_y = max_y.max(ty);
            }
        }

        Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crs() {
        assert_eq!(Crs::from_user_input("EPSG:4326").unwrap(), Crs::WGS84);
        assert_eq!(Crs::from_user_input("4326").unwrap(), Crs::WGS84);
        assert_eq!(Crs::from_user_input("epsg:3857").unwrap().epsg(), 3857);
        assert!(Crs::from_user_input("EPSG:99999").is_err());
        assert!(Crs::from_user_input("not-a-crs").is_err());
    }

    #[test]
    fn test_geographic_flag() {
        assert!(Crs::WGS84.is_geographic());
        assert!(!Crs::from_epsg(3857).unwrap().is_geographic());
    }

    #[test]
    fn test_transform_wgs84_to_mercator() {
        let t = Transformer::new(Crs::WGS84, Crs::from_epsg(3857).unwrap()).unwrap();
        let (x, y) = t.transform(0.0, 0.0).unwrap();
        assert!(x.abs() < 1e-6);
        assert!(y.abs() < 1e-6);

        let (x, _) = t.transform(180.0, 0.0).unwrap();
        assert!((x - 20037508.342789244).abs() < 1.0);
    }

    #[test]
    fn test_transform_roundtrip() {
        let merc = Crs::from_epsg(3857).unwrap();
        let fwd = Transformer::new(Crs::WGS84, merc).unwrap();
        let back = Transformer::new(merc, Crs::WGS84).unwrap();

        let (x, y) = fwd.transform(10.5, 48.25).unwrap();
        let (lon, lat) = back.transform(x, y).unwrap();
        assert!((lon - 10.5).abs() < 1e-6);
        assert!((lat - 48.25).abs() < 1e-6);
    }

    #[test]
    fn test_identity_transform_bbox() {
        let t = Transformer::new(Crs::WGS84, Crs::WGS84).unwrap();
        let bbox = BoundingBox::new(-10.0, 40.0, 10.0, 55.0);
        assert_eq!(t.transform_bbox(&bbox).unwrap(), bbox);
    }

    #[test]
    fn test_transform_bbox_covers_corners() {
        let t = Transformer::new(Crs::WGS84, Crs::from_epsg(3857).unwrap()).unwrap();
        let bbox = BoundingBox::new(-10.0, 40.0, 10.0, 55.0);
        let out = t.transform_bbox(&bbox).unwrap();

        let (cx, cy) = t.transform(-10.0, 40.0).unwrap();
        assert!(out.contains_point(cx, cy));
        let (cx, cy) = t.transform(10.0, 55.0).unwrap();
        assert!(out.contains_point(cx, cy));
    }

    #[test]
    fn test_crs_serde() {
        let crs: Crs = serde_json::from_str("\"EPSG:3035\"").unwrap();
        assert_eq!(crs.epsg(), 3035);
        assert_eq!(serde_json::to_string(&crs).unwrap(), "\"EPSG:3035\"");
    }
}
