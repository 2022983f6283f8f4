use crate::error::SyncError;
use crate::value::{Envelope, Geometry};

/// Geometry operations the sync core needs. Real projection and precise
/// intersection belong to an external GIS library; implementations adapt
/// one to this trait.
pub trait SpatialEngine {
    /// Re-express the geometry in the given spatial reference.
    fn project(&self, geometry: &Geometry, out_srs: i32) -> Result<Geometry, SyncError>;

    /// Bounding box of the geometry, used as the coarse server-side filter.
    fn envelope(&self, geometry: &Geometry) -> Result<Envelope, SyncError>;

    fn intersects(&self, a: &Geometry, b: &Geometry) -> Result<bool, SyncError>;
}

/// A planar engine over rectangle and point shapes. Shapes are JSON objects
/// of either `{"xmin","ymin","xmax","ymax"}` or `{"x","y"}`. Projection is
/// the identity: every spatial reference is treated as the same plane, which
/// is suitable for tests and for data already expressed in the output
/// reference. Intersection is envelope overlap.
#[derive(Default)]
pub struct PlanarEngine;

impl PlanarEngine {
    pub fn new() -> Self {
        Self
    }

    fn read_number(shape: &serde_json::Value, key: &str) -> Option<f64> {
        shape.get(key).and_then(|v| v.as_f64())
    }
}

impl SpatialEngine for PlanarEngine {
    fn project(&self, geometry: &Geometry, out_srs: i32) -> Result<Geometry, SyncError> {
        Ok(Geometry {
            spatial_reference: out_srs,
            shape: geometry.shape.clone(),
        })
    }

    fn envelope(&self, geometry: &Geometry) -> Result<Envelope, SyncError> {
        let shape = &geometry.shape;
        if let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) = (
            Self::read_number(shape, "xmin"),
            Self::read_number(shape, "ymin"),
            Self::read_number(shape, "xmax"),
            Self::read_number(shape, "ymax"),
        ) {
            return Ok(Envelope {
                xmin,
                ymin,
                xmax,
                ymax,
            });
        }
        if let (Some(x), Some(y)) = (
            Self::read_number(shape, "x"),
            Self::read_number(shape, "y"),
        ) {
            return Ok(Envelope {
                xmin: x,
                ymin: y,
                xmax: x,
                ymax: y,
            });
        }
        Err(SyncError::Spatial(format!(
            "unrecognized shape: {}",
            shape
        )))
    }

    fn intersects(&self, a: &Geometry, b: &Geometry) -> Result<bool, SyncError> {
        Ok(self.envelope(a)?.intersects(&self.envelope(b)?))
    }
}
