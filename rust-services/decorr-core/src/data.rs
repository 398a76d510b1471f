//! Loading of channel stacks, precomputed covariance matrices and
//! acquisition geometry.
//!
//! Projection data is expected in an NPZ archive, stored either as `f64` or
//! `f32` (promoted to `f64` on load):
//!   - a (k, H, W) array of material channels, by default under `data`
//!   - optionally a k×k covariance (e.g. CRLB) matrix, by default under `crlb`
//!
//! The geometry is a JSON descriptor, see [`AcquisitionGeometry`].

use std::f64::consts::PI;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::{Array, Array2, Array3, Dimension};
use ndarray_npy::{NpzReader, ReadNpzError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DecorrError, Result};

pub const DEFAULT_DATA_KEY: &str = "data";
pub const DEFAULT_COVARIANCE_KEY: &str = "crlb";

/// Read a (k, H, W) channel stack from an NPZ archive.
pub fn load_channel_stack<P: AsRef<Path>>(path: P, key: &str) -> Result<Array3<f64>> {
    let mut npz = open_npz(path.as_ref())?;
    let stack: Array3<f64> = read_promoted(&mut npz, key)?;
    debug!(path = ?path.as_ref(), key, shape = ?stack.shape(), "loaded channel stack");
    Ok(stack)
}

/// Read a precomputed square covariance matrix from an NPZ archive.
pub fn load_covariance<P: AsRef<Path>>(path: P, key: &str) -> Result<Array2<f64>> {
    let mut npz = open_npz(path.as_ref())?;
    let cov: Array2<f64> = read_promoted(&mut npz, key)?;
    let (rows, cols) = cov.dim();
    if rows != cols || rows == 0 {
        return Err(DecorrError::NotSquare { rows, cols });
    }
    Ok(cov)
}

fn open_npz(path: &Path) -> Result<NpzReader<File>> {
    let file = File::open(path)?;
    Ok(NpzReader::new(file)?)
}

/// numpy's `savez` stores entries as `<key>.npy`; accept both spellings.
fn resolve_entry(npz: &mut NpzReader<File>, key: &str) -> Result<String> {
    let names = npz.names()?;
    let suffixed = format!("{}.npy", key);
    names
        .iter()
        .find(|name| name.as_str() == key || **name == suffixed)
        .cloned()
        .ok_or_else(|| DecorrError::MissingEntry {
            key: key.to_string(),
            available: names.clone(),
        })
}

fn read_promoted<D: Dimension>(npz: &mut NpzReader<File>, key: &str) -> Result<Array<f64, D>> {
    let name = resolve_entry(npz, key)?;
    let as_f64: std::result::Result<Array<f64, D>, ReadNpzError> = npz.by_name(&name);
    match as_f64 {
        Ok(array) => Ok(array),
        Err(err) => {
            let as_f32: std::result::Result<Array<f32, D>, ReadNpzError> = npz.by_name(&name);
            as_f32.map(|a| a.mapv(f64::from)).map_err(|_| err.into())
        }
    }
}

/// Uniform partition of `[min, max]` into `count` cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniformPartition {
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl UniformPartition {
    pub fn new(min: f64, max: f64, count: usize) -> Self {
        Self { min, max, count }
    }

    pub fn cell_size(&self) -> f64 {
        (self.max - self.min) / self.count as f64
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.count == 0 {
            return Err(DecorrError::InvalidGeometry(format!("{} partition has no cells", what)));
        }
        if !(self.min.is_finite() && self.max.is_finite()) || self.max <= self.min {
            return Err(DecorrError::InvalidGeometry(format!(
                "{} partition [{}, {}] is empty or not finite",
                what, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// 2D acquisition geometry of the projection data.
///
/// Serialized with an internal `kind` tag:
///
/// ```json
/// { "kind": "fan_flat",
///   "angles":   { "min": 1.5708, "max": 7.8540, "count": 360 },
///   "detector": { "min": -441.53, "max": 441.53, "count": 883 },
///   "src_radius": 500.0, "det_radius": 500.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionGeometry {
    Parallel2d {
        angles: UniformPartition,
        detector: UniformPartition,
    },
    FanFlat {
        angles: UniformPartition,
        detector: UniformPartition,
        src_radius: f64,
        det_radius: f64,
    },
}

impl AcquisitionGeometry {
    /// Parallel-beam scanner: 180 angles over [0, π), 853 detector cells
    /// spanning ±150√2 mm.
    pub fn reference_parallel() -> Self {
        let half_width = 150.0 * 2f64.sqrt();
        AcquisitionGeometry::Parallel2d {
            angles: UniformPartition::new(0.0, PI, 180),
            detector: UniformPartition::new(-half_width, half_width, 853),
        }
    }

    /// Fan-beam scanner: 360 angles over [π/2, 5π/2), 883 flat detector
    /// cells of 0.0573° at 1000 mm source-detector distance.
    pub fn reference_fan_flat() -> Self {
        let det_size = 0.0573f64.to_radians() * 883.0 * (500.0 + 500.0);
        AcquisitionGeometry::FanFlat {
            angles: UniformPartition::new(0.5 * PI, 2.5 * PI, 360),
            detector: UniformPartition::new(-det_size / 2.0, det_size / 2.0, 883),
            src_radius: 500.0,
            det_radius: 500.0,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let geometry: Self = serde_json::from_str(json)?;
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let geometry: Self = serde_json::from_reader(BufReader::new(file))?;
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        self.angles().validate("angle")?;
        self.detector().validate("detector")?;
        if let AcquisitionGeometry::FanFlat { src_radius, det_radius, .. } = self {
            if !(*src_radius > 0.0 && *det_radius > 0.0) {
                return Err(DecorrError::InvalidGeometry(format!(
                    "fan radii must be positive (src {}, det {})",
                    src_radius, det_radius
                )));
            }
        }
        Ok(())
    }

    pub fn angles(&self) -> &UniformPartition {
        match self {
            AcquisitionGeometry::Parallel2d { angles, .. } => angles,
            AcquisitionGeometry::FanFlat { angles, .. } => angles,
        }
    }

    pub fn detector(&self) -> &UniformPartition {
        match self {
            AcquisitionGeometry::Parallel2d { detector, .. } => detector,
            AcquisitionGeometry::FanFlat { detector, .. } => detector,
        }
    }

    /// (angles, detector cells) shape of one sinogram channel.
    pub fn sinogram_shape(&self) -> (usize, usize) {
        (self.angles().count, self.detector().count)
    }

    /// Check that every channel of a (k, H, W) stack is one sinogram.
    pub fn check_stack(&self, stack_shape: &[usize]) -> Result<()> {
        let (n_angles, n_det) = self.sinogram_shape();
        match stack_shape {
            [_, h, w] if *h == n_angles && *w == n_det => Ok(()),
            _ => Err(DecorrError::ShapeMismatch {
                left: stack_shape.to_vec(),
                right: vec![n_angles, n_det],
            }),
        }
    }
}
