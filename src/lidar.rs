// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Common LiDAR types shared by the drivers, the binning engine and the
//! per-block accessors.
//!
//! Points and pulses are plain `Copy` records so they can live inside dense
//! `ndarray` buffers. Spatial blocks are described by an [`Extent`], range
//! blocks by a [`PulseRange`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single LiDAR return.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u16,
    pub return_number: u8,
    pub classification: u8,
    /// Index of the pulse this return belongs to.
    pub pulse_id: u64,
}

/// A single emitted pulse.
///
/// The returns of a pulse are stored contiguously in the point table starting
/// at `pts_start_idx`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pulse {
    pub pulse_id: u64,
    /// Pulse location used for spatial binning.
    pub x_idx: f64,
    pub y_idx: f64,
    pub number_of_returns: u8,
    pub pts_start_idx: u64,
}

/// Numeric point attribute used to stratify points.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointField {
    X,
    Y,
    #[default]
    Z,
    Intensity,
    Classification,
    ReturnNumber,
}

impl PointField {
    /// Read this attribute from a point as `f64`.
    #[inline]
    pub fn value(self, point: &Point) -> f64 {
        match self {
            PointField::X => point.x,
            PointField::Y => point.y,
            PointField::Z => point.z,
            PointField::Intensity => point.intensity as f64,
            PointField::Classification => point.classification as f64,
            PointField::ReturnNumber => point.return_number as f64,
        }
    }
}

/// Axis aligned block of map space together with its cell size.
///
/// Rows run from `y_max` downwards and columns from `x_min` rightwards, so
/// cell `(0, 0)` is the top-left corner. A coordinate belongs to the extent
/// when `x_min <= x < x_max` and `y_min < y <= y_max`, which keeps adjacent
/// tiles from claiming the same point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub bin_size: f64,
}

impl Extent {
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64, bin_size: f64) -> Result<Self, Error> {
        let extent = Self {
            x_min,
            x_max,
            y_min,
            y_max,
            bin_size,
        };
        extent.validate()?;
        Ok(extent)
    }

    /// Check the invariants [`Extent::new`] enforces. Extents built as
    /// literals or deserialized from a config skip `new` and must be checked
    /// before their cells are counted.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.bin_size > 0.0 && self.bin_size.is_finite()) {
            return Err(Error::Config(format!(
                "bin size must be positive, got {}",
                self.bin_size
            )));
        }
        let bounds = [self.x_min, self.x_max, self.y_min, self.y_max];
        if !(bounds.iter().all(|v| v.is_finite())
            && self.x_max >= self.x_min
            && self.y_max >= self.y_min)
        {
            return Err(Error::Config(format!(
                "degenerate extent x=[{}, {}] y=[{}, {}]",
                self.x_min, self.x_max, self.y_min, self.y_max
            )));
        }
        Ok(())
    }

    /// Number of cell rows covering the extent.
    pub fn rows(&self) -> usize {
        cell_count(self.y_max - self.y_min, self.bin_size)
    }

    /// Number of cell columns covering the extent.
    pub fn cols(&self) -> usize {
        cell_count(self.x_max - self.x_min, self.bin_size)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x < self.x_max && y > self.y_min && y <= self.y_max
    }

    /// Map a coordinate to its `(row, col)` cell, or `None` when outside.
    #[inline]
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !self.contains(x, y) {
            return None;
        }
        let row = ((self.y_max - y) / self.bin_size) as usize;
        let col = ((x - self.x_min) / self.bin_size) as usize;
        // Guard against rounding on the far edges.
        Some((
            row.min(self.rows().saturating_sub(1)),
            col.min(self.cols().saturating_sub(1)),
        ))
    }

    /// Smallest extent covering both `self` and `other`, on `self`'s cell size.
    pub fn union(&self, other: &Extent) -> Extent {
        Extent {
            x_min: self.x_min.min(other.x_min),
            x_max: self.x_max.max(other.x_max),
            y_min: self.y_min.min(other.y_min),
            y_max: self.y_max.max(other.y_max),
            bin_size: self.bin_size,
        }
    }

    /// Re-grid onto `bin_size`, growing `x_max`/`y_min` to whole cells and
    /// nudging them outwards so that points on the max-x / min-y data bounds
    /// fall inside the half-open extent.
    pub fn snapped(&self, bin_size: f64) -> Extent {
        let cols = (((self.x_max - self.x_min) / bin_size).floor() as usize + 1).max(1);
        let rows = (((self.y_max - self.y_min) / bin_size).floor() as usize + 1).max(1);
        Extent {
            x_min: self.x_min,
            x_max: self.x_min + cols as f64 * bin_size,
            y_min: self.y_max - rows as f64 * bin_size,
            y_max: self.y_max,
            bin_size,
        }
    }
}

/// Whole cells needed to cover `span`, ignoring round-off in tile edges built
/// from cell multiples.
fn cell_count(span: f64, bin_size: f64) -> usize {
    const EPS: f64 = 1e-9;
    (span / bin_size - EPS).ceil().max(0.0) as usize
}

/// Half-open range `[start, end)` of pulse indices processed as one block
/// when spatial processing is disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRange {
    pub start: u64,
    pub end: u64,
}

impl PulseRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, pulse_id: u64) -> bool {
        pulse_id >= self.start && pulse_id < self.end
    }
}

/// Access intent of a data source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read only.
    #[default]
    Read,
    /// Read and write back into the same source.
    Update,
    /// Write only, the source is being created.
    Create,
}

impl AccessMode {
    pub fn is_readable(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::Update)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::Update | AccessMode::Create)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AccessMode::Read => write!(f, "read"),
            AccessMode::Update => write!(f, "update"),
            AccessMode::Create => write!(f, "create"),
        }
    }
}

/// Common error type for block processing.
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),
    /// Configuration file could not be parsed
    Json(serde_json::Error),
    /// Shape error from ndarray operations or mismatched array shapes
    Shape(ndarray::ShapeError),
    /// A cell-grid accessor was used while spatial processing is disabled
    NonSpatialMode,
    /// Bin edges are too short, non-finite or decreasing
    InvalidBinEdges(String),
    /// The fill pass ran out of slots and dropped elements
    CapacityOverflow { dropped: usize, capacity: usize },
    /// Dense output would exceed the configured element ceiling
    ResourceLimit { requested: usize, limit: usize },
    /// Operation not permitted by the data source's access mode
    Mode {
        mode: AccessMode,
        operation: &'static str,
    },
    /// No data source registered under this name
    UnknownHandle(String),
    /// Configuration error
    Config(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "json error: {}", err),
            Error::Shape(err) => write!(f, "shape error: {}", err),
            Error::NonSpatialMode => {
                write!(f, "call only valid when doing spatial processing")
            }
            Error::InvalidBinEdges(msg) => write!(f, "invalid bin edges: {}", msg),
            Error::CapacityOverflow { dropped, capacity } => write!(
                f,
                "capacity overflow: {} elements dropped with {} slots per cell",
                dropped, capacity
            ),
            Error::ResourceLimit { requested, limit } => write!(
                f,
                "resource limit: {} elements requested, limit is {}",
                requested, limit
            ),
            Error::Mode { mode, operation } => {
                write!(f, "{} not permitted on a {} data source", operation, mode)
            }
            Error::UnknownHandle(name) => write!(f, "unknown data source: {}", name),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Shape(err)
    }
}

/// Shape mismatch between two arrays that must agree.
pub(crate) fn incompatible_shape() -> Error {
    Error::Shape(ndarray::ShapeError::from_kind(
        ndarray::ErrorKind::IncompatibleShape,
    ))
}
