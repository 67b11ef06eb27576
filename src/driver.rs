// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Data source abstraction for block processing.
//!
//! This module provides the [`LidarDriver`] and [`ImageDriver`] traits that
//! the per-block accessors call into, enabling:
//!
//! - **File formats**: concrete on-disk drivers implemented outside this crate
//! - **Testing / synthetic runs**: the in-memory [`MemoryLidar`] and
//!   [`MemoryImage`] drivers
//!
//! The only contract between a driver and the rest of the crate is the array
//! shape and mask convention:
//!
//! - flat reads return `Array1<T>` of the records in the current block
//! - by-bins reads return a `(slot, row, col)` [`MaskedArray`] over the cells
//!   of the block extent, padded to the fullest cell
//! - per-pulse reads return a `(slot, pulse)` [`MaskedArray`]
//!
//! The processor selects the current block with [`LidarDriver::set_extent`]
//! or [`LidarDriver::set_pulse_range`] before handing the driver to user code.

use crate::lidar::{incompatible_shape, Error, Extent, Point, Pulse, PulseRange};
use crate::masked::MaskedArray;
use log::{debug, trace};
use ndarray::{s, Array1, Array2, Array3, Ix2, Ix3};

/// Records written back by user code, either flat or ragged by cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Records<T> {
    Flat(Array1<T>),
    Ragged(MaskedArray<T, Ix3>),
}

impl<T: Clone> Records<T> {
    /// Present records in logical order.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Records::Flat(a) => a.to_vec(),
            Records::Ragged(m) => m.compressed(),
        }
    }
}

impl<T> Records<T> {
    pub fn len(&self) -> usize {
        match self {
            Records::Flat(a) => a.len(),
            Records::Ragged(m) => m.count_valid(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pending output of one LiDAR data source for one block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LidarOutput {
    pub points: Option<Records<Point>>,
    pub pulses: Option<Records<Pulse>>,
    pub transmitted: Option<MaskedArray<u32, Ix2>>,
    pub received: Option<MaskedArray<u32, Ix2>>,
}

impl LidarOutput {
    /// True when nothing has been set.
    pub fn is_empty(&self) -> bool {
        self.points.is_none()
            && self.pulses.is_none()
            && self.transmitted.is_none()
            && self.received.is_none()
    }
}

/// Trait for LiDAR data sources.
///
/// Reads refer to the block selected by the last `set_extent` (spatial
/// processing) or `set_pulse_range` (range processing) call.
pub trait LidarDriver {
    /// Bounds of all pulses and points in the source, `None` when empty.
    fn extent(&self) -> Option<Extent>;

    /// Total number of pulses in the source.
    fn pulse_count(&self) -> usize;

    /// Select a spatial block.
    fn set_extent(&mut self, extent: Extent);

    /// Select a range block.
    fn set_pulse_range(&mut self, range: PulseRange);

    fn read_points_for_extent(&mut self) -> Result<Array1<Point>, Error>;

    fn read_points_for_range(&mut self) -> Result<Array1<Point>, Error>;

    fn read_pulses_for_extent(&mut self) -> Result<Array1<Pulse>, Error>;

    fn read_pulses_for_range(&mut self) -> Result<Array1<Pulse>, Error>;

    /// Points of the block binned into `(slot, row, col)`. `extent`
    /// overrides the block extent and cell size.
    fn read_points_for_extent_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Point, Ix3>, Error>;

    /// Pulses of the block binned into `(slot, row, col)`.
    fn read_pulses_for_extent_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Pulse, Ix3>, Error>;

    /// Points of the block's pulses as `(return, pulse)`.
    fn read_points_by_pulse(&mut self) -> Result<MaskedArray<Point, Ix2>, Error>;

    /// Transmitted waveforms of the block's pulses as `(sample, pulse)`.
    fn read_transmitted(&mut self) -> Result<MaskedArray<u32, Ix2>, Error>;

    /// Received waveforms of the block's pulses as `(sample, pulse)`.
    fn read_received(&mut self) -> Result<MaskedArray<u32, Ix2>, Error>;

    /// Commit the output of one block.
    fn write_data(&mut self, output: LidarOutput) -> Result<(), Error>;
}

/// Trait for raster data sources.
pub trait ImageDriver {
    /// Select a spatial block.
    fn set_extent(&mut self, extent: Extent);

    /// Raster values of the block as `(band, row, col)`.
    fn get_data(&mut self) -> Result<Array3<f64>, Error>;

    /// Write raster values of the block as `(band, row, col)`.
    fn set_data(&mut self, data: Array3<f64>) -> Result<(), Error>;
}

/// Bin records into a `(slot, row, col)` ragged array.
///
/// Two passes: count records per cell, size the slot axis to the fullest
/// cell, then scatter records with a per-cell cursor. Within a cell records
/// keep their input order. Records for which `cell` returns `None` are
/// skipped.
pub fn bin_by_cell<T, F>(records: &[T], rows: usize, cols: usize, cell: F) -> MaskedArray<T, Ix3>
where
    T: Clone + Default,
    F: Fn(&T) -> Option<(usize, usize)>,
{
    // Pass 1: count records per cell
    let mut counts = Array2::<u32>::zeros((rows, cols));
    for rec in records {
        if let Some(rc) = cell(rec) {
            counts[rc] += 1;
        }
    }
    let n_slots = counts.iter().copied().max().unwrap_or(0) as usize;

    let mut data = Array3::from_elem((n_slots, rows, cols), T::default());
    let mut mask = Array3::from_elem((n_slots, rows, cols), true);

    // Pass 2: scatter into slots, reusing counts as the write cursor
    counts.fill(0);
    for rec in records {
        if let Some((r, c)) = cell(rec) {
            let j = counts[[r, c]] as usize;
            data[[j, r, c]] = rec.clone();
            mask[[j, r, c]] = false;
            counts[[r, c]] += 1;
        }
    }

    MaskedArray::from_dense(data, mask)
}

/// Stack variable-length columns into a `(slot, column)` masked array.
fn stack_ragged<T: Clone + Default>(columns: &[&[T]]) -> MaskedArray<T, Ix2> {
    let n_slots = columns.iter().map(|c| c.len()).max().unwrap_or(0);
    let mut data = Array2::from_elem((n_slots, columns.len()), T::default());
    let mut mask = Array2::from_elem((n_slots, columns.len()), true);
    for (k, column) in columns.iter().enumerate() {
        let n = column.len();
        data.slice_mut(s![..n, k])
            .assign(&Array1::from_vec(column.to_vec()));
        mask.slice_mut(s![..n, k]).fill(false);
    }
    MaskedArray::from_dense(data, mask)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Block {
    None,
    Tile(Extent),
    Range(PulseRange),
}

/// In-memory LiDAR source.
///
/// Pulses and points are held in two tables; each pulse's returns occupy
/// `pts_start_idx .. pts_start_idx + number_of_returns` in the point table.
/// Written blocks are appended to a history instead of being persisted.
#[derive(Clone, Debug)]
pub struct MemoryLidar {
    pulses: Vec<Pulse>,
    points: Vec<Point>,
    transmitted: Vec<Vec<u32>>,
    received: Vec<Vec<u32>>,
    block: Block,
    written: Vec<LidarOutput>,
}

impl MemoryLidar {
    /// Create an empty source.
    pub fn new() -> Self {
        Self {
            pulses: Vec::new(),
            points: Vec::new(),
            transmitted: Vec::new(),
            received: Vec::new(),
            block: Block::None,
            written: Vec::new(),
        }
    }

    /// Append a pulse located at `(x_idx, y_idx)` with its returns.
    ///
    /// The returns' `pulse_id` and `return_number` are overwritten to match
    /// their position. Returns the new pulse's id.
    pub fn push_pulse<I>(&mut self, x_idx: f64, y_idx: f64, returns: I) -> u64
    where
        I: IntoIterator<Item = Point>,
    {
        let pulse_id = self.pulses.len() as u64;
        let start = self.points.len();
        for (k, mut pt) in returns.into_iter().enumerate() {
            pt.pulse_id = pulse_id;
            pt.return_number = (k + 1).min(u8::MAX as usize) as u8;
            self.points.push(pt);
        }
        let n = (self.points.len() - start).min(u8::MAX as usize) as u8;
        self.pulses.push(Pulse {
            pulse_id,
            x_idx,
            y_idx,
            number_of_returns: n,
            pts_start_idx: start as u64,
        });
        self.transmitted.push(Vec::new());
        self.received.push(Vec::new());
        pulse_id
    }

    /// Attach waveforms to an existing pulse.
    pub fn set_waveforms(
        &mut self,
        pulse_id: u64,
        transmitted: Vec<u32>,
        received: Vec<u32>,
    ) -> Result<(), Error> {
        let i = pulse_id as usize;
        if i >= self.pulses.len() {
            return Err(Error::Config(format!("no pulse with id {}", pulse_id)));
        }
        self.transmitted[i] = transmitted;
        self.received[i] = received;
        Ok(())
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn pulses(&self) -> &[Pulse] {
        &self.pulses
    }

    /// Outputs committed so far, one entry per flushed block.
    pub fn written(&self) -> &[LidarOutput] {
        &self.written
    }

    fn pulse_points(&self, pulse: &Pulse) -> &[Point] {
        let start = pulse.pts_start_idx as usize;
        let end = (start + pulse.number_of_returns as usize).min(self.points.len());
        &self.points[start.min(end)..end]
    }

    fn block_extent(&self, extent: Option<&Extent>) -> Result<Extent, Error> {
        match (extent, self.block) {
            (Some(e), _) => Ok(*e),
            (None, Block::Tile(e)) => Ok(e),
            _ => Err(Error::NonSpatialMode),
        }
    }

    fn block_range(&self) -> Result<PulseRange, Error> {
        match self.block {
            Block::Range(r) => Ok(r),
            _ => Err(Error::Config("no pulse range selected".to_string())),
        }
    }

    /// Pulses of the current block in either mode.
    fn block_pulses(&self) -> Result<Vec<&Pulse>, Error> {
        match self.block {
            Block::Tile(e) => Ok(self
                .pulses
                .iter()
                .filter(|p| e.contains(p.x_idx, p.y_idx))
                .collect()),
            Block::Range(r) => Ok(self.pulses_in_range(r).iter().collect()),
            Block::None => Err(Error::Config("no block selected".to_string())),
        }
    }

    fn pulses_in_range(&self, range: PulseRange) -> &[Pulse] {
        let start = (range.start as usize).min(self.pulses.len());
        let end = (range.end as usize).min(self.pulses.len());
        &self.pulses[start..end]
    }

    fn waveforms(&self, table: &[Vec<u32>]) -> Result<MaskedArray<u32, Ix2>, Error> {
        let pulses = self.block_pulses()?;
        let columns: Vec<&[u32]> = pulses
            .iter()
            .map(|p| table[p.pulse_id as usize].as_slice())
            .collect();
        Ok(stack_ragged(&columns))
    }
}

impl Default for MemoryLidar {
    fn default() -> Self {
        Self::new()
    }
}

impl LidarDriver for MemoryLidar {
    fn extent(&self) -> Option<Extent> {
        // Returns are binned by their own location, so they widen the bounds
        // as well as the pulse origins.
        let pulse_xy = self.pulses.iter().map(|p| (p.x_idx, p.y_idx));
        let point_xy = self.points.iter().map(|p| (p.x, p.y));
        pulse_xy
            .chain(point_xy)
            .map(|(x, y)| Extent {
                x_min: x,
                x_max: x,
                y_min: y,
                y_max: y,
                bin_size: 1.0,
            })
            .reduce(|a, b| a.union(&b))
    }

    fn pulse_count(&self) -> usize {
        self.pulses.len()
    }

    fn set_extent(&mut self, extent: Extent) {
        trace!("memory lidar block {:?}", extent);
        self.block = Block::Tile(extent);
    }

    fn set_pulse_range(&mut self, range: PulseRange) {
        trace!("memory lidar block {:?}", range);
        self.block = Block::Range(range);
    }

    fn read_points_for_extent(&mut self) -> Result<Array1<Point>, Error> {
        let e = self.block_extent(None)?;
        Ok(self
            .points
            .iter()
            .filter(|p| e.contains(p.x, p.y))
            .copied()
            .collect())
    }

    fn read_points_for_range(&mut self) -> Result<Array1<Point>, Error> {
        let range = self.block_range()?;
        Ok(self
            .pulses_in_range(range)
            .iter()
            .flat_map(|p| self.pulse_points(p).iter().copied())
            .collect())
    }

    fn read_pulses_for_extent(&mut self) -> Result<Array1<Pulse>, Error> {
        let e = self.block_extent(None)?;
        Ok(self
            .pulses
            .iter()
            .filter(|p| e.contains(p.x_idx, p.y_idx))
            .copied()
            .collect())
    }

    fn read_pulses_for_range(&mut self) -> Result<Array1<Pulse>, Error> {
        let range = self.block_range()?;
        Ok(Array1::from_vec(self.pulses_in_range(range).to_vec()))
    }

    fn read_points_for_extent_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Point, Ix3>, Error> {
        let e = self.block_extent(extent)?;
        let binned = bin_by_cell(&self.points, e.rows(), e.cols(), |p| e.cell_of(p.x, p.y));
        debug!(
            "binned {} points into {}x{} cells, {} slots",
            binned.count_valid(),
            e.rows(),
            e.cols(),
            binned.shape()[0]
        );
        Ok(binned)
    }

    fn read_pulses_for_extent_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Pulse, Ix3>, Error> {
        let e = self.block_extent(extent)?;
        Ok(bin_by_cell(&self.pulses, e.rows(), e.cols(), |p| {
            e.cell_of(p.x_idx, p.y_idx)
        }))
    }

    fn read_points_by_pulse(&mut self) -> Result<MaskedArray<Point, Ix2>, Error> {
        let pulses = self.block_pulses()?;
        let columns: Vec<&[Point]> = pulses.iter().map(|p| self.pulse_points(p)).collect();
        Ok(stack_ragged(&columns))
    }

    fn read_transmitted(&mut self) -> Result<MaskedArray<u32, Ix2>, Error> {
        self.waveforms(&self.transmitted)
    }

    fn read_received(&mut self) -> Result<MaskedArray<u32, Ix2>, Error> {
        self.waveforms(&self.received)
    }

    fn write_data(&mut self, output: LidarOutput) -> Result<(), Error> {
        debug!(
            "memory lidar write: {} points, {} pulses",
            output.points.as_ref().map_or(0, |p| p.len()),
            output.pulses.as_ref().map_or(0, |p| p.len())
        );
        self.written.push(output);
        Ok(())
    }
}

/// In-memory raster covering a fixed pixel grid.
#[derive(Clone, Debug)]
pub struct MemoryImage {
    grid: Extent,
    data: Array3<f64>,
    block: Option<Extent>,
}

impl MemoryImage {
    /// Raster of `bands` bands over `grid`, initialised to `fill`.
    pub fn create(grid: Extent, bands: usize, fill: f64) -> Self {
        Self {
            data: Array3::from_elem((bands, grid.rows(), grid.cols()), fill),
            grid,
            block: None,
        }
    }

    /// Wrap existing `(band, row, col)` raster values.
    pub fn from_array(grid: Extent, data: Array3<f64>) -> Result<Self, Error> {
        let (_, rows, cols) = data.dim();
        if (rows, cols) != (grid.rows(), grid.cols()) {
            return Err(incompatible_shape());
        }
        Ok(Self {
            grid,
            data,
            block: None,
        })
    }

    pub fn grid(&self) -> &Extent {
        &self.grid
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// `(row, col)` offset and size of the current block inside the grid,
    /// clipped to the raster.
    fn window(&self) -> Result<(usize, usize, usize, usize), Error> {
        let block = self
            .block
            .ok_or_else(|| Error::Config("no image block selected".to_string()))?;
        let (_, rows, cols) = self.data.dim();
        let row0 = (((self.grid.y_max - block.y_max) / self.grid.bin_size).round().max(0.0)
            as usize)
            .min(rows);
        let col0 = (((block.x_min - self.grid.x_min) / self.grid.bin_size).round().max(0.0)
            as usize)
            .min(cols);
        let n_rows = block.rows().min(rows - row0);
        let n_cols = block.cols().min(cols - col0);
        Ok((row0, col0, n_rows, n_cols))
    }
}

impl ImageDriver for MemoryImage {
    fn set_extent(&mut self, extent: Extent) {
        self.block = Some(extent);
    }

    fn get_data(&mut self) -> Result<Array3<f64>, Error> {
        let (row0, col0, n_rows, n_cols) = self.window()?;
        Ok(self
            .data
            .slice(s![.., row0..row0 + n_rows, col0..col0 + n_cols])
            .to_owned())
    }

    fn set_data(&mut self, data: Array3<f64>) -> Result<(), Error> {
        let (row0, col0, n_rows, n_cols) = self.window()?;
        let (bands, rows, cols) = data.dim();
        if (bands, rows, cols) != (self.data.dim().0, n_rows, n_cols) {
            return Err(incompatible_shape());
        }
        self.data
            .slice_mut(s![.., row0..row0 + n_rows, col0..col0 + n_cols])
            .assign(&data);
        Ok(())
    }
}
