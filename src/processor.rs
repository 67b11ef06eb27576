// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Serial block processing loop.
//!
//! [`do_processing`] walks the data block by block:
//!
//! 1. Work out the processing extent, either from [`Controls::extent`] or the
//!    union of the LiDAR inputs, snapped to [`Controls::bin_size`].
//! 2. Plan the blocks: square tiles of `window_size` cells in row-major order
//!    from the top-left corner, or consecutive pulse ranges when spatial
//!    processing is disabled.
//! 3. For each block, point every driver at the block, hand a fresh
//!    [`DataContainer`] to the user function and flush every handle before
//!    moving on.
//!
//! Blocks are independent; the only ordering guarantee is that a block's
//! output is flushed before the next block is read.

use crate::container::{DataContainer, DataHandle, ImageData, LidarData, UserInfo};
use crate::driver::{ImageDriver, LidarDriver};
use crate::lidar::{AccessMode, Error, Extent, PulseRange};
use itertools::iproduct;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info_span;

/// Processing parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Controls {
    /// Process by spatial tiles. When false blocks are pulse ranges and the
    /// cell-grid accessors are unavailable.
    pub spatial_processing: bool,
    /// Tile edge length in cells.
    pub window_size: usize,
    /// Pulses per block in range processing.
    pub pulses_per_block: usize,
    /// Cell size in map units.
    pub bin_size: f64,
    /// Processing extent. Defaults to the union of the LiDAR inputs. The
    /// extent's own `bin_size` is used as given.
    pub extent: Option<Extent>,
    /// Largest stratified output, in elements, a LiDAR handle may allocate.
    pub stratify_limit: Option<usize>,
}

impl Default for Controls {
    fn default() -> Self {
        Self {
            spatial_processing: true,
            window_size: 256,
            pulses_per_block: 65536,
            bin_size: 1.0,
            extent: None,
            stratify_limit: None,
        }
    }
}

impl Controls {
    /// Load controls from a JSON file. Missing keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.window_size == 0 {
            return Err(Error::Config("window size must be at least 1".to_string()));
        }
        if self.pulses_per_block == 0 {
            return Err(Error::Config(
                "pulses per block must be at least 1".to_string(),
            ));
        }
        if !(self.bin_size > 0.0 && self.bin_size.is_finite()) {
            return Err(Error::Config(format!(
                "bin size must be positive, got {}",
                self.bin_size
            )));
        }
        if let Some(extent) = &self.extent {
            extent.validate()?;
        }
        Ok(())
    }
}

enum DataFile<'a> {
    Lidar {
        driver: &'a mut dyn LidarDriver,
        mode: AccessMode,
    },
    Image {
        driver: &'a mut dyn ImageDriver,
        mode: AccessMode,
    },
}

/// Named data sources taking part in a run.
#[derive(Default)]
pub struct DataFiles<'a> {
    files: Vec<(String, DataFile<'a>)>,
}

impl<'a> DataFiles<'a> {
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn add_lidar(
        &mut self,
        name: impl Into<String>,
        driver: &'a mut dyn LidarDriver,
        mode: AccessMode,
    ) -> Result<(), Error> {
        self.add(name.into(), DataFile::Lidar { driver, mode })
    }

    pub fn add_image(
        &mut self,
        name: impl Into<String>,
        driver: &'a mut dyn ImageDriver,
        mode: AccessMode,
    ) -> Result<(), Error> {
        self.add(name.into(), DataFile::Image { driver, mode })
    }

    fn add(&mut self, name: String, file: DataFile<'a>) -> Result<(), Error> {
        if self.files.iter().any(|(n, _)| *n == name) {
            return Err(Error::Config(format!("duplicate data source {}", name)));
        }
        self.files.push((name, file));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Readable LiDAR inputs.
    fn lidar_inputs(&self) -> Vec<&dyn LidarDriver> {
        self.files
            .iter()
            .filter_map(|(_, f)| match f {
                DataFile::Lidar { driver, mode } if mode.is_readable() => {
                    Some(&**driver as &dyn LidarDriver)
                }
                _ => None,
            })
            .collect()
    }

    fn has_images(&self) -> bool {
        self.files
            .iter()
            .any(|(_, f)| matches!(f, DataFile::Image { .. }))
    }
}

/// Pixel grid covering the whole run.
pub fn processing_extent(files: &DataFiles, controls: &Controls) -> Result<Extent, Error> {
    if let Some(extent) = controls.extent {
        return Ok(extent);
    }
    files
        .lidar_inputs()
        .into_iter()
        .filter_map(|d| d.extent())
        .reduce(|a, b| a.union(&b))
        .map(|e| e.snapped(controls.bin_size))
        .ok_or_else(|| Error::Config("no input extent, set one in the controls".to_string()))
}

/// Split `grid` into tiles of at most `window_size` x `window_size` cells,
/// row-major from the top-left corner.
pub fn plan_tiles(grid: &Extent, window_size: usize) -> Vec<Extent> {
    let window = window_size.max(1);
    let (rows, cols) = (grid.rows(), grid.cols());
    let bs = grid.bin_size;

    iproduct!(
        (0..rows).step_by(window),
        (0..cols).step_by(window)
    )
    .map(|(row0, col0)| {
        let row1 = (row0 + window).min(rows);
        let col1 = (col0 + window).min(cols);
        // Edges come from absolute cell indices so neighbours share them bit
        // for bit. The last row and column end on the grid's own edges.
        Extent {
            x_min: grid.x_min + col0 as f64 * bs,
            x_max: if col1 == cols {
                grid.x_max
            } else {
                grid.x_min + col1 as f64 * bs
            },
            y_min: if row1 == rows {
                grid.y_min
            } else {
                grid.y_max - row1 as f64 * bs
            },
            y_max: grid.y_max - row0 as f64 * bs,
            bin_size: bs,
        }
    })
    .collect()
}

/// Split `pulse_count` pulses into consecutive ranges of `pulses_per_block`.
pub fn plan_ranges(pulse_count: usize, pulses_per_block: usize) -> Vec<PulseRange> {
    let per_block = pulses_per_block.max(1);
    (0..pulse_count)
        .step_by(per_block)
        .map(|start| PulseRange::new(start as u64, (start + per_block).min(pulse_count) as u64))
        .collect()
}

/// Run `user_fn` over every block of `files`.
///
/// Returns the number of blocks processed. An error from `user_fn` or a
/// driver aborts the run; output of the failed block is not flushed.
pub fn do_processing<F>(
    mut user_fn: F,
    files: &mut DataFiles<'_>,
    controls: &Controls,
) -> Result<usize, Error>
where
    F: FnMut(&mut DataContainer<'_>) -> Result<(), Error>,
{
    controls.validate()?;
    if files.is_empty() {
        return Err(Error::Config("no data sources".to_string()));
    }

    if controls.spatial_processing {
        let grid = processing_extent(files, controls)?;
        let tiles = plan_tiles(&grid, controls.window_size);
        info!(
            "processing {}x{} cells of {} in {} tiles",
            grid.rows(),
            grid.cols(),
            grid.bin_size,
            tiles.len()
        );

        for (index, tile) in tiles.iter().enumerate() {
            info_span!("block", index).in_scope(|| {
                debug!("tile {} {:?}", index, tile);
                let mut container = DataContainer::new(UserInfo::for_tile(grid, *tile));
                for (name, file) in files.files.iter_mut() {
                    let handle = match file {
                        DataFile::Lidar { driver, mode } => {
                            driver.set_extent(*tile);
                            DataHandle::Lidar(LidarData::new(
                                *mode,
                                &mut **driver,
                                true,
                                controls.stratify_limit,
                            ))
                        }
                        DataFile::Image { driver, mode } => {
                            driver.set_extent(*tile);
                            DataHandle::Image(ImageData::new(*mode, &mut **driver))
                        }
                    };
                    container.insert(name.clone(), handle);
                }
                user_fn(&mut container)?;
                container.flush()
            })?;
        }
        Ok(tiles.len())
    } else {
        if files.has_images() {
            return Err(Error::Config(
                "image data sources need spatial processing".to_string(),
            ));
        }
        let pulse_count = files
            .lidar_inputs()
            .into_iter()
            .map(|d| d.pulse_count())
            .max()
            .unwrap_or(0);
        let ranges = plan_ranges(pulse_count, controls.pulses_per_block);
        info!(
            "processing {} pulses in {} blocks",
            pulse_count,
            ranges.len()
        );

        for (index, range) in ranges.iter().enumerate() {
            info_span!("block", index).in_scope(|| {
                debug!("range {}..{}", range.start, range.end);
                let mut container = DataContainer::new(UserInfo::for_range(*range));
                for (name, file) in files.files.iter_mut() {
                    if let DataFile::Lidar { driver, mode } = file {
                        driver.set_pulse_range(*range);
                        container.insert(
                            name.clone(),
                            DataHandle::Lidar(LidarData::new(
                                *mode,
                                &mut **driver,
                                false,
                                controls.stratify_limit,
                            )),
                        );
                    }
                }
                user_fn(&mut container)?;
                container.flush()
            })?;
        }
        Ok(ranges.len())
    }
}
