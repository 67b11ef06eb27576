// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-block objects handed to the user callback.
//!
//! Every processed block gets a fresh [`DataContainer`] holding a
//! [`UserInfo`] describing the block plus one [`DataHandle`] per registered
//! data source. Handles read through to their driver immediately; writes are
//! buffered until [`DataHandle::flush`], which the processor calls once the
//! callback returns.
//!
//! ```text
//! Idle ──read*──► Idle ──set*──► Pending ──flush──► Idle
//!   └──────────────────set*──────────┘
//! ```

use crate::driver::{ImageDriver, LidarDriver, LidarOutput, Records};
use crate::lidar::{AccessMode, Error, Extent, Point, PointField, Pulse, PulseRange};
use crate::masked::MaskedArray;
use crate::stratify::{BinEdges, Stratifier};
use log::trace;
use ndarray::{Array1, Array3, Ix2, Ix3, Ix4};
use std::collections::BTreeMap;
use tracing::instrument;

/// Read-only description of the block being processed.
///
/// Either `extent` (spatial processing) or `range` (range processing) is set,
/// never both.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UserInfo {
    pixel_grid: Option<Extent>,
    extent: Option<Extent>,
    range: Option<PulseRange>,
}

impl UserInfo {
    pub(crate) fn for_tile(pixel_grid: Extent, extent: Extent) -> Self {
        Self {
            pixel_grid: Some(pixel_grid),
            extent: Some(extent),
            range: None,
        }
    }

    pub(crate) fn for_range(range: PulseRange) -> Self {
        Self {
            pixel_grid: None,
            extent: None,
            range: Some(range),
        }
    }

    /// Total processing extent and resolution.
    pub fn pixel_grid(&self) -> Option<Extent> {
        self.pixel_grid
    }

    /// Extent of the current block. Only set for spatial processing.
    pub fn extent(&self) -> Option<Extent> {
        self.extent
    }

    /// Pulse range of the current block. Only set for range processing.
    pub fn range(&self) -> Option<PulseRange> {
        self.range
    }
}

fn require_read(mode: AccessMode, operation: &'static str) -> Result<(), Error> {
    if mode.is_readable() {
        Ok(())
    } else {
        Err(Error::Mode { mode, operation })
    }
}

fn require_write(mode: AccessMode, operation: &'static str) -> Result<(), Error> {
    if mode.is_writable() {
        Ok(())
    } else {
        Err(Error::Mode { mode, operation })
    }
}

/// LiDAR accessor for one block.
pub struct LidarData<'a> {
    mode: AccessMode,
    driver: &'a mut dyn LidarDriver,
    spatial: bool,
    stratifier: Stratifier,
    pending: LidarOutput,
}

impl<'a> LidarData<'a> {
    /// `stratify_limit` caps the element count of stratified outputs.
    pub fn new(
        mode: AccessMode,
        driver: &'a mut dyn LidarDriver,
        spatial: bool,
        stratify_limit: Option<usize>,
    ) -> Self {
        let stratifier = match stratify_limit {
            Some(limit) => Stratifier::with_limit(limit),
            None => Stratifier::new(),
        };
        Self {
            mode,
            driver,
            spatial,
            stratifier,
            pending: LidarOutput::default(),
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial
    }

    /// Points of the block's extent or range as a flat array.
    pub fn get_points(&mut self) -> Result<Array1<Point>, Error> {
        require_read(self.mode, "get_points")?;
        if self.spatial {
            self.driver.read_points_for_extent()
        } else {
            self.driver.read_points_for_range()
        }
    }

    /// Pulses of the block's extent or range as a flat array.
    pub fn get_pulses(&mut self) -> Result<Array1<Pulse>, Error> {
        require_read(self.mode, "get_pulses")?;
        if self.spatial {
            self.driver.read_pulses_for_extent()
        } else {
            self.driver.read_pulses_for_range()
        }
    }

    /// Points of the block as a `(slot, row, col)` ragged array.
    ///
    /// `extent` overrides the block extent and binning. Only valid with
    /// spatial processing.
    #[instrument(skip_all)]
    pub fn get_points_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Point, Ix3>, Error> {
        require_read(self.mode, "get_points_by_bins")?;
        if !self.spatial {
            return Err(Error::NonSpatialMode);
        }
        self.driver.read_points_for_extent_by_bins(extent)
    }

    /// Pulses of the block as a `(slot, row, col)` ragged array. Only valid
    /// with spatial processing.
    #[instrument(skip_all)]
    pub fn get_pulses_by_bins(
        &mut self,
        extent: Option<&Extent>,
    ) -> Result<MaskedArray<Pulse, Ix3>, Error> {
        require_read(self.mode, "get_pulses_by_bins")?;
        if !self.spatial {
            return Err(Error::NonSpatialMode);
        }
        self.driver.read_pulses_for_extent_by_bins(extent)
    }

    /// Split a ragged `(slot, row, col)` point array into height bins,
    /// returning `(slot, bin, row, col)`.
    ///
    /// `bins` holds the `N + 1` edges of `N` half-open bins; points whose
    /// `field` value is outside `[bins[0], bins[N])` are left out.
    #[instrument(skip_all)]
    pub fn rebin_points_by_height(
        &mut self,
        points_by_bin: &MaskedArray<Point, Ix3>,
        bins: &[f64],
        field: PointField,
    ) -> Result<MaskedArray<Point, Ix4>, Error> {
        let edges = BinEdges::try_from(bins)?;
        self.stratifier
            .stratify(points_by_bin, &edges, |p| field.value(p))
    }

    /// Points of the block stratified by height as `(slot, bin, row, col)`.
    /// Only valid with spatial processing.
    pub fn get_points_by_height(
        &mut self,
        bins: &[f64],
    ) -> Result<MaskedArray<Point, Ix4>, Error> {
        if !self.spatial {
            return Err(Error::NonSpatialMode);
        }
        let edges = BinEdges::try_from(bins)?;
        let points = self.get_points_by_bins(None)?;
        self.stratifier
            .stratify(&points, &edges, |p| PointField::Z.value(p))
    }

    /// Per-(bin, row, col) counts from the last stratification.
    pub fn height_occupancy(&self) -> &Array3<u32> {
        self.stratifier.occupancy()
    }

    /// Points of the block's pulses as `(return, pulse)`.
    pub fn get_points_by_pulse(&mut self) -> Result<MaskedArray<Point, Ix2>, Error> {
        require_read(self.mode, "get_points_by_pulse")?;
        self.driver.read_points_by_pulse()
    }

    /// Transmitted waveform samples as `(sample, pulse)`.
    pub fn get_transmitted(&mut self) -> Result<MaskedArray<u32, Ix2>, Error> {
        require_read(self.mode, "get_transmitted")?;
        self.driver.read_transmitted()
    }

    /// Received waveform samples as `(sample, pulse)`.
    pub fn get_received(&mut self) -> Result<MaskedArray<u32, Ix2>, Error> {
        require_read(self.mode, "get_received")?;
        self.driver.read_received()
    }

    /// Buffer points for writing, flat or ragged by cell.
    pub fn set_points(&mut self, points: Records<Point>) -> Result<(), Error> {
        require_write(self.mode, "set_points")?;
        trace!("pending {} points", points.len());
        self.pending.points = Some(points);
        Ok(())
    }

    /// Buffer pulses for writing, flat or ragged by cell.
    pub fn set_pulses(&mut self, pulses: Records<Pulse>) -> Result<(), Error> {
        require_write(self.mode, "set_pulses")?;
        trace!("pending {} pulses", pulses.len());
        self.pending.pulses = Some(pulses);
        Ok(())
    }

    pub fn set_transmitted(&mut self, transmitted: MaskedArray<u32, Ix2>) -> Result<(), Error> {
        require_write(self.mode, "set_transmitted")?;
        self.pending.transmitted = Some(transmitted);
        Ok(())
    }

    pub fn set_received(&mut self, received: MaskedArray<u32, Ix2>) -> Result<(), Error> {
        require_write(self.mode, "set_received")?;
        self.pending.received = Some(received);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Write buffered output to the driver and clear the buffer. Does
    /// nothing when nothing is pending.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let output = std::mem::take(&mut self.pending);
        self.driver.write_data(output)
    }
}

/// Raster accessor for one block.
pub struct ImageData<'a> {
    mode: AccessMode,
    driver: &'a mut dyn ImageDriver,
    pending: Option<Array3<f64>>,
}

impl<'a> ImageData<'a> {
    pub fn new(mode: AccessMode, driver: &'a mut dyn ImageDriver) -> Self {
        Self {
            mode,
            driver,
            pending: None,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Raster values for the block as `(band, row, col)`.
    pub fn get_data(&mut self) -> Result<Array3<f64>, Error> {
        require_read(self.mode, "get_data")?;
        self.driver.get_data()
    }

    /// Buffer raster values for the block as `(band, row, col)`.
    pub fn set_data(&mut self, data: Array3<f64>) -> Result<(), Error> {
        require_write(self.mode, "set_data")?;
        self.pending = Some(data);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self.pending.take() {
            Some(data) => self.driver.set_data(data),
            None => Ok(()),
        }
    }
}

/// A named data source bound to the current block.
pub enum DataHandle<'a> {
    Lidar(LidarData<'a>),
    Image(ImageData<'a>),
}

impl DataHandle<'_> {
    pub fn mode(&self) -> AccessMode {
        match self {
            DataHandle::Lidar(l) => l.mode(),
            DataHandle::Image(i) => i.mode(),
        }
    }

    pub fn has_pending(&self) -> bool {
        match self {
            DataHandle::Lidar(l) => l.has_pending(),
            DataHandle::Image(i) => i.has_pending(),
        }
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self {
            DataHandle::Lidar(l) => l.flush(),
            DataHandle::Image(i) => i.flush(),
        }
    }
}

/// Everything the user callback sees for one block.
pub struct DataContainer<'a> {
    pub info: UserInfo,
    handles: BTreeMap<String, DataHandle<'a>>,
}

impl<'a> DataContainer<'a> {
    pub fn new(info: UserInfo) -> Self {
        Self {
            info,
            handles: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, handle: DataHandle<'a>) {
        self.handles.insert(name.into(), handle);
    }

    /// Names of the registered data sources, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.handles.keys().map(String::as_str).collect()
    }

    /// LiDAR data source registered as `name`.
    pub fn lidar(&mut self, name: &str) -> Result<&mut LidarData<'a>, Error> {
        match self.handles.get_mut(name) {
            Some(DataHandle::Lidar(l)) => Ok(l),
            _ => Err(Error::UnknownHandle(name.to_string())),
        }
    }

    /// Image data source registered as `name`.
    pub fn image(&mut self, name: &str) -> Result<&mut ImageData<'a>, Error> {
        match self.handles.get_mut(name) {
            Some(DataHandle::Image(i)) => Ok(i),
            _ => Err(Error::UnknownHandle(name.to_string())),
        }
    }

    /// Flush every data source.
    pub fn flush(&mut self) -> Result<(), Error> {
        for (name, handle) in self.handles.iter_mut() {
            if handle.has_pending() {
                trace!("flushing {}", name);
            }
            handle.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryImage, MemoryLidar};
    use ndarray::Axis;

    fn pt(x: f64, y: f64, z: f64) -> Point {
        Point {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    fn scene() -> MemoryLidar {
        let mut lidar = MemoryLidar::new();
        lidar.push_pulse(0.5, 1.5, [pt(0.5, 1.5, 12.0), pt(0.5, 1.5, 3.0)]);
        lidar.push_pulse(0.5, 1.5, [pt(0.5, 1.5, 0.5)]);
        lidar.push_pulse(1.5, 0.5, [pt(1.5, 0.5, 0.1)]);
        lidar.set_extent(Extent::new(0.0, 2.0, 0.0, 2.0, 1.0).unwrap());
        lidar
    }

    #[test]
    fn test_flat_reads() {
        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, true, None);
        assert_eq!(data.get_points().unwrap().len(), 4);
        assert_eq!(data.get_pulses().unwrap().len(), 3);
    }

    #[test]
    fn test_spatial_only_accessors() {
        let mut lidar = scene();
        lidar.set_pulse_range(PulseRange::new(0, 3));
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, false, None);

        assert!(matches!(
            data.get_points_by_bins(None),
            Err(Error::NonSpatialMode)
        ));
        assert!(matches!(
            data.get_pulses_by_bins(None),
            Err(Error::NonSpatialMode)
        ));
        assert!(matches!(
            data.get_points_by_height(&[0.0, 1.0]),
            Err(Error::NonSpatialMode)
        ));
        // Flat reads follow the range
        assert_eq!(data.get_points().unwrap().len(), 4);
    }

    #[test]
    fn test_points_by_height() {
        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, true, None);
        let strat = data.get_points_by_height(&[0.0, 1.0, 5.0, 20.0]).unwrap();

        assert_eq!(strat.shape(), &[1, 3, 2, 2]);
        assert_eq!(strat.count_valid(), 4);
        assert_eq!(strat.get([0, 2, 0, 0]).map(|p| p.z), Some(12.0));
        assert_eq!(strat.get([0, 1, 0, 0]).map(|p| p.z), Some(3.0));
        assert_eq!(strat.get([0, 0, 0, 0]).map(|p| p.z), Some(0.5));
        assert_eq!(strat.get([0, 0, 1, 1]).map(|p| p.z), Some(0.1));
        assert_eq!(data.height_occupancy()[[0, 1, 1]], 1);
    }

    #[test]
    fn test_points_by_height_bad_edges() {
        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, true, None);
        assert!(matches!(
            data.get_points_by_height(&[5.0, 1.0]),
            Err(Error::InvalidBinEdges(_))
        ));
        assert!(matches!(
            data.get_points_by_height(&[5.0]),
            Err(Error::InvalidBinEdges(_))
        ));
    }

    #[test]
    fn test_rebin_by_intensity() {
        let mut lidar = MemoryLidar::new();
        lidar.push_pulse(
            0.5,
            0.5,
            [
                Point {
                    x: 0.5,
                    y: 0.5,
                    intensity: 10,
                    ..Default::default()
                },
                Point {
                    x: 0.5,
                    y: 0.5,
                    intensity: 200,
                    ..Default::default()
                },
            ],
        );
        lidar.set_extent(Extent::new(0.0, 1.0, 0.0, 1.0, 1.0).unwrap());
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, true, None);
        let by_bins = data.get_points_by_bins(None).unwrap();
        let strat = data
            .rebin_points_by_height(&by_bins, &[0.0, 100.0, 1000.0], PointField::Intensity)
            .unwrap();
        assert_eq!(strat.shape(), &[1, 2, 1, 1]);
        assert_eq!(strat.get([0, 1, 0, 0]).map(|p| p.intensity), Some(200));
    }

    #[test]
    fn test_write_then_flush_without_read() {
        let mut lidar = scene();
        {
            let mut data = LidarData::new(AccessMode::Create, &mut lidar, true, None);
            let pts = Array1::from_vec(vec![pt(0.1, 0.1, 1.0)]);
            data.set_points(Records::Flat(pts)).unwrap();
            assert!(data.has_pending());
            data.flush().unwrap();
            assert!(!data.has_pending());
            // Nothing pending: no-op
            data.flush().unwrap();
        }
        assert_eq!(lidar.written().len(), 1);
        assert_eq!(
            lidar.written()[0].points.as_ref().map(|p| p.len()),
            Some(1)
        );
    }

    #[test]
    fn test_mode_routing() {
        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Read, &mut lidar, true, None);
        assert!(matches!(
            data.set_points(Records::Flat(Array1::from_vec(vec![]))),
            Err(Error::Mode {
                mode: AccessMode::Read,
                ..
            })
        ));

        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Create, &mut lidar, true, None);
        assert!(matches!(data.get_points(), Err(Error::Mode { .. })));

        let mut lidar = scene();
        let mut data = LidarData::new(AccessMode::Update, &mut lidar, true, None);
        let ragged = data.get_points_by_bins(None).unwrap();
        data.set_points(Records::Ragged(ragged)).unwrap();
        data.flush().unwrap();
        drop(data);
        assert_eq!(lidar.written()[0].points.as_ref().map(|p| p.len()), Some(4));
    }

    #[test]
    fn test_image_flush() {
        let grid = Extent::new(0.0, 2.0, 0.0, 2.0, 1.0).unwrap();
        let mut img = MemoryImage::create(grid, 1, 0.0);
        img.set_extent(grid);
        {
            let mut data = ImageData::new(AccessMode::Create, &mut img);
            assert!(matches!(data.get_data(), Err(Error::Mode { .. })));
            data.flush().unwrap();
            data.set_data(Array3::from_elem((1, 2, 2), 3.0)).unwrap();
            data.flush().unwrap();
            assert!(!data.has_pending());
        }
        assert_eq!(img.data().sum(), 12.0);
    }

    #[test]
    fn test_container_lookup_and_flush() {
        let mut lidar = scene();
        let grid = Extent::new(0.0, 2.0, 0.0, 2.0, 1.0).unwrap();
        let mut img = MemoryImage::create(grid, 1, f64::NAN);
        img.set_extent(grid);
        {
            let mut container = DataContainer::new(UserInfo::for_tile(grid, grid));
            container.insert(
                "input",
                DataHandle::Lidar(LidarData::new(AccessMode::Read, &mut lidar, true, None)),
            );
            container.insert(
                "output",
                DataHandle::Image(ImageData::new(AccessMode::Create, &mut img)),
            );
            assert_eq!(container.names(), vec!["input", "output"]);
            assert!(matches!(
                container.image("input"),
                Err(Error::UnknownHandle(_))
            ));

            let z = container
                .lidar("input")
                .unwrap()
                .get_points_by_bins(None)
                .unwrap()
                .map(|p| p.z);
            let mean = z.mean_axis(Axis(0));
            let band = mean.data().clone().insert_axis(Axis(0));
            container.image("output").unwrap().set_data(band).unwrap();
            container.flush().unwrap();
            assert_eq!(container.info.extent(), Some(grid));
            assert_eq!(container.info.range(), None);
        }
        assert!((img.data()[[0, 0, 0]] - 15.5 / 3.0).abs() < 1e-12);
        assert!((img.data()[[0, 1, 1]] - 0.1).abs() < 1e-12);
    }
}
