// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst LiDAR Block Processing Library
//!
//! This library streams LiDAR datasets through a block-at-a-time pipeline
//! and turns the ragged per-cell point populations of each block into dense
//! masked arrays ready for vectorised analysis.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌───────────────┐     ┌─────────────────┐
//! │  do_processing  │ ──► │  LidarDriver  │ ──► │  MaskedArray    │
//! │  (tiles/ranges) │     │  ImageDriver  │     │  (slot,row,col) │
//! └─────────────────┘     └───────────────┘     └─────────────────┘
//!          │                                            │
//!          ▼                                            ▼
//! ┌─────────────────┐              ┌─────────────────────────────────────┐
//! │  DataContainer  │ ◄─────────── │  Stratifier                         │
//! │  (user fn)      │              │  count ─► size ─► fill ─► gather    │
//! └─────────────────┘              └─────────────────────────────────────┘
//! ```
//!
//! For every block the processor:
//! 1. Points each driver at the block: `driver.set_extent(tile)`
//! 2. Builds a [`DataContainer`] with one handle per data source
//! 3. Calls the user function, which reads through the handles and buffers
//!    output with the `set_*` methods
//! 4. Flushes every handle before moving to the next block
//!
//! # Modules
//!
//! - [`lidar`]: Common types, access modes and error handling
//! - [`masked`]: Dense masked arrays for ragged data
//! - [`stratify`]: Two-pass count and fill binning into height strata
//! - [`driver`]: Data source traits and in-memory drivers
//! - [`container`]: Per-block accessors handed to user code
//! - [`processor`]: Controls, block planning and the processing loop
//!
//! # Example
//!
//! ```ignore
//! use edgefirst_lidarblocks::{
//!     driver::{MemoryImage, MemoryLidar},
//!     lidar::AccessMode,
//!     processor::{do_processing, Controls, DataFiles},
//! };
//! use ndarray::Axis;
//!
//! let mut files = DataFiles::new();
//! files.add_lidar("input", &mut lidar, AccessMode::Read)?;
//! files.add_image("mean_z", &mut image, AccessMode::Create)?;
//!
//! do_processing(
//!     |data| {
//!         let points = data.lidar("input")?.get_points_by_bins(None)?;
//!         let mean = points.map(|p| p.z).mean_axis(Axis(0));
//!         data.image("mean_z")?
//!             .set_data(mean.data().clone().insert_axis(Axis(0)))
//!     },
//!     &mut files,
//!     &Controls::default(),
//! )?;
//! ```

pub mod container;
pub mod driver;
pub mod lidar;
pub mod masked;
pub mod processor;
pub mod stratify;

// Re-exports for convenience
pub use container::{DataContainer, ImageData, LidarData, UserInfo};
pub use driver::{ImageDriver, LidarDriver, MemoryImage, MemoryLidar, Records};
pub use lidar::{AccessMode, Error, Extent, Point, PointField, Pulse, PulseRange};
pub use masked::MaskedArray;
pub use processor::{do_processing, Controls, DataFiles};
pub use stratify::{stratify, BinEdges, StratifiedIndex, Stratifier};
