// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_lidarblocks::{lidar::Error, processor::Controls};
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// JSON file with processing controls.  Flags given on the command line
    /// override the values from the file.
    #[arg(long, env)]
    pub config: Option<PathBuf>,

    /// Tile edge length in cells
    #[arg(long, env)]
    pub window_size: Option<usize>,

    /// Cell size in metres
    #[arg(long, env)]
    pub bin_size: Option<f64>,

    /// Process consecutive pulse ranges instead of spatial tiles
    #[arg(long, env)]
    pub non_spatial: bool,

    /// Pulses per block when not processing spatially
    #[arg(long, env)]
    pub pulses_per_block: Option<usize>,

    /// Largest stratified array, in elements, allowed per tile
    #[arg(long, env)]
    pub stratify_limit: Option<usize>,

    /// Height bin edges in metres
    #[arg(long, env, default_value = "0 2 5 10 20 40", value_delimiter = ' ')]
    pub height_bins: Vec<f64>,

    /// Number of pulses in the synthetic scene
    #[arg(long, env, default_value = "100000")]
    pub pulses: usize,

    /// Side length of the synthetic scene in metres
    #[arg(long, env, default_value = "500")]
    pub scene_size: f64,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,
}

impl TryFrom<&Args> for Controls {
    type Error = Error;

    fn try_from(args: &Args) -> Result<Self, Error> {
        let mut controls = match &args.config {
            Some(path) => Controls::from_json_file(path)?,
            None => Controls::default(),
        };

        if let Some(window_size) = args.window_size {
            controls.window_size = window_size;
        }
        if let Some(bin_size) = args.bin_size {
            controls.bin_size = bin_size;
        }
        if args.non_spatial {
            controls.spatial_processing = false;
        }
        if let Some(pulses_per_block) = args.pulses_per_block {
            controls.pulses_per_block = pulses_per_block;
        }
        if args.stratify_limit.is_some() {
            controls.stratify_limit = args.stratify_limit;
        }

        controls.validate()?;
        Ok(controls)
    }
}
