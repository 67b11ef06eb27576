// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser as _;
use edgefirst_lidarblocks::{
    container::DataContainer,
    driver::{LidarDriver as _, MemoryImage, MemoryLidar, Records},
    lidar::{AccessMode, Error, Point, PointField},
    processor::{do_processing, Controls, DataFiles},
    stratify::BinEdges,
};
use itertools::izip;
use log::{debug, info};
use ndarray::{s, Array1, Array3, Axis};
use std::time::Instant;

/// Synthetic forest over a `size` x `size` square.
///
/// Pulse locations follow the R2 low-discrepancy sequence so tiles have an
/// even density. Each pulse has one to three returns falling from the canopy
/// to a gently rolling ground surface.
fn synthetic_scene(n_pulses: usize, size: f64) -> MemoryLidar {
    const G1: f64 = 0.754_877_666_246_692_7;
    const G2: f64 = 0.569_840_290_998_053_2;

    let mut lidar = MemoryLidar::new();
    for k in 0..n_pulses {
        let x = (0.5 + k as f64 * G1).fract() * size;
        let y = (0.5 + k as f64 * G2).fract() * size;
        let ground = 1.0 + 0.5 * (x / 20.0).sin() + 0.5 * (y / 15.0).cos();
        let canopy = 15.0 * ((x / 30.0).sin() * (y / 25.0).cos()).max(0.0);
        let n_returns = if canopy > 0.0 { 1 + k % 3 } else { 1 };

        let returns = (0..n_returns).map(|r| {
            // Last return always hits the ground
            let frac = if r + 1 == n_returns {
                0.0
            } else {
                1.0 - r as f64 / n_returns as f64
            };
            Point {
                x,
                y,
                z: ground + canopy * frac,
                intensity: (1000.0 * (1.0 - frac * 0.5)) as u16,
                classification: if frac == 0.0 { 2 } else { 5 },
                ..Default::default()
            }
        });
        lidar.push_pulse(x, y, returns);
    }
    lidar
}

/// Mean height in band 0, per height bin return counts in the bands after.
fn height_summary(data: &mut DataContainer, edges: &BinEdges) -> Result<(), Error> {
    let lidar = data.lidar("input")?;
    let by_bins = lidar.get_points_by_bins(None)?;
    let strat = lidar.rebin_points_by_height(&by_bins, edges.as_slice(), PointField::Z)?;

    let mean = by_bins.map(|p| p.z).mean_axis(Axis(0));
    let counts = strat.map(|p| p.z).count_axis(Axis(0));
    let (_, rows, cols) = by_bins.data().dim();
    debug!(
        "tile {}x{}: {} points, {} stratified",
        rows,
        cols,
        by_bins.count_valid(),
        strat.count_valid()
    );

    let mut out = Array3::from_elem((1 + edges.n_bins(), rows, cols), f64::NAN);
    for (o, &v, &m) in izip!(out.index_axis_mut(Axis(0), 0), mean.data(), mean.mask()) {
        if !m {
            *o = v;
        }
    }
    out.slice_mut(s![1.., .., ..])
        .assign(&counts.mapv(|n| n as f64));
    data.image("heights")?.set_data(out)
}

/// Copy first returns of every pulse to the output.
fn first_returns(data: &mut DataContainer) -> Result<(), Error> {
    let by_pulse = data.lidar("input")?.get_points_by_pulse()?;
    if by_pulse.is_empty() {
        return Ok(());
    }
    let first: Array1<Point> = by_pulse
        .data()
        .index_axis(Axis(0), 0)
        .iter()
        .zip(by_pulse.mask().index_axis(Axis(0), 0))
        .filter(|(_, &m)| !m)
        .map(|(p, _)| *p)
        .collect();
    data.lidar("output")?.set_points(Records::Flat(first))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(args.rust_log)
        .init();

    let mut controls = Controls::try_from(&args)?;
    let edges = BinEdges::new(args.height_bins.clone())?;

    let start = Instant::now();
    let mut lidar = synthetic_scene(args.pulses, args.scene_size);
    info!(
        "generated {} pulses, {} points in {:?}",
        lidar.pulse_count(),
        lidar.points().len(),
        start.elapsed()
    );

    let start = Instant::now();
    if controls.spatial_processing {
        let grid = match controls.extent {
            Some(extent) => extent,
            None => lidar
                .extent()
                .ok_or_else(|| Error::Config("empty scene".to_string()))?
                .snapped(controls.bin_size),
        };
        controls.extent = Some(grid);
        let mut image = MemoryImage::create(grid, 1 + edges.n_bins(), f64::NAN);

        let mut files = DataFiles::new();
        files.add_lidar("input", &mut lidar, AccessMode::Read)?;
        files.add_image("heights", &mut image, AccessMode::Create)?;
        let blocks = do_processing(|data| height_summary(data, &edges), &mut files, &controls)?;
        drop(files);

        let mean = image.data().index_axis(Axis(0), 0);
        let covered = mean.iter().filter(|v| !v.is_nan()).count();
        let tallest = mean
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .fold(f64::NEG_INFINITY, f64::max);
        info!(
            "processed {} tiles in {:?}: {} of {} cells covered, tallest mean {:.2}m",
            blocks,
            start.elapsed(),
            covered,
            mean.len(),
            tallest
        );
        for b in 0..edges.n_bins() {
            let total: f64 = image.data().index_axis(Axis(0), b + 1).sum();
            info!(
                "  [{:>5.1}, {:>5.1}) {} returns",
                edges.as_slice()[b],
                edges.as_slice()[b + 1],
                total
            );
        }
    } else {
        let mut output = MemoryLidar::new();
        let mut files = DataFiles::new();
        files.add_lidar("input", &mut lidar, AccessMode::Read)?;
        files.add_lidar("output", &mut output, AccessMode::Create)?;
        let blocks = do_processing(first_returns, &mut files, &controls)?;
        drop(files);

        let written: usize = output
            .written()
            .iter()
            .filter_map(|w| w.points.as_ref().map(|p| p.len()))
            .sum();
        info!(
            "processed {} pulse blocks in {:?}: {} first returns written",
            blocks,
            start.elapsed(),
            written
        );
    }

    Ok(())
}
