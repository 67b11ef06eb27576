// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! End-to-end block processing over the in-memory drivers.

use edgefirst_lidarblocks::{
    do_processing, AccessMode, Controls, DataFiles, Error, Extent, MemoryImage, MemoryLidar,
    Point, Records,
};
use ndarray::{s, Array3, Axis};

/// 8x8 metre scene, one pulse per 0.5m, heights rising to the east.
fn ramp_scene() -> MemoryLidar {
    let mut lidar = MemoryLidar::new();
    for i in 0..16 {
        for j in 0..16 {
            let x = 0.25 + i as f64 * 0.5;
            let y = 0.25 + j as f64 * 0.5;
            let ground = Point {
                x,
                y,
                z: 0.0,
                ..Default::default()
            };
            let top = Point { z: x, ..ground };
            let id = lidar.push_pulse(x, y, [top, ground]);
            lidar
                .set_waveforms(id, vec![1, 2, 3], vec![id as u32; (id % 4) as usize])
                .unwrap();
        }
    }
    lidar
}

fn grid() -> Extent {
    Extent::new(0.0, 8.0, 0.0, 8.0, 1.0).unwrap()
}

#[test]
fn test_write_image_from_pulses() {
    let mut lidar = ramp_scene();
    let mut image = MemoryImage::create(grid(), 1, f64::NAN);
    let controls = Controls {
        window_size: 3,
        extent: Some(grid()),
        ..Default::default()
    };

    let mut files = DataFiles::new();
    files.add_lidar("input1", &mut lidar, AccessMode::Read).unwrap();
    files.add_image("imageOut1", &mut image, AccessMode::Create).unwrap();

    let blocks = do_processing(
        |data| {
            let pulses = data.lidar("input1")?.get_pulses_by_bins(None)?;
            let avg_x = pulses.map(|p| p.x_idx).mean_axis(Axis(0));
            data.image("imageOut1")?
                .set_data(avg_x.data().clone().insert_axis(Axis(0)))
        },
        &mut files,
        &controls,
    )
    .unwrap();
    drop(files);

    // 8 cells in tiles of 3: 3 x 3 tiles
    assert_eq!(blocks, 9);
    for r in 0..8 {
        for c in 0..8 {
            // Each 1m cell holds pulses at +0.25 and +0.75
            assert!((image.data()[[0, r, c]] - (c as f64 + 0.5)).abs() < 1e-12);
        }
    }
}

#[test]
fn test_height_strata_per_tile() {
    let mut lidar = ramp_scene();
    let edges = [0.0, 0.1, 4.0, 8.0];
    let mut image = MemoryImage::create(grid(), 3, f64::NAN);
    let controls = Controls {
        window_size: 4,
        extent: Some(grid()),
        ..Default::default()
    };

    let mut files = DataFiles::new();
    files.add_lidar("input", &mut lidar, AccessMode::Read).unwrap();
    files.add_image("counts", &mut image, AccessMode::Create).unwrap();

    do_processing(
        |data| {
            let strat = data.lidar("input")?.get_points_by_height(&edges)?;
            let counts = strat.map(|p| p.z).count_axis(Axis(0));
            data.image("counts")?.set_data(counts.mapv(|n| n as f64))
        },
        &mut files,
        &controls,
    )
    .unwrap();
    drop(files);

    let counts = image.data();
    // Every cell has four ground returns
    assert!(counts.index_axis(Axis(0), 0).iter().all(|&n| n == 4.0));
    // Canopy returns split at x = 4 (column 4); column 0 tops are 0.25, 0.75
    assert_eq!(counts[[1, 0, 0]], 4.0);
    assert_eq!(counts[[2, 0, 0]], 0.0);
    assert_eq!(counts[[1, 5, 3]], 4.0);
    assert_eq!(counts[[2, 5, 4]], 4.0);
    assert_eq!(counts.sum(), 16.0 * 16.0 * 2.0);
}

#[test]
fn test_update_round_trip_with_waveforms() {
    let mut lidar = ramp_scene();
    let controls = Controls {
        spatial_processing: false,
        pulses_per_block: 100,
        ..Default::default()
    };

    let mut files = DataFiles::new();
    files.add_lidar("data", &mut lidar, AccessMode::Update).unwrap();

    let mut first_block = true;
    let blocks = do_processing(
        |data| {
            let range = data.info.range().expect("range processing");
            let lidar = data.lidar("data")?;

            let by_pulse = lidar.get_points_by_pulse()?;
            assert_eq!(by_pulse.shape(), &[2, range.len()]);

            let tx = lidar.get_transmitted()?;
            assert_eq!(tx.count_valid(), 3 * range.len());
            let rx = lidar.get_received()?;
            if first_block {
                // Pulses 0..4 carry 0, 1, 2 and 3 received samples
                assert_eq!(rx.shape()[0], 3);
                assert_eq!(rx.get([0, 0]), None);
                assert_eq!(rx.get([2, 3]), Some(&3));
                first_block = false;
            }

            lidar.set_transmitted(tx)?;
            lidar.set_received(rx)?;
            let pulses = lidar.get_pulses()?;
            lidar.set_pulses(Records::Flat(pulses))
        },
        &mut files,
        &controls,
    )
    .unwrap();
    drop(files);

    assert_eq!(blocks, 3);
    let written = lidar.written();
    assert_eq!(written.len(), 3);
    let pulses: usize = written
        .iter()
        .filter_map(|w| w.pulses.as_ref().map(|p| p.len()))
        .sum();
    assert_eq!(pulses, 256);
    assert!(written.iter().all(|w| w.transmitted.is_some() && w.points.is_none()));
}

#[test]
fn test_spatial_accessors_rejected_in_range_mode() {
    let mut lidar = ramp_scene();
    let controls = Controls {
        spatial_processing: false,
        ..Default::default()
    };
    let mut files = DataFiles::new();
    files.add_lidar("input", &mut lidar, AccessMode::Read).unwrap();

    let res = do_processing(
        |data| {
            data.lidar("input")?.get_points_by_height(&[0.0, 1.0])?;
            Ok(())
        },
        &mut files,
        &controls,
    );
    assert!(matches!(res, Err(Error::NonSpatialMode)));
}

#[test]
fn test_tile_output_overrides_extent() {
    let mut lidar = ramp_scene();
    let mut image = MemoryImage::create(grid(), 1, 0.0);
    let controls = Controls {
        window_size: 8,
        extent: Some(grid()),
        ..Default::default()
    };
    let mut files = DataFiles::new();
    files.add_lidar("input", &mut lidar, AccessMode::Read).unwrap();
    files.add_image("out", &mut image, AccessMode::Update).unwrap();

    do_processing(
        |data| {
            let tile = data.info.extent().expect("spatial processing");
            // Re-bin on a coarser 2m grid over the same tile
            let coarse = Extent { bin_size: 2.0, ..tile };
            let points = data.lidar("input")?.get_points_by_bins(Some(&coarse))?;
            assert_eq!(&points.shape()[1..], &[4, 4]);
            assert_eq!(points.shape()[0], 32);

            let image = data.image("out")?;
            let mut current: Array3<f64> = image.get_data()?;
            current.slice_mut(s![0, ..4, ..4]).fill(1.0);
            image.set_data(current)
        },
        &mut files,
        &controls,
    )
    .unwrap();
    drop(files);

    assert_eq!(image.data().sum(), 16.0);
}

#[test]
fn test_returns_outside_pulse_bounds_are_read_once() {
    let mut lidar = MemoryLidar::new();
    // Return lands a cell east of its pulse, beyond every pulse origin
    let off = Point {
        x: 1.5,
        y: 0.5,
        z: 3.0,
        ..Default::default()
    };
    let origin = Point::default();
    lidar.push_pulse(0.5, 0.5, [off]);
    lidar.push_pulse(0.0, 0.0, [origin]);

    let controls = Controls {
        window_size: 1,
        ..Default::default()
    };
    let mut files = DataFiles::new();
    files.add_lidar("input", &mut lidar, AccessMode::Read).unwrap();

    let (mut flat, mut by_bins, mut by_pulse) = (0, 0, 0);
    let blocks = do_processing(
        |data| {
            let lidar = data.lidar("input")?;
            flat += lidar.get_points()?.len();
            by_bins += lidar.get_points_by_bins(None)?.count_valid();
            by_pulse += lidar.get_points_by_pulse()?.count_valid();
            Ok(())
        },
        &mut files,
        &controls,
    )
    .unwrap();

    assert_eq!(blocks, 2);
    assert_eq!((flat, by_bins, by_pulse), (2, 2, 2));
}
