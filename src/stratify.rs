// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Two-pass height stratification of ragged per-cell populations.
//!
//! Input is a ragged `(slot, row, col)` population as produced by
//! [`crate::driver::LidarDriver::read_points_for_extent_by_bins`]. Output is a
//! `(slot, bin, row, col)` masked array where each cell's population is split
//! into the half-open value intervals defined by [`BinEdges`].
//!
//! The dense output is sized exactly, without growable per-cell containers:
//!
//! 1. **Count**: [`count_cell_population`] scans every present element and
//!    increments `occupancy[bin, row, col]`. Nothing else is written.
//! 2. **Size**: `capacity = max(occupancy)` gives the slot axis length.
//! 3. **Fill**: the occupancy array is zeroed and reused as a per-cell write
//!    cursor while [`fill_cell_population`] records the source
//!    `(row, col, slot)` of every element in its target `(j, bin, row, col)`.
//! 4. **Gather**: [`gather`] copies source records into the dense output.
//!
//! Both scans visit cells in row-major order and slots in ascending order, so
//! the `j`-th entry of a (bin, cell) is the `j`-th matching element of that
//! cell in source order.

use crate::lidar::{incompatible_shape, Error};
use crate::masked::MaskedArray;
use log::{debug, warn};
use ndarray::{Array3, Array4, ArrayView3, Ix3, Ix4};
use tracing::instrument;

/// Ordered bin boundaries. `N + 1` edges define `N` half-open intervals
/// `[edges[i], edges[i + 1])`.
#[derive(Clone, Debug, PartialEq)]
pub struct BinEdges {
    edges: Vec<f64>,
}

impl BinEdges {
    /// Validate and wrap bin edges.
    ///
    /// Requires at least two finite, non-decreasing values. Equal neighbours
    /// are allowed and produce an always-empty bin.
    pub fn new(edges: Vec<f64>) -> Result<Self, Error> {
        if edges.len() < 2 {
            return Err(Error::InvalidBinEdges(format!(
                "need at least 2 edges, got {}",
                edges.len()
            )));
        }
        if let Some(i) = edges.iter().position(|e| !e.is_finite()) {
            return Err(Error::InvalidBinEdges(format!(
                "edge {} is not finite ({})",
                i, edges[i]
            )));
        }
        if let Some(i) = edges.windows(2).position(|w| w[1] < w[0]) {
            return Err(Error::InvalidBinEdges(format!(
                "edges decrease at index {} ({} > {})",
                i + 1,
                edges[i],
                edges[i + 1]
            )));
        }
        Ok(Self { edges })
    }

    /// `n_bins` bins of equal `width` starting at `start`.
    pub fn uniform(start: f64, width: f64, n_bins: usize) -> Result<Self, Error> {
        if !(width > 0.0) {
            return Err(Error::InvalidBinEdges(format!(
                "bin width must be positive, got {}",
                width
            )));
        }
        Self::new((0..=n_bins).map(|i| start + i as f64 * width).collect())
    }

    pub fn n_bins(&self) -> usize {
        self.edges.len() - 1
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.edges
    }

    /// Bin containing `v`, or `None` when `v` lies outside
    /// `[edges[0], edges[N])` or is NaN.
    ///
    /// Linear scan: bin counts are small in practice.
    #[inline]
    pub fn bin_of(&self, v: f64) -> Option<usize> {
        self.edges.windows(2).position(|w| v >= w[0] && v < w[1])
    }
}

impl TryFrom<&[f64]> for BinEdges {
    type Error = Error;

    fn try_from(edges: &[f64]) -> Result<Self, Error> {
        BinEdges::new(edges.to_vec())
    }
}

/// Source coordinates of every stratified element.
///
/// All arrays have shape `(capacity, n_bins, rows, cols)`. Entry
/// `(j, b, r, c)` is valid when `mask[[j, b, r, c]]` is `false` and then names
/// the source element `population[[slot, row, col]]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StratifiedIndex {
    pub row: Array4<u32>,
    pub col: Array4<u32>,
    pub slot: Array4<u32>,
    pub mask: Array4<bool>,
}

impl StratifiedIndex {
    /// Allocate an index with every entry masked.
    pub fn new(capacity: usize, n_bins: usize, rows: usize, cols: usize) -> Self {
        let shape = (capacity, n_bins, rows, cols);
        Self {
            row: Array4::zeros(shape),
            col: Array4::zeros(shape),
            slot: Array4::zeros(shape),
            mask: Array4::from_elem(shape, true),
        }
    }

    /// `(capacity, n_bins, rows, cols)`
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.mask.dim()
    }

    /// Slots per (bin, cell).
    pub fn capacity(&self) -> usize {
        self.mask.dim().0
    }

    /// Source `(slot, row, col)` of entry `(j, b, r, c)` if it is valid.
    pub fn source(&self, j: usize, b: usize, r: usize, c: usize) -> Option<(usize, usize, usize)> {
        match self.mask.get([j, b, r, c]) {
            Some(false) => Some((
                self.slot[[j, b, r, c]] as usize,
                self.row[[j, b, r, c]] as usize,
                self.col[[j, b, r, c]] as usize,
            )),
            _ => None,
        }
    }
}

fn check_occupancy_shape(
    values: &ArrayView3<f64>,
    mask: &ArrayView3<bool>,
    edges: &BinEdges,
    occupancy: &Array3<u32>,
) -> Result<(), Error> {
    let (_, rows, cols) = values.dim();
    if values.dim() != mask.dim() || occupancy.dim() != (edges.n_bins(), rows, cols) {
        return Err(incompatible_shape());
    }
    Ok(())
}

/// Counting pass.
///
/// Adds to `occupancy[b, r, c]` the number of present elements
/// `values[p, r, c]` with `edges[b] <= v < edges[b + 1]`. `occupancy` must be
/// zeroed by the caller and shaped `(n_bins, rows, cols)`. Values outside all
/// bins are skipped.
pub fn count_cell_population(
    values: ArrayView3<f64>,
    mask: ArrayView3<bool>,
    edges: &BinEdges,
    occupancy: &mut Array3<u32>,
) -> Result<(), Error> {
    check_occupancy_shape(&values, &mask, edges, occupancy)?;
    let (n_slots, rows, cols) = values.dim();

    for r in 0..rows {
        for c in 0..cols {
            for p in 0..n_slots {
                if mask[[p, r, c]] {
                    continue;
                }
                if let Some(b) = edges.bin_of(values[[p, r, c]]) {
                    occupancy[[b, r, c]] += 1;
                }
            }
        }
    }
    Ok(())
}

/// Fill pass.
///
/// `cursor` must be zeroed and shaped `(n_bins, rows, cols)`; it is advanced
/// once per binned element and afterwards equals the counting pass result.
/// Elements whose per-(bin, cell) position reaches `index.capacity()` are not
/// recorded. Returns the number of such dropped elements.
pub fn fill_cell_population(
    values: ArrayView3<f64>,
    mask: ArrayView3<bool>,
    edges: &BinEdges,
    index: &mut StratifiedIndex,
    cursor: &mut Array3<u32>,
) -> Result<usize, Error> {
    check_occupancy_shape(&values, &mask, edges, cursor)?;
    let (n_slots, rows, cols) = values.dim();
    let capacity = index.capacity();
    if index.dim() != (capacity, edges.n_bins(), rows, cols) {
        return Err(incompatible_shape());
    }

    let mut dropped = 0usize;
    for r in 0..rows {
        for c in 0..cols {
            for p in 0..n_slots {
                if mask[[p, r, c]] {
                    continue;
                }
                let Some(b) = edges.bin_of(values[[p, r, c]]) else {
                    continue;
                };
                let j = cursor[[b, r, c]] as usize;
                if j < capacity {
                    let at = [j, b, r, c];
                    index.row[at] = r as u32;
                    index.col[at] = c as u32;
                    index.slot[at] = p as u32;
                    index.mask[at] = false;
                } else {
                    dropped += 1;
                }
                cursor[[b, r, c]] += 1;
            }
        }
    }

    if dropped > 0 {
        warn!(
            "stratify fill dropped {} elements: capacity {} per cell is too small",
            dropped, capacity
        );
    }
    Ok(dropped)
}

/// Build the `(slot, bin, row, col)` output by copying the indexed source
/// records.
///
/// Masked output entries hold a copy of the first source record; their
/// value is unspecified and hidden by the mask. An index that points outside
/// `population` is rejected with a shape error.
pub fn gather<T: Clone>(
    population: &MaskedArray<T, Ix3>,
    index: &StratifiedIndex,
) -> Result<MaskedArray<T, Ix4>, Error> {
    let (_, _, rows, cols) = index.dim();
    let (_, src_rows, src_cols) = population.data().dim();
    if (rows, cols) != (src_rows, src_cols) {
        return Err(incompatible_shape());
    }
    let n_slots = population.data().dim().0;
    if index.slot.iter().any(|&j| j as usize >= n_slots)
        || index.row.iter().any(|&r| r as usize >= rows)
        || index.col.iter().any(|&c| c as usize >= cols)
    {
        return Err(incompatible_shape());
    }
    let source = population.data();
    let data = Array4::from_shape_fn(index.dim(), |(j, b, r, c)| {
        let at = [j, b, r, c];
        source[[
            index.slot[at] as usize,
            index.row[at] as usize,
            index.col[at] as usize,
        ]]
        .clone()
    });
    MaskedArray::from_parts(data, index.mask.clone())
}

/// Reusable ragged-to-dense binner.
///
/// Holds the occupancy scratch buffer between calls so repeated tiles of the
/// same shape do not reallocate it, and enforces an optional ceiling on the
/// number of elements of the dense output.
#[derive(Debug, Default)]
pub struct Stratifier {
    occupancy: Array3<u32>,
    limit: Option<usize>,
}

impl Stratifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse dense outputs larger than `limit` elements
    /// (`capacity * n_bins * rows * cols`).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            occupancy: Array3::zeros((0, 0, 0)),
            limit: Some(limit),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Per-(bin, cell) counts of the last successful [`Self::index`] call.
    pub fn occupancy(&self) -> &Array3<u32> {
        &self.occupancy
    }

    fn reset_occupancy(&mut self, shape: (usize, usize, usize)) {
        if self.occupancy.dim() == shape {
            self.occupancy.fill(0);
        } else {
            self.occupancy = Array3::zeros(shape);
        }
    }

    /// Run the count, size and fill passes and return the exact-size index.
    #[instrument(skip_all)]
    pub fn index(
        &mut self,
        values: ArrayView3<f64>,
        mask: ArrayView3<bool>,
        edges: &BinEdges,
    ) -> Result<StratifiedIndex, Error> {
        let (n_slots, rows, cols) = values.dim();
        if [n_slots, rows, cols].iter().any(|&n| n > u32::MAX as usize) {
            return Err(Error::ResourceLimit {
                requested: n_slots.max(rows).max(cols),
                limit: u32::MAX as usize,
            });
        }
        let n_bins = edges.n_bins();
        let shape = (n_bins, rows, cols);

        self.reset_occupancy(shape);
        count_cell_population(values, mask, edges, &mut self.occupancy)?;
        let capacity = self.occupancy.iter().copied().max().unwrap_or(0) as usize;

        let requested = [capacity, n_bins, rows, cols]
            .iter()
            .try_fold(1usize, |acc, &n| acc.checked_mul(n))
            .unwrap_or(usize::MAX);
        if let Some(limit) = self.limit {
            if requested > limit {
                return Err(Error::ResourceLimit { requested, limit });
            }
        }
        debug!(
            "stratify {}x{} cells into {} bins, capacity {} ({} elements)",
            rows, cols, n_bins, capacity, requested
        );

        let mut index = StratifiedIndex::new(capacity, n_bins, rows, cols);
        #[cfg(debug_assertions)]
        let counted = self.occupancy.clone();
        self.occupancy.fill(0);
        let dropped = fill_cell_population(values, mask, edges, &mut index, &mut self.occupancy)?;
        // The fill cursor advances past dropped elements too, so it always
        // ends on the counted occupancy.
        #[cfg(debug_assertions)]
        debug_assert_eq!(self.occupancy, counted, "fill cursor diverged from count");
        if dropped > 0 {
            return Err(Error::CapacityOverflow { dropped, capacity });
        }
        Ok(index)
    }

    /// Stratify a ragged population by the value `key` extracts from each
    /// record.
    pub fn stratify<T, F>(
        &mut self,
        population: &MaskedArray<T, Ix3>,
        edges: &BinEdges,
        key: F,
    ) -> Result<MaskedArray<T, Ix4>, Error>
    where
        T: Clone,
        F: Fn(&T) -> f64,
    {
        let values = population.data().map(key);
        let index = self.index(values.view(), population.mask().view(), edges)?;
        gather(population, &index)
    }
}

/// Stratify a ragged `f64` population by its own values.
pub fn stratify(
    population: &MaskedArray<f64, Ix3>,
    edges: &BinEdges,
) -> Result<MaskedArray<f64, Ix4>, Error> {
    Stratifier::new().stratify(population, edges, |&v| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn grid_2x2() -> MaskedArray<f64, Ix3> {
        let data = Array3::from_shape_vec((1, 2, 2), vec![0.5, 1.5, 2.5, 3.5]).unwrap();
        MaskedArray::unmasked(data)
    }

    #[test]
    fn test_bin_edges_validation() {
        assert!(matches!(
            BinEdges::new(vec![1.0]),
            Err(Error::InvalidBinEdges(_))
        ));
        assert!(matches!(
            BinEdges::new(vec![0.0, 2.0, 1.0]),
            Err(Error::InvalidBinEdges(_))
        ));
        assert!(matches!(
            BinEdges::new(vec![0.0, f64::NAN]),
            Err(Error::InvalidBinEdges(_))
        ));
        assert!(BinEdges::new(vec![0.0, 1.0, 1.0, 2.0]).is_ok());
        assert!(BinEdges::uniform(0.0, 0.0, 3).is_err());
        assert_eq!(BinEdges::uniform(0.0, 0.5, 4).unwrap().n_bins(), 4);
    }

    #[test]
    fn test_bin_of_half_open() {
        let edges = BinEdges::new(vec![0.0, 1.0, 1.0, 2.0]).unwrap();
        assert_eq!(edges.bin_of(0.0), Some(0));
        assert_eq!(edges.bin_of(0.999), Some(0));
        // Empty bin [1, 1) is skipped
        assert_eq!(edges.bin_of(1.0), Some(2));
        assert_eq!(edges.bin_of(2.0), None);
        assert_eq!(edges.bin_of(-0.1), None);
        assert_eq!(edges.bin_of(f64::NAN), None);
    }

    #[test]
    fn test_count_one_per_cell() {
        let pop = grid_2x2();
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut occupancy = Array3::zeros((4, 2, 2));
        count_cell_population(
            pop.data().view(),
            pop.mask().view(),
            &edges,
            &mut occupancy,
        )
        .unwrap();

        let cells = [(0, 0), (0, 1), (1, 0), (1, 1)];
        for b in 0..4 {
            for (k, &(r, c)) in cells.iter().enumerate() {
                let expected = if k == b { 1 } else { 0 };
                assert_eq!(occupancy[[b, r, c]], expected, "bin {b} cell ({r},{c})");
            }
        }
        assert_eq!(occupancy.iter().copied().max(), Some(1));
    }

    #[test]
    fn test_count_rejects_wrong_occupancy_shape() {
        let pop = grid_2x2();
        let edges = BinEdges::new(vec![0.0, 4.0]).unwrap();
        let mut occupancy = Array3::zeros((2, 2, 2));
        let res = count_cell_population(pop.data().view(), pop.mask().view(), &edges, &mut occupancy);
        assert!(matches!(res, Err(Error::Shape(_))));
    }

    #[test]
    fn test_fill_records_source_order() {
        // One cell with values 0.2, 5.0 (out of range), 0.7, 1.4
        let data = Array3::from_shape_vec((4, 1, 1), vec![0.2, 5.0, 0.7, 1.4]).unwrap();
        let pop = MaskedArray::unmasked(data);
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0]).unwrap();

        let mut index = StratifiedIndex::new(2, 2, 1, 1);
        let mut cursor = Array3::zeros((2, 1, 1));
        let dropped = fill_cell_population(
            pop.data().view(),
            pop.mask().view(),
            &edges,
            &mut index,
            &mut cursor,
        )
        .unwrap();

        assert_eq!(dropped, 0);
        assert_eq!(index.source(0, 0, 0, 0), Some((0, 0, 0)));
        assert_eq!(index.source(1, 0, 0, 0), Some((2, 0, 0)));
        assert_eq!(index.source(0, 1, 0, 0), Some((3, 0, 0)));
        assert_eq!(index.source(1, 1, 0, 0), None);
        assert_eq!(cursor[[0, 0, 0]], 2);
        assert_eq!(cursor[[1, 0, 0]], 1);
    }

    #[test]
    fn test_fill_undersized_reports_drops() {
        let data = Array3::from_shape_vec((3, 1, 1), vec![0.1, 0.2, 0.3]).unwrap();
        let pop = MaskedArray::unmasked(data);
        let edges = BinEdges::new(vec![0.0, 1.0]).unwrap();

        let mut index = StratifiedIndex::new(1, 1, 1, 1);
        let mut cursor = Array3::zeros((1, 1, 1));
        let dropped = fill_cell_population(
            pop.data().view(),
            pop.mask().view(),
            &edges,
            &mut index,
            &mut cursor,
        )
        .unwrap();

        assert_eq!(dropped, 2);
        // Cursor still reflects the true count
        assert_eq!(cursor[[0, 0, 0]], 3);
        assert_eq!(index.source(0, 0, 0, 0), Some((0, 0, 0)));
    }

    #[test]
    fn test_stratify_example_grid() {
        let pop = grid_2x2();
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut s = Stratifier::new();
        let out = s.stratify(&pop, &edges, |&v| v).unwrap();

        assert_eq!(out.shape(), &[1, 4, 2, 2]);
        assert_eq!(out.count_valid(), 4);
        assert_eq!(out.get([0, 0, 0, 0]), Some(&0.5));
        assert_eq!(out.get([0, 1, 0, 1]), Some(&1.5));
        assert_eq!(out.get([0, 2, 1, 0]), Some(&2.5));
        assert_eq!(out.get([0, 3, 1, 1]), Some(&3.5));
        assert_eq!(out.get([0, 0, 1, 1]), None);
        assert_eq!(s.occupancy().sum(), 4);
    }

    #[test]
    fn test_gather_rejects_index_from_larger_population() {
        let deep = MaskedArray::unmasked(Array3::from_elem((3, 2, 2), 0.5));
        let edges = BinEdges::new(vec![0.0, 1.0]).unwrap();
        let mut s = Stratifier::new();
        let index = s
            .index(deep.data().view(), deep.mask().view(), &edges)
            .unwrap();
        assert_eq!(index.capacity(), 3);

        let shallow = MaskedArray::unmasked(Array3::from_elem((1, 2, 2), 0.5));
        assert!(matches!(gather(&shallow, &index), Err(Error::Shape(_))));
        assert_eq!(gather(&deep, &index).unwrap().count_valid(), 12);
    }

    #[test]
    fn test_stratify_fully_masked() {
        let pop = MaskedArray::fully_masked((3, 2, 5), 1.0);
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0]).unwrap();
        let out = stratify(&pop, &edges).unwrap();
        assert_eq!(out.shape(), &[0, 2, 2, 5]);
        assert_eq!(out.count_valid(), 0);
    }

    #[test]
    fn test_stratify_empty_slot_axis() {
        let pop: MaskedArray<f64, Ix3> = MaskedArray::fully_masked((0, 4, 4), 0.0);
        let edges = BinEdges::new(vec![0.0, 1.0]).unwrap();
        let out = stratify(&pop, &edges).unwrap();
        assert_eq!(out.shape(), &[0, 1, 4, 4]);
    }

    #[test]
    fn test_stratify_resource_limit() {
        let data = Array3::from_shape_vec((2, 1, 2), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let pop = MaskedArray::unmasked(data);
        let edges = BinEdges::new(vec![0.0, 1.0]).unwrap();

        // capacity 2 * 1 bin * 1 * 2 cells = 4 elements
        let mut s = Stratifier::with_limit(3);
        assert!(matches!(
            s.stratify(&pop, &edges, |&v| v),
            Err(Error::ResourceLimit {
                requested: 4,
                limit: 3
            })
        ));
        let mut s = Stratifier::with_limit(4);
        assert!(s.stratify(&pop, &edges, |&v| v).is_ok());
    }

    #[test]
    fn test_stratifier_reuses_across_shapes() {
        let edges = BinEdges::new(vec![0.0, 1.0, 2.0]).unwrap();
        let mut s = Stratifier::new();

        let a = MaskedArray::unmasked(Array3::from_elem((2, 3, 3), 0.5));
        let out = s.stratify(&a, &edges, |&v| v).unwrap();
        assert_eq!(out.shape(), &[2, 2, 3, 3]);

        let b = MaskedArray::unmasked(Array3::from_elem((1, 2, 1), 1.5));
        let out = s.stratify(&b, &edges, |&v| v).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 1]);
        assert_eq!(s.occupancy().dim(), (2, 2, 1));
        assert_eq!(s.occupancy()[[1, 1, 0]], 1);
    }
}
