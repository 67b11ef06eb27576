// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Dense masked arrays for ragged per-cell data.
//!
//! A ragged population (a variable number of points per cell) is stored as a
//! dense `ndarray` buffer padded to the largest cell, plus a validity mask of
//! the same shape. A mask bit of `true` marks an absent entry; the value
//! underneath it is unspecified and must not be read.
//!
//! ```text
//!   data  (slot, row, col)        mask (slot, row, col)
//!   ┌─────┬─────┐               ┌─────┬─────┐
//!   │ 1.2 │ 0.4 │  slot 0       │  .  │  .  │
//!   ├─────┼─────┤               ├─────┼─────┤
//!   │ 3.1 │  ?  │  slot 1       │  .  │  X  │
//!   └─────┴─────┘               └─────┴─────┘
//! ```

use crate::lidar::{incompatible_shape, Error};
use ndarray::{Array, Axis, Dimension, NdIndex, RemoveAxis, ShapeBuilder, Zip};

/// Dense array plus a same-shaped mask, `true` where the entry is absent.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedArray<T, D: Dimension> {
    data: Array<T, D>,
    mask: Array<bool, D>,
}

impl<T, D: Dimension> MaskedArray<T, D> {
    /// Pair a data buffer with its mask. Both must have the same shape.
    pub fn from_parts(data: Array<T, D>, mask: Array<bool, D>) -> Result<Self, Error> {
        if data.shape() != mask.shape() {
            return Err(incompatible_shape());
        }
        Ok(Self { data, mask })
    }

    /// Pair buffers the caller built with identical shapes.
    pub(crate) fn from_dense(data: Array<T, D>, mask: Array<bool, D>) -> Self {
        debug_assert_eq!(data.shape(), mask.shape());
        Self { data, mask }
    }

    /// Wrap a fully valid array.
    pub fn unmasked(data: Array<T, D>) -> Self {
        let mask = Array::from_elem(data.raw_dim(), false);
        Self { data, mask }
    }

    /// Array of the given shape where every entry is absent.
    pub fn fully_masked<Sh>(shape: Sh, fill: T) -> Self
    where
        T: Clone,
        Sh: ShapeBuilder<Dim = D> + Clone,
    {
        Self {
            data: Array::from_elem(shape.clone(), fill),
            mask: Array::from_elem(shape, true),
        }
    }

    pub fn data(&self) -> &Array<T, D> {
        &self.data
    }

    pub fn mask(&self) -> &Array<bool, D> {
        &self.mask
    }

    pub fn into_parts(self) -> (Array<T, D>, Array<bool, D>) {
        (self.data, self.mask)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn raw_dim(&self) -> D {
        self.data.raw_dim()
    }

    /// Total number of entries including absent ones.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of entries that are present.
    pub fn count_valid(&self) -> usize {
        self.mask.iter().filter(|&&m| !m).count()
    }

    /// Entry at `index`, or `None` when out of bounds or masked.
    pub fn get<I>(&self, index: I) -> Option<&T>
    where
        I: NdIndex<D> + Copy,
    {
        match self.mask.get(index) {
            Some(false) => self.data.get(index),
            _ => None,
        }
    }

    /// Present entries in logical (row-major) order.
    pub fn compressed(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.data
            .iter()
            .zip(self.mask.iter())
            .filter(|(_, &m)| !m)
            .map(|(v, _)| v.clone())
            .collect()
    }

    /// Project every entry through `f`, keeping the mask.
    ///
    /// This is how a single field (e.g. height) is pulled out of a ragged
    /// array of point records.
    pub fn map<U, F>(&self, f: F) -> MaskedArray<U, D>
    where
        F: FnMut(&T) -> U,
    {
        MaskedArray {
            data: self.data.map(f),
            mask: self.mask.clone(),
        }
    }
}

impl<D: RemoveAxis> MaskedArray<f64, D> {
    /// Sum of the present entries along `axis`. Lanes with no present entry
    /// are masked in the result.
    pub fn sum_axis(&self, axis: Axis) -> MaskedArray<f64, D::Smaller> {
        self.reduce_axis(axis, |sum, _| sum)
    }

    /// Mean of the present entries along `axis`. Absent entries never
    /// contribute; lanes with no present entry are masked in the result.
    pub fn mean_axis(&self, axis: Axis) -> MaskedArray<f64, D::Smaller> {
        self.reduce_axis(axis, |sum, n| sum / n as f64)
    }

    /// Number of present entries along `axis`.
    pub fn count_axis(&self, axis: Axis) -> Array<usize, D::Smaller> {
        self.mask
            .map_axis(axis, |lane| lane.iter().filter(|&&m| !m).count())
    }

    fn reduce_axis<F>(&self, axis: Axis, finish: F) -> MaskedArray<f64, D::Smaller>
    where
        F: Fn(f64, usize) -> f64,
    {
        let reduced = Zip::from(self.data.lanes(axis))
            .and(self.mask.lanes(axis))
            .map_collect(|values, mask| {
                let mut sum = 0.0;
                let mut n = 0usize;
                for (&v, &m) in values.iter().zip(mask.iter()) {
                    if !m {
                        sum += v;
                        n += 1;
                    }
                }
                if n == 0 {
                    (0.0, true)
                } else {
                    (finish(sum, n), false)
                }
            });
        MaskedArray {
            data: reduced.map(|&(v, _)| v),
            mask: reduced.map(|&(_, m)| m),
        }
    }
}
