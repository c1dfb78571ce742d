/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

/// The type of error for rank slice operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SliceError {
    #[error("invalid dims: expected {expected}, got {got}")]
    InvalidDims { expected: usize, got: usize },

    #[error("nonrectangular shape")]
    NonrectangularShape,

    #[error("stride {stride} must be larger than size of previous space {space}")]
    StrideTooSmall { stride: usize, space: usize },

    #[error("index {index} out of range {total}")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("rank {rank} not in slice")]
    RankNotInSlice { rank: usize },

    #[error("dimension {dim} out of range for {ndims}-dimensional slice")]
    DimensionOutOfRange { dim: usize, ndims: usize },
}

/// A strided view of global ranks. Given an offset, the size of each
/// dimension and the stride of each dimension, a `RankSlice` maps
/// coordinates to ranks:
///
/// ```text
///     rank = offset + Σ coord[k] * strides[k]
/// ```
///
/// The job is laid out as a row-major `[groups, inner]` slice. Fixing
/// the group coordinate yields a contiguous model-parallel block;
/// fixing the inner coordinate yields the strided set of ranks that
/// hold the same shard in every group.
///
/// ```
/// # use megatron_topology::RankSlice;
/// let job = RankSlice::new_row_major([2, 2]);
/// assert!(job.at(0, 1).unwrap().iter().eq([2, 3]));
/// assert!(job.at(1, 1).unwrap().iter().eq([1, 3]));
/// ```
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Hash, Debug)]
pub struct RankSlice {
    offset: usize,
    sizes: Vec<usize>,
    strides: Vec<usize>,
}

impl RankSlice {
    /// Create a new slice, validating that sizes and strides have the
    /// same number of dimensions, that the layout is rectangular and
    /// that strides do not overlap.
    pub fn new(offset: usize, sizes: Vec<usize>, strides: Vec<usize>) -> Result<Self, SliceError> {
        if sizes.len() != strides.len() {
            return Err(SliceError::InvalidDims {
                expected: sizes.len(),
                got: strides.len(),
            });
        }
        let mut combined: Vec<(usize, usize)> =
            strides.iter().cloned().zip(sizes.iter().cloned()).collect();
        combined.sort();

        let mut prev_stride: Option<usize> = None;
        let mut total: usize = 1;
        for (stride, size) in combined {
            if let Some(prev_stride) = prev_stride {
                if prev_stride == 0 || stride % prev_stride != 0 {
                    return Err(SliceError::NonrectangularShape);
                }
            }
            // Single element dimensions never advance, so their stride is free.
            if size > 1 && total > stride {
                return Err(SliceError::StrideTooSmall {
                    stride,
                    space: total,
                });
            }
            total = total.max(stride * size);
            prev_stride = Some(stride);
        }

        Ok(Self {
            offset,
            sizes,
            strides,
        })
    }

    /// A dense slice over `0..product(sizes)` in row-major order.
    pub fn new_row_major(sizes: impl Into<Vec<usize>>) -> Self {
        let sizes = sizes.into();
        let mut strides = sizes.clone();
        let _ = strides.iter_mut().rev().fold(1, |acc, n| {
            let next = *n * acc;
            *n = acc;
            next
        });
        Self {
            offset: 0,
            sizes,
            strides,
        }
    }

    pub fn num_dim(&self) -> usize {
        self.sizes.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Fix coordinate `index` along `dim`, dropping that dimension. The
    /// fixed coordinate's contribution is folded into the offset.
    pub fn at(&self, dim: usize, index: usize) -> Result<Self, SliceError> {
        if dim >= self.sizes.len() {
            return Err(SliceError::DimensionOutOfRange {
                dim,
                ndims: self.num_dim(),
            });
        }
        if index >= self.sizes[dim] {
            return Err(SliceError::IndexOutOfRange {
                index,
                total: self.sizes[dim],
            });
        }
        let mut sizes = self.sizes.clone();
        let mut strides = self.strides.clone();
        sizes.remove(dim);
        let stride = strides.remove(dim);
        Ok(Self {
            offset: self.offset + index * stride,
            sizes,
            strides,
        })
    }

    /// The rank at the provided coordinates.
    pub fn location(&self, coord: &[usize]) -> Result<usize, SliceError> {
        if coord.len() != self.sizes.len() {
            return Err(SliceError::InvalidDims {
                expected: self.sizes.len(),
                got: coord.len(),
            });
        }
        for (&index, &total) in coord.iter().zip(&self.sizes) {
            if index >= total {
                return Err(SliceError::IndexOutOfRange { index, total });
            }
        }
        Ok(self.offset
            + coord
                .iter()
                .zip(&self.strides)
                .map(|(pos, stride)| pos * stride)
                .sum::<usize>())
    }

    /// The coordinates of `rank` in this slice.
    pub fn coordinates(&self, rank: usize) -> Result<Vec<usize>, SliceError> {
        let mut pos = rank
            .checked_sub(self.offset)
            .ok_or(SliceError::RankNotInSlice { rank })?;
        let mut result = vec![0; self.sizes.len()];
        let mut sorted_info: Vec<_> = self
            .strides
            .iter()
            .zip(self.sizes.iter().enumerate())
            .collect();
        sorted_info.sort_by_key(|&(stride, _)| *stride);
        for &(&stride, (i, &size)) in sorted_info.iter().rev() {
            let (index, new_pos) = if size > 1 {
                (pos / stride, pos % stride)
            } else {
                (0, pos)
            };
            if index >= size {
                return Err(SliceError::RankNotInSlice { rank });
            }
            result[i] = index;
            pos = new_pos;
        }
        if pos != 0 {
            return Err(SliceError::RankNotInSlice { rank });
        }
        Ok(result)
    }

    pub fn len(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ranks in row-major coordinate order.
    pub fn iter(&self) -> RankIter<'_> {
        RankIter {
            slice: self,
            index: 0,
        }
    }
}

/// Iterator over the ranks of a [`RankSlice`].
pub struct RankIter<'a> {
    slice: &'a RankSlice,
    index: usize,
}

impl Iterator for RankIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.slice.len() {
            return None;
        }
        let mut rest = self.index;
        let mut rank = self.slice.offset;
        for (size, stride) in self.slice.sizes.iter().zip(&self.slice.strides).rev() {
            rank += (rest % size) * stride;
            rest /= size;
        }
        self.index += 1;
        Some(rank)
    }
}
