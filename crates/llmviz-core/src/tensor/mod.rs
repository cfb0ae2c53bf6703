//! Strided tensor views over shared `f32` storage.
//!
//! A [`TensorView`] is shape and stride metadata over a flat buffer. Reshaping,
//! permuting and transposing only rewrite that metadata; the buffer is shared,
//! never reordered. [`TensorView::to_dense_vec`] walks the strides to produce a
//! contiguous row-major copy, which is what gets staged into device buffers.

mod index;

pub use index::IndexIter;

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{ArrayD, IxDyn};

use crate::error::{PipelineError, Result};

/// Flat numeric storage shared between views.
pub type SharedStorage = Arc<RwLock<Vec<f32>>>;

/// Canonical row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut s = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = s;
        s *= shape[i];
    }
    strides
}

/// Shape/stride view over a shared flat buffer.
#[derive(Clone)]
pub struct TensorView {
    shape: Vec<usize>,
    stride: Vec<usize>,
    storage: SharedStorage,
    is_contiguous: bool,
}

impl fmt::Debug for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("shape", &self.shape)
            .field("stride", &self.stride)
            .field("is_contiguous", &self.is_contiguous)
            .finish_non_exhaustive()
    }
}

impl TensorView {
    /// Creates a contiguous tensor owning `data`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::from_storage(shape, Arc::new(RwLock::new(data)), None)
    }

    /// Creates a zero-filled contiguous tensor.
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        let n = shape.iter().product();
        Self::new(shape, vec![0.0; n])
    }

    /// Creates a view over existing storage.
    ///
    /// With `stride == None` the canonical row-major strides are used.
    pub fn from_storage(
        shape: Vec<usize>,
        storage: SharedStorage,
        stride: Option<Vec<usize>>,
    ) -> Result<Self> {
        if shape.is_empty() {
            return Err(PipelineError::InvalidShape {
                shape,
                reason: "rank must be at least 1".to_string(),
            });
        }

        let buffer_len = read_lock(&storage).len();
        let total: usize = shape.iter().product();
        if total > buffer_len {
            return Err(PipelineError::InvalidShape {
                reason: format!("requires {total} elements, but buffer has {buffer_len}"),
                shape,
            });
        }

        let canonical = contiguous_strides(&shape);
        let stride = match stride {
            None => canonical.clone(),
            Some(stride) => {
                if stride.len() != shape.len() {
                    return Err(PipelineError::InvalidShape {
                        reason: format!(
                            "stride rank {} does not match shape rank {}",
                            stride.len(),
                            shape.len()
                        ),
                        shape,
                    });
                }
                if total > 0 {
                    let max_offset: usize = shape
                        .iter()
                        .zip(&stride)
                        .map(|(&dim, &s)| (dim - 1) * s)
                        .sum();
                    if max_offset >= buffer_len {
                        return Err(PipelineError::InvalidShape {
                            reason: format!(
                                "stride {stride:?} addresses offset {max_offset} past buffer of {buffer_len}"
                            ),
                            shape,
                        });
                    }
                }
                stride
            }
        };

        let is_contiguous = stride == canonical;
        Ok(Self {
            shape,
            stride,
            storage,
            is_contiguous,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn stride(&self) -> &[usize] {
        &self.stride
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        self.is_contiguous
    }

    /// True if both views address the same underlying buffer.
    pub fn shares_storage_with(&self, other: &TensorView) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Reinterprets a contiguous tensor with a new shape of equal size.
    pub fn view(&self, shape: &[usize]) -> Result<TensorView> {
        let size: usize = shape.iter().product();
        if size != self.num_elements() {
            return Err(PipelineError::Reshape {
                from: self.shape.clone(),
                to: shape.to_vec(),
                reason: format!(
                    "new size {size} does not match existing size {}",
                    self.num_elements()
                ),
            });
        }
        if !self.is_contiguous {
            return Err(PipelineError::Reshape {
                from: self.shape.clone(),
                to: shape.to_vec(),
                reason: "cannot view a non-contiguous tensor".to_string(),
            });
        }
        TensorView::from_storage(shape.to_vec(), self.storage.clone(), None)
    }

    /// Swaps two axes. Shares storage.
    pub fn transpose(&self, a: usize, b: usize) -> Result<TensorView> {
        let rank = self.rank();
        if a >= rank || b >= rank || a == b {
            return Err(PipelineError::Index {
                axes: vec![a, b],
                shape: self.shape.clone(),
            });
        }
        let mut shape = self.shape.clone();
        let mut stride = self.stride.clone();
        shape.swap(a, b);
        stride.swap(a, b);
        Ok(self.restrided(shape, stride))
    }

    /// Reorders axes so that axis `i` of the result is axis `axes[i]` of `self`.
    pub fn permute(&self, axes: &[usize]) -> Result<TensorView> {
        let rank = self.rank();
        let mut seen = vec![false; rank];
        let valid = axes.len() == rank
            && axes.iter().all(|&a| {
                if a >= rank || seen[a] {
                    false
                } else {
                    seen[a] = true;
                    true
                }
            });
        if !valid {
            return Err(PipelineError::Index {
                axes: axes.to_vec(),
                shape: self.shape.clone(),
            });
        }
        let shape = axes.iter().map(|&a| self.shape[a]).collect();
        let stride = axes.iter().map(|&a| self.stride[a]).collect();
        Ok(self.restrided(shape, stride))
    }

    fn restrided(&self, shape: Vec<usize>, stride: Vec<usize>) -> TensorView {
        let is_contiguous = stride == contiguous_strides(&shape);
        TensorView {
            shape,
            stride,
            storage: self.storage.clone(),
            is_contiguous,
        }
    }

    /// Maps a multi-index to a flat buffer offset.
    pub fn offset_of(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len()
            || index.iter().zip(&self.shape).any(|(&i, &dim)| i >= dim)
        {
            return Err(PipelineError::Bounds {
                index: index.to_vec(),
                shape: self.shape.clone(),
            });
        }
        Ok(index.iter().zip(&self.stride).map(|(&i, &s)| i * s).sum())
    }

    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let offset = self.offset_of(index)?;
        Ok(read_lock(&self.storage)[offset])
    }

    /// Writes through to the shared buffer; every view of it observes the change.
    pub fn set(&self, index: &[usize], value: f32) -> Result<()> {
        let offset = self.offset_of(index)?;
        write_lock(&self.storage)[offset] = value;
        Ok(())
    }

    /// Row-major index tuples over `shape`.
    pub fn index_iter(&self) -> IndexIter {
        IndexIter::new(&self.shape)
    }

    /// Materializes the view into a fresh row-major buffer.
    pub fn to_dense_vec(&self) -> Vec<f32> {
        let size = self.num_elements();
        let data = read_lock(&self.storage);
        if self.is_contiguous {
            return data[..size].to_vec();
        }

        let mut out = Vec::with_capacity(size);
        if size == 0 {
            return out;
        }

        // Odometer walk: bump the innermost axis, carry outwards, and keep the
        // running offset in step with the index.
        let rank = self.rank();
        let mut index = vec![0usize; rank];
        let mut offset = 0usize;
        loop {
            out.push(data[offset]);
            let mut axis = rank;
            loop {
                if axis == 0 {
                    return out;
                }
                axis -= 1;
                index[axis] += 1;
                offset += self.stride[axis];
                if index[axis] < self.shape[axis] {
                    break;
                }
                offset -= index[axis] * self.stride[axis];
                index[axis] = 0;
            }
        }
    }

    /// Returns `self` if contiguous, otherwise a dense copy with fresh storage.
    pub fn contiguous(&self) -> Result<TensorView> {
        if self.is_contiguous {
            return Ok(self.clone());
        }
        TensorView::new(self.shape.clone(), self.to_dense_vec())
    }

    /// Copies `source` into `self`. Both must be contiguous with equal shapes.
    pub fn copy_from(&self, source: &TensorView) -> Result<()> {
        if source.shape != self.shape {
            return Err(PipelineError::ShapeMismatch {
                tensor: "copy source".to_string(),
                expected: self.shape.clone(),
                actual: source.shape.clone(),
            });
        }
        if !source.is_contiguous || !self.is_contiguous {
            return Err(PipelineError::InvalidShape {
                shape: self.shape.clone(),
                reason: "copy requires contiguous source and target".to_string(),
            });
        }
        let values = source.to_dense_vec();
        let mut data = write_lock(&self.storage);
        data[..values.len()].copy_from_slice(&values);
        Ok(())
    }

    /// Dense `ndarray` copy, used by the CPU reference path.
    pub fn to_ndarray(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_dense_vec()).map_err(|e| {
            PipelineError::InvalidShape {
                shape: self.shape.clone(),
                reason: e.to_string(),
            }
        })
    }
}

fn read_lock(storage: &SharedStorage) -> RwLockReadGuard<'_, Vec<f32>> {
    storage.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(storage: &SharedStorage) -> RwLockWriteGuard<'_, Vec<f32>> {
    storage.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests;
