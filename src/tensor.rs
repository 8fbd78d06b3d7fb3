//! Dense row-major `f32` tensors.
//!
//! Covers exactly the operations the converter needs: narrowing a flat
//! tensor, concatenating along an axis, reshaping, element-wise averaging,
//! and bitwise equality checks for replication validation.

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// A dense n-dimensional `f32` tensor in row-major layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor from raw data and a shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        ensure!(
            data.len() == numel,
            "data of {} elements does not fill shape {:?}",
            data.len(),
            shape
        );
        Ok(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Create a zero-filled tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Contiguous sub-range of a 1-D tensor.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Tensor> {
        ensure!(
            self.shape.len() == 1,
            "narrow expects a flat tensor, got shape {:?}",
            self.shape
        );
        ensure!(
            start + len <= self.data.len(),
            "narrow {}+{} out of bounds for {} elements",
            start,
            len,
            self.data.len()
        );
        Ok(Tensor {
            shape: vec![len],
            data: self.data[start..start + len].to_vec(),
        })
    }

    /// Same data viewed under a new shape with the same element count.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let numel: usize = shape.iter().product();
        ensure!(
            numel == self.data.len(),
            "cannot reshape {} elements to {:?}",
            self.data.len(),
            shape
        );
        Ok(Tensor {
            shape: shape.to_vec(),
            data: self.data.clone(),
        })
    }

    /// Concatenate tensors along `dim`.
    ///
    /// All inputs must have identical shapes except along `dim`.
    pub fn cat(parts: &[Tensor], dim: usize) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            bail!("cannot concatenate zero tensors");
        };
        ensure!(
            dim < first.shape.len(),
            "concat dim {} out of range for shape {:?}",
            dim,
            first.shape
        );
        for part in &parts[1..] {
            ensure!(
                part.shape.len() == first.shape.len()
                    && part
                        .shape
                        .iter()
                        .zip(&first.shape)
                        .enumerate()
                        .all(|(d, (a, b))| d == dim || a == b),
                "shape {:?} does not concatenate with {:?} along dim {}",
                part.shape,
                first.shape,
                dim
            );
        }

        let mut out_shape = first.shape.clone();
        out_shape[dim] = parts.iter().map(|p| p.shape[dim]).sum();

        // Row-major: the elements of one outer index form a contiguous block
        // of prod(shape[dim..]) elements per part.
        let outer: usize = first.shape[..dim].iter().product();
        let numel: usize = out_shape.iter().product();
        let mut data = Vec::with_capacity(numel);
        for o in 0..outer {
            for part in parts {
                let block: usize = part.shape[dim..].iter().product();
                data.extend_from_slice(&part.data[o * block..(o + 1) * block]);
            }
        }
        Ok(Tensor {
            shape: out_shape,
            data,
        })
    }

    /// Element-wise mean across tensors of identical shape.
    pub fn mean(parts: &[Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            bail!("cannot average zero tensors");
        };
        for part in &parts[1..] {
            ensure!(
                part.shape == first.shape,
                "shape {:?} does not average with {:?}",
                part.shape,
                first.shape
            );
        }
        let scale = 1.0 / parts.len() as f32;
        let data = (0..first.data.len())
            .map(|i| parts.iter().map(|p| p.data[i]).sum::<f32>() * scale)
            .collect();
        Ok(Tensor {
            shape: first.shape.clone(),
            data,
        })
    }

    /// Bitwise equality: shapes match and every element has identical bits.
    ///
    /// Unlike `==` this treats NaN as equal to itself, which is what
    /// replication checks need.
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// The last index along dim 0, as a tensor of shape `shape[1..]`.
    pub fn last_row(&self) -> Result<Tensor> {
        ensure!(
            self.shape.len() >= 2 && self.shape[0] > 0,
            "last_row expects at least 2 dims with a non-empty dim 0, got {:?}",
            self.shape
        );
        let inner: usize = self.shape[1..].iter().product();
        Ok(Tensor {
            shape: self.shape[1..].to_vec(),
            data: self.data[self.data.len() - inner..].to_vec(),
        })
    }
}
