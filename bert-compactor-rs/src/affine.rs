//! Plain affine transforms `y = Wx + b`.
//!
//! `Affine` is the currency of the compaction engine: every fused query,
//! residual or projection is one of these. Operations never mutate; each
//! returns a new transform.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::error::{CompactError, CompactResult};
use crate::params::{join, NamedTensors, TensorMap};

/// Affine transform with weight `[out_features, in_features]` and optional bias `[out_features]`.
#[derive(Debug, Clone)]
pub struct Affine {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Affine {
    /// Create from existing tensors.
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not 2D or the bias length does not
    /// match the output width.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> CompactResult<Self> {
        let (out_features, _) = weight.dims2()?;
        if let Some(b) = &bias {
            let len = b.dims1()?;
            if len != out_features {
                return Err(CompactError::dimension_mismatch("affine bias", out_features, len));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Load (or initialize) a biased transform, following `candle_nn::linear`.
    pub fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let linear = candle_nn::linear(in_features, out_features, vb)?;
        Ok(Self {
            weight: linear.weight().clone(),
            bias: linear.bias().cloned(),
        })
    }

    /// Identity transform over `size` features, without bias.
    pub fn identity(size: usize, dtype: DType, device: &Device) -> CompactResult<Self> {
        Ok(Self {
            weight: Tensor::eye(size, dtype, device)?,
            bias: None,
        })
    }

    /// 0/1 selection matrix picking `indices` out of `width` features.
    ///
    /// Merging with this is equivalent to [`Affine::select_rows`]; it exists
    /// to check that equivalence and is never used on the fusion path.
    pub fn selection(
        indices: &[u32],
        width: usize,
        dtype: DType,
        device: &Device,
    ) -> CompactResult<Self> {
        let mut data = vec![0.0f64; indices.len() * width];
        for (row, &index) in indices.iter().enumerate() {
            let index = index as usize;
            if index >= width {
                return Err(CompactError::index_out_of_range("selection", index, width));
            }
            data[row * width + index] = 1.0;
        }
        let weight = Tensor::from_vec(data, (indices.len(), width), device)?.to_dtype(dtype)?;
        Ok(Self { weight, bias: None })
    }

    /// Input dimension.
    pub fn in_features(&self) -> usize {
        self.weight.dims().get(1).copied().unwrap_or(0)
    }

    /// Output dimension.
    pub fn out_features(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }

    /// Weight tensor `[out, in]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias tensor `[out]`, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Element type of the weight.
    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }

    /// Device of the weight.
    pub fn device(&self) -> &Device {
        self.weight.device()
    }

    /// Bias, or zeros when the transform has none.
    pub fn bias_or_zeros(&self) -> candle_core::Result<Tensor> {
        match &self.bias {
            Some(b) => Ok(b.clone()),
            None => Tensor::zeros(self.out_features(), self.dtype(), self.device()),
        }
    }

    /// Same transform with a zero bias materialized when none exists.
    pub fn with_explicit_bias(&self) -> CompactResult<Self> {
        Ok(Self {
            weight: self.weight.clone(),
            bias: Some(self.bias_or_zeros()?),
        })
    }

    /// Same transform cut loose from any autograd graph.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            weight: self.weight.detach(),
            bias: self.bias.as_ref().map(Tensor::detach),
        }
    }

    /// Keep only the output rows at `indices` (and matching bias entries).
    pub fn select_rows(&self, indices: &[u32]) -> CompactResult<Self> {
        let index = index_tensor(indices, self.out_features(), "row selection", self.device())?;
        let weight = self.weight.index_select(&index, 0)?;
        let bias = match &self.bias {
            Some(b) => Some(b.index_select(&index, 0)?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    /// Keep only the input columns at `indices`.
    pub fn select_columns(&self, indices: &[u32]) -> CompactResult<Self> {
        let index = index_tensor(indices, self.in_features(), "column selection", self.device())?;
        let weight = self.weight.index_select(&index, 1)?;
        Ok(Self {
            weight,
            bias: self.bias.clone(),
        })
    }

    /// Multiply output row `i` (and bias entry `i`) by `values[i]`.
    pub fn scale_rows(&self, values: &[f64]) -> CompactResult<Self> {
        if values.len() != self.out_features() {
            return Err(CompactError::dimension_mismatch(
                "row scaling",
                self.out_features(),
                values.len(),
            ));
        }
        let scale = value_tensor(values, self.dtype(), self.device())?;
        let weight = self.weight.broadcast_mul(&scale.unsqueeze(1)?)?;
        let bias = match &self.bias {
            Some(b) => Some(b.mul(&scale)?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    /// Multiply input column `j` by `values[j]`.
    pub fn scale_columns(&self, values: &[f64]) -> CompactResult<Self> {
        if values.len() != self.in_features() {
            return Err(CompactError::dimension_mismatch(
                "column scaling",
                self.in_features(),
                values.len(),
            ));
        }
        let scale = value_tensor(values, self.dtype(), self.device())?;
        let weight = self.weight.broadcast_mul(&scale.unsqueeze(0)?)?;
        Ok(Self {
            weight,
            bias: self.bias.clone(),
        })
    }

    /// Multiply the whole transform, bias included, by `factor`.
    pub fn scale(&self, factor: f64) -> CompactResult<Self> {
        let weight = self.weight.affine(factor, 0.0)?;
        let bias = match &self.bias {
            Some(b) => Some(b.affine(factor, 0.0)?),
            None => None,
        };
        Ok(Self { weight, bias })
    }

    /// Add a constant vector to the output.
    pub fn with_bias_offset(&self, offset: &Tensor) -> CompactResult<Self> {
        let len = offset.dims1()?;
        if len != self.out_features() {
            return Err(CompactError::dimension_mismatch(
                "bias offset",
                self.out_features(),
                len,
            ));
        }
        let bias = match &self.bias {
            Some(b) => b.add(offset)?,
            None => offset.clone(),
        };
        Ok(Self {
            weight: self.weight.clone(),
            bias: Some(bias),
        })
    }

    /// View as a `candle_nn::Linear`.
    pub fn to_linear(&self) -> candle_nn::Linear {
        candle_nn::Linear::new(self.weight.clone(), self.bias.clone())
    }
}

impl Module for Affine {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.to_linear().forward(x)
    }
}

impl NamedTensors for Affine {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        out.insert(join(prefix, "weight"), self.weight.clone());
        if let Some(b) = &self.bias {
            out.insert(join(prefix, "bias"), b.clone());
        }
    }
}

/// Validated `u32` index tensor over a universe of `size` features.
pub(crate) fn index_tensor(
    indices: &[u32],
    size: usize,
    context: &str,
    device: &Device,
) -> CompactResult<Tensor> {
    if indices.is_empty() {
        return Err(CompactError::empty_mask(context));
    }
    if let Some(&bad) = indices.iter().find(|&&i| i as usize >= size) {
        return Err(CompactError::index_out_of_range(context, bad as usize, size));
    }
    Ok(Tensor::from_slice(indices, indices.len(), device)?)
}

/// Host values as a 1D tensor of the given dtype.
pub(crate) fn value_tensor(values: &[f64], dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
    Tensor::from_slice(values, values.len(), device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(out: usize, inp: usize) -> Affine {
        let device = Device::Cpu;
        let weight = Tensor::randn(0.0f64, 1.0, (out, inp), &device).unwrap();
        let bias = Tensor::randn(0.0f64, 1.0, out, &device).unwrap();
        Affine::new(weight, Some(bias)).unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        let a: Vec<f64> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f64> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a.len(), b.len());
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn test_new_validates_bias() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F64, &device).unwrap();
        let bias = Tensor::zeros(4, DType::F64, &device).unwrap();
        assert!(Affine::new(weight, Some(bias)).is_err());
    }

    #[test]
    fn test_forward_shapes() {
        let affine = sample(3, 5);
        assert_eq!(affine.in_features(), 5);
        assert_eq!(affine.out_features(), 3);

        let x = Tensor::randn(0.0f64, 1.0, (2, 7, 5), &Device::Cpu).unwrap();
        let y = affine.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 7, 3]);
    }

    #[test]
    fn test_select_rows_matches_output_rows() {
        let affine = sample(6, 4);
        let x = Tensor::randn(0.0f64, 1.0, (5, 4), &Device::Cpu).unwrap();
        let indices = [1u32, 3, 4];

        let full = affine.forward(&x).unwrap();
        let index = Tensor::new(&indices, &Device::Cpu).unwrap();
        let expected = full.index_select(&index, 1).unwrap();

        let selected = affine.select_rows(&indices).unwrap().forward(&x).unwrap();
        assert!(max_diff(&selected, &expected) < 1e-12);
    }

    #[test]
    fn test_select_columns_matches_zero_padded_input() {
        let affine = sample(3, 6);
        let device = Device::Cpu;
        let indices = [0u32, 2, 5];
        let narrow = Tensor::randn(0.0f64, 1.0, (4, 3), &device).unwrap();

        // Scatter the narrow input into a zero-padded wide one.
        let rows: Vec<Vec<f64>> = narrow.to_vec2().unwrap();
        let mut wide = vec![0.0f64; 4 * 6];
        for (r, row) in rows.iter().enumerate() {
            for (k, &i) in indices.iter().enumerate() {
                wide[r * 6 + i as usize] = row[k];
            }
        }
        let wide = Tensor::from_vec(wide, (4, 6), &device).unwrap();

        let expected = affine.forward(&wide).unwrap();
        let got = affine.select_columns(&indices).unwrap().forward(&narrow).unwrap();
        assert!(max_diff(&got, &expected) < 1e-12);
    }

    #[test]
    fn test_selection_out_of_range() {
        let err = Affine::selection(&[0, 9], 4, DType::F64, &Device::Cpu).unwrap_err();
        assert!(matches!(err, CompactError::IndexOutOfRange { index: 9, .. }));

        let affine = sample(4, 4);
        assert!(affine.select_rows(&[4]).is_err());
        assert!(matches!(
            affine.select_rows(&[]),
            Err(CompactError::EmptyMask(_))
        ));
    }

    #[test]
    fn test_scale_rows_scales_bias() {
        let device = Device::Cpu;
        let weight = Tensor::ones((2, 3), DType::F64, &device).unwrap();
        let bias = Tensor::new(&[1.0f64, 1.0], &device).unwrap();
        let affine = Affine::new(weight, Some(bias)).unwrap();

        let scaled = affine.scale_rows(&[2.0, 0.5]).unwrap();
        let w: Vec<Vec<f64>> = scaled.weight().to_vec2().unwrap();
        let b: Vec<f64> = scaled.bias().unwrap().to_vec1().unwrap();
        assert_eq!(w[0], vec![2.0, 2.0, 2.0]);
        assert_eq!(w[1], vec![0.5, 0.5, 0.5]);
        assert_eq!(b, vec![2.0, 0.5]);

        assert!(affine.scale_rows(&[1.0]).is_err());
    }

    #[test]
    fn test_scale_columns_keeps_bias() {
        let device = Device::Cpu;
        let weight = Tensor::ones((2, 2), DType::F64, &device).unwrap();
        let bias = Tensor::new(&[3.0f64, 4.0], &device).unwrap();
        let affine = Affine::new(weight, Some(bias)).unwrap();

        let scaled = affine.scale_columns(&[0.0, 2.0]).unwrap();
        let w: Vec<Vec<f64>> = scaled.weight().to_vec2().unwrap();
        let b: Vec<f64> = scaled.bias().unwrap().to_vec1().unwrap();
        assert_eq!(w[0], vec![0.0, 2.0]);
        assert_eq!(b, vec![3.0, 4.0]);
    }

    #[test]
    fn test_bias_offset() {
        let device = Device::Cpu;
        let affine = Affine::identity(2, DType::F64, &device).unwrap();
        assert!(affine.bias().is_none());

        let offset = Tensor::new(&[1.0f64, -1.0], &device).unwrap();
        let shifted = affine.with_bias_offset(&offset).unwrap();
        let b: Vec<f64> = shifted.bias().unwrap().to_vec1().unwrap();
        assert_eq!(b, vec![1.0, -1.0]);

        let twice = shifted.with_bias_offset(&offset).unwrap();
        let b: Vec<f64> = twice.bias().unwrap().to_vec1().unwrap();
        assert_eq!(b, vec![2.0, -2.0]);
    }

    #[test]
    fn test_named_tensors() {
        let affine = sample(2, 2);
        let map = affine.named_tensors("pooler.dense");
        assert!(map.contains_key("pooler.dense.weight"));
        assert!(map.contains_key("pooler.dense.bias"));
    }
}
