//! Layer normalization using basic tensor operations.
//!
//! `ManualLayerNorm` is the plain normalization used by the packed encoder.
//! `NormWithCompactor` is the gated variant: a layer norm with its own
//! feature mask plus compactor probes on both the incoming and the
//! normalized stream.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::affine::{index_tensor, Affine};
use crate::compactor::{Compactor, Side};
use crate::error::CompactResult;
use crate::mask::{FeatureMask, MaskSelection};
use crate::params::{join, NamedTensors, TensorMap};

/// LayerNorm implemented with basic tensor ops.
#[derive(Debug, Clone)]
pub struct ManualLayerNorm {
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
    normalized_shape: usize,
}

impl ManualLayerNorm {
    /// Create a new ManualLayerNorm.
    pub fn new(weight: Tensor, bias: Option<Tensor>, eps: f64) -> Self {
        let normalized_shape = weight.dims().first().copied().unwrap_or(0);
        Self {
            weight,
            bias,
            eps,
            normalized_shape,
        }
    }

    /// Get the normalized shape.
    pub fn normalized_shape(&self) -> usize {
        self.normalized_shape
    }

    /// Epsilon added to the variance.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Scale vector.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Shift vector, if any.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Restrict scale and shift to the features at `indices`.
    pub fn extract(&self, indices: &[u32]) -> CompactResult<Self> {
        let index = index_tensor(
            indices,
            self.normalized_shape,
            "layer norm extraction",
            self.weight.device(),
        )?;
        let weight = self.weight.detach().index_select(&index, 0)?;
        let bias = match &self.bias {
            Some(b) => Some(b.detach().index_select(&index, 0)?),
            None => None,
        };
        Ok(Self::new(weight, bias, self.eps))
    }

    /// Layer norm whose statistics only see the features where
    /// `indicator` is one. Dropped features come out as zero.
    pub fn forward_masked(&self, x: &Tensor, indicator: &Tensor) -> Result<Tensor> {
        let kept = indicator
            .sum_all()?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?
            .max(1.0);

        let x = x.broadcast_mul(indicator)?;
        let mean = (x.sum_keepdim(D::Minus1)? / kept)?;
        let x_centered = x.broadcast_sub(&mean)?.broadcast_mul(indicator)?;
        let var = (x_centered.sqr()?.sum_keepdim(D::Minus1)? / kept)?;
        let std = (var + self.eps)?.sqrt()?;
        let normalized = x_centered.broadcast_div(&std)?;

        let scaled = normalized.broadcast_mul(&self.weight)?;
        let shifted = match &self.bias {
            Some(bias) => scaled.broadcast_add(bias)?,
            None => scaled,
        };
        shifted.broadcast_mul(indicator)
    }

    /// Forward pass using basic tensor operations.
    ///
    /// Layer norm: y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
    fn forward_impl(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;

        let x_centered = x.broadcast_sub(&mean)?;
        let var = x_centered.sqr()?.mean_keepdim(D::Minus1)?;

        let std = (var + self.eps)?.sqrt()?;
        let normalized = x_centered.broadcast_div(&std)?;

        let scaled = normalized.broadcast_mul(&self.weight)?;
        match &self.bias {
            Some(bias) => scaled.broadcast_add(bias),
            None => Ok(scaled),
        }
    }
}

impl Module for ManualLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward_impl(x)
    }
}

impl NamedTensors for ManualLayerNorm {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        out.insert(join(prefix, "weight"), self.weight.clone());
        if let Some(b) = &self.bias {
            out.insert(join(prefix, "bias"), b.clone());
        }
    }
}

/// Create a manual layer norm layer.
pub fn manual_layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<ManualLayerNorm> {
    let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
    Ok(ManualLayerNorm::new(weight, Some(bias), eps))
}

/// Manual softmax over last dimension using basic tensor ops.
///
/// softmax(x) = exp(x - max(x)) / sum(exp(x - max(x)))
pub fn manual_softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp_x = x.broadcast_sub(&max)?.exp()?;
    let sum_exp = exp_x.sum_keepdim(D::Minus1)?;
    exp_x.broadcast_div(&sum_exp)
}

/// Gated layer norm with compactor probes on both sides.
///
/// Forward: `out_comp(g ⊙ LN_kept(g ⊙ in_comp(x)))`, where `g` is the
/// effective gate of the mask.
#[derive(Debug, Clone)]
pub struct NormWithCompactor {
    norm: ManualLayerNorm,
    mask: FeatureMask,
    in_comp: Compactor,
    out_comp: Compactor,
}

impl NormWithCompactor {
    /// Assemble from parts.
    pub fn new(norm: ManualLayerNorm, mask: FeatureMask, in_comp: Compactor, out_comp: Compactor) -> Self {
        Self {
            norm,
            mask,
            in_comp,
            out_comp,
        }
    }

    /// Load a gated norm over `size` features under `vb`.
    pub fn load(size: usize, eps: f64, threshold: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm: manual_layer_norm(size, eps, vb.clone())?,
            mask: FeatureMask::load(size, threshold, vb.pp("mask"))?,
            in_comp: Compactor::load(size, vb.pp("in_comp"))?,
            out_comp: Compactor::load(size, vb.pp("out_comp"))?,
        })
    }

    /// Underlying full-width norm.
    pub fn norm(&self) -> &ManualLayerNorm {
        &self.norm
    }

    /// Hidden-feature mask.
    pub fn mask(&self) -> &FeatureMask {
        &self.mask
    }

    /// Probe on the incoming stream.
    pub fn in_comp(&self) -> &Compactor {
        &self.in_comp
    }

    /// Probe on the normalized stream.
    pub fn out_comp(&self) -> &Compactor {
        &self.out_comp
    }

    /// Plain norm over the kept features.
    pub fn extract(&self, indices: &[u32]) -> CompactResult<ManualLayerNorm> {
        self.norm.extract(indices)
    }

    /// Full-width stream → gated kept features, ready for the reduced norm.
    pub fn entry(&self, kept: &MaskSelection) -> CompactResult<Affine> {
        self.in_comp.extract(Side::Output, &kept.indices, Some(&kept.values))
    }

    /// Kept normalized features → full-width stream seen by consumers.
    pub fn lift(&self, kept: &MaskSelection) -> CompactResult<Affine> {
        self.out_comp.extract(Side::Input, &kept.indices, Some(&kept.values))
    }
}

impl Module for NormWithCompactor {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.mask.effective()?;
        let indicator = self.mask.indicator()?;
        let z = self.in_comp.forward(x)?.broadcast_mul(&gate)?;
        let n = self.norm.forward_masked(&z, &indicator)?;
        self.out_comp.forward(&n.broadcast_mul(&gate)?)
    }
}

impl NamedTensors for NormWithCompactor {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.norm.collect_tensors(prefix, out);
        self.mask.collect_tensors(&join(prefix, "mask"), out);
        self.in_comp.collect_tensors(&join(prefix, "in_comp"), out);
        self.out_comp.collect_tensors(&join(prefix, "out_comp"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        let a: Vec<f64> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f64> = b.flatten_all().unwrap().to_vec1().unwrap();
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn test_manual_layer_norm_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let norm = manual_layer_norm(64, 1e-5, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 8, 64), &device).unwrap();
        let out = norm.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 8, 64]);
    }

    #[test]
    fn test_manual_layer_norm_normalized() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let norm = manual_layer_norm(64, 1e-5, vb).unwrap();

        let x = Tensor::randn(0.0f64, 1.0, (1, 64), &device).unwrap();
        let out = norm.forward(&x).unwrap();

        let mean = out.mean_all().unwrap().to_scalar::<f64>().unwrap();
        let var = out.sqr().unwrap().mean_all().unwrap().to_scalar::<f64>().unwrap();
        assert!(mean.abs() < 1e-6, "Mean should be close to 0, got {}", mean);
        assert!((var - 1.0).abs() < 1e-3, "Variance should be close to 1, got {}", var);
    }

    #[test]
    fn test_masked_norm_matches_reduced_norm() {
        let device = Device::Cpu;
        let weight = Tensor::randn(1.0f64, 0.1, 6, &device).unwrap();
        let bias = Tensor::randn(0.0f64, 0.1, 6, &device).unwrap();
        let norm = ManualLayerNorm::new(weight, Some(bias), 1e-12);

        let indices = [0u32, 2, 3];
        let indicator = Tensor::new(&[1.0f64, 0.0, 1.0, 1.0, 0.0, 0.0], &device).unwrap();
        let x = Tensor::randn(0.0f64, 1.0, (4, 6), &device).unwrap();
        let index = Tensor::new(&indices, &device).unwrap();

        let masked = norm.forward_masked(&x, &indicator).unwrap();
        let reduced = norm
            .extract(&indices)
            .unwrap()
            .forward(&x.index_select(&index, 1).unwrap())
            .unwrap();

        assert!(max_diff(&masked.index_select(&index, 1).unwrap(), &reduced) < 1e-10);
        let dropped = masked
            .index_select(&Tensor::new(&[1u32, 4, 5], &device).unwrap(), 1)
            .unwrap();
        assert_eq!(dropped.abs().unwrap().sum_all().unwrap().to_scalar::<f64>().unwrap(), 0.0);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f64, 3.0, (3, 5), &device).unwrap();
        let probs = manual_softmax_last_dim(&x).unwrap();
        let sums: Vec<f64> = probs.sum(D::Minus1).unwrap().to_vec1().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_gated_norm_reduces_exactly() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let gated = NormWithCompactor::load(6, 1e-12, 0.0, vb.pp("LayerNorm")).unwrap();

        let gates = Tensor::new(&[0.9f64, 0.0, 0.4, 1.0, 0.0, 0.7], &device).unwrap();
        let gated = NormWithCompactor::new(
            gated.norm().clone(),
            FeatureMask::new(gates, 0.0).unwrap(),
            gated.in_comp().clone(),
            gated.out_comp().clone(),
        );

        let x = Tensor::randn(0.0f64, 1.0, (2, 3, 6), &device).unwrap();
        let expected = gated.forward(&x).unwrap();

        let kept = gated.mask().parse().unwrap();
        let entry = gated.entry(&kept).unwrap();
        let reduced = gated.extract(&kept.indices).unwrap();
        let lift = gated.lift(&kept).unwrap();
        let got = lift
            .forward(&reduced.forward(&entry.forward(&x).unwrap()).unwrap())
            .unwrap();
        assert!(max_diff(&got, &expected) < 1e-9);

        let names = gated.named_tensors("LayerNorm");
        assert_eq!(names.len(), 5);
        assert!(names.contains_key("LayerNorm.out_comp.weight"));
    }
}
