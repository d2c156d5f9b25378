//! Gated feed-forward block.
//!
//! FFN(x) = a * down(g ⊙ gelu(up(x))), where `g` gates individual
//! intermediate neurons and `a` is the scalar block gate.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::affine::Affine;
use crate::compactor::{PrunableLinear, StageLayout};
use crate::config::EncoderConfig;
use crate::mask::FeatureMask;
use crate::params::{join, NamedTensors, TensorMap};

/// Feed-forward block of a gated encoder layer.
#[derive(Debug, Clone)]
pub struct GatedFeedForward {
    intermediate: Affine,
    output: PrunableLinear,
    block_mask: FeatureMask,
}

impl GatedFeedForward {
    /// Load from the layer root: `intermediate.dense`, `output.dense`, `output.mask`.
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let intermediate = config.intermediate_size;
        Ok(Self {
            intermediate: Affine::load(hidden, intermediate, vb.pp("intermediate").pp("dense"))?,
            output: PrunableLinear::load(
                intermediate,
                hidden,
                StageLayout::MASK_BEFORE,
                config.gate_threshold,
                vb.pp("output").pp("dense"),
            )?,
            block_mask: FeatureMask::load(1, config.gate_threshold, vb.pp("output").pp("mask"))?,
        })
    }

    /// Up-projection; it has no mask of its own.
    pub fn intermediate(&self) -> &Affine {
        &self.intermediate
    }

    /// Down-projection; its input mask is the neuron filter.
    pub fn output(&self) -> &PrunableLinear {
        &self.output
    }

    /// Scalar gate over the whole block.
    pub fn block_mask(&self) -> &FeatureMask {
        &self.block_mask
    }
}

impl Module for GatedFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.intermediate.forward(x)?.gelu_erf()?;
        let out = self.output.forward(&hidden)?;
        out.broadcast_mul(&self.block_mask.effective()?)
    }
}

impl NamedTensors for GatedFeedForward {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.intermediate
            .collect_tensors(&join(prefix, "intermediate.dense"), out);
        self.output.collect_tensors(&join(prefix, "output.dense"), out);
        self.block_mask.collect_tensors(&join(prefix, "output.mask"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_ffn_shape_and_names() {
        let config = EncoderConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let ffn = GatedFeedForward::new(&config, vb.pp("layer")).unwrap();
        let x = Tensor::randn(0.0f64, 1.0, (2, 4, config.hidden_size), &device).unwrap();
        assert_eq!(ffn.forward(&x).unwrap().dims(), &[2, 4, config.hidden_size]);

        let names = ffn.named_tensors("layer");
        assert!(names.contains_key("layer.intermediate.dense.weight"));
        assert!(names.contains_key("layer.output.dense.mask.gates"));
        assert!(names.contains_key("layer.output.mask.gates"));
        assert_eq!(varmap.all_vars().len(), names.len());
    }

    #[test]
    fn test_closed_filter_leaves_bias() {
        let config = EncoderConfig::test();
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let ffn = GatedFeedForward::new(&config, vb).unwrap();

        varmap
            .set_one(
                "output.dense.mask.gates",
                Tensor::zeros(config.intermediate_size, DType::F64, &device).unwrap(),
            )
            .unwrap();

        let x = Tensor::randn(0.0f64, 1.0, (1, 2, config.hidden_size), &device).unwrap();
        let out = ffn.forward(&x).unwrap();
        let bias = ffn.output().extract().bias_or_zeros().unwrap();
        let expected = bias.broadcast_as(out.shape()).unwrap();
        let diff = (out - expected).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f64>().unwrap() < 1e-12);
    }
}
