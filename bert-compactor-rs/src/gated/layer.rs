//! Gated post-LayerNorm encoder layer.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::EncoderConfig;
use crate::gated::attention::GatedSelfAttention;
use crate::gated::feedforward::GatedFeedForward;
use crate::norm::NormWithCompactor;
use crate::params::{join, NamedTensors, TensorMap};

/// Encoder layer: attention → add → norm1 → feed-forward → add → norm2.
#[derive(Debug, Clone)]
pub struct GatedLayer {
    attention: GatedSelfAttention,
    norm1: NormWithCompactor,
    ffn: GatedFeedForward,
    norm2: NormWithCompactor,
}

impl GatedLayer {
    /// Load under `vb` (usually `encoder.layer.{i}`).
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let eps = config.layer_norm_eps;
        let threshold = config.gate_threshold;
        Ok(Self {
            attention: GatedSelfAttention::new(config, vb.pp("attention"))?,
            norm1: NormWithCompactor::load(hidden, eps, threshold, vb.pp("attention.output.LayerNorm"))?,
            ffn: GatedFeedForward::new(config, vb.clone())?,
            norm2: NormWithCompactor::load(hidden, eps, threshold, vb.pp("output.LayerNorm"))?,
        })
    }

    /// Attention block.
    pub fn attention(&self) -> &GatedSelfAttention {
        &self.attention
    }

    /// Norm after the attention residual.
    pub fn norm1(&self) -> &NormWithCompactor {
        &self.norm1
    }

    /// Feed-forward block.
    pub fn ffn(&self) -> &GatedFeedForward {
        &self.ffn
    }

    /// Norm after the feed-forward residual.
    pub fn norm2(&self) -> &NormWithCompactor {
        &self.norm2
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size), the previous norm's output
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let attn_out = self.attention.forward(x, mask)?;
        let y1 = self.norm1.forward(&(x + attn_out)?)?;

        let ffn_out = self.ffn.forward(&y1)?;
        self.norm2.forward(&(y1 + ffn_out)?)
    }

    /// Attention scores of this layer for input `x`.
    pub fn attention_scores(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        self.attention.scores(x, mask)
    }
}

impl NamedTensors for GatedLayer {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.attention.collect_tensors(&join(prefix, "attention"), out);
        self.norm1
            .collect_tensors(&join(prefix, "attention.output.LayerNorm"), out);
        self.ffn.collect_tensors(prefix, out);
        self.norm2.collect_tensors(&join(prefix, "output.LayerNorm"), out);
    }
}
