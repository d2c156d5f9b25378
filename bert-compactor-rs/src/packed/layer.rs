//! Packed encoder layer with explicit residual transforms.
//!
//! ```text
//! s1 = LN1(R1·s0 + Attn(s0))
//! s2 = LN2(R2·s1 + FFN(s1))
//! ```
//!
//! `R1` and `R2` re-express the skip connections between differently
//! sized kept-feature sets.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::affine::Affine;
use crate::config::PackedLayerConfig;
use crate::norm::{manual_layer_norm, ManualLayerNorm};
use crate::packed::attention::PackedSelfAttention;
use crate::params::{join, NamedTensors, TensorMap};

/// Up/down projection pair of a packed layer.
#[derive(Debug, Clone)]
pub struct PackedFeedForward {
    intermediate: Affine,
    output: Affine,
}

impl PackedFeedForward {
    /// Up-projection.
    pub fn intermediate(&self) -> &Affine {
        &self.intermediate
    }

    /// Down-projection.
    pub fn output(&self) -> &Affine {
        &self.output
    }
}

impl Module for PackedFeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.output.forward(&self.intermediate.forward(x)?.gelu_erf()?)
    }
}

/// One packed encoder layer.
#[derive(Debug, Clone)]
pub struct PackedLayer {
    attention: Option<PackedSelfAttention>,
    attn_residual: Affine,
    norm1: ManualLayerNorm,
    ffn: Option<PackedFeedForward>,
    ffn_residual: Affine,
    norm2: ManualLayerNorm,
    config: PackedLayerConfig,
}

impl PackedLayer {
    /// Load under `vb` (usually `encoder.layer.{i}`).
    pub fn new(config: &PackedLayerConfig, base_head_dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let attention = if config.prune_attn {
            None
        } else {
            Some(PackedSelfAttention::new(config, base_head_dim, vb.pp("attention"))?)
        };
        let ffn = if config.prune_ffn {
            None
        } else {
            Some(PackedFeedForward {
                intermediate: Affine::load(config.attn_output_dim, config.ffn_dim, vb.pp("intermediate.dense"))?,
                output: Affine::load(config.ffn_dim, config.ffn_output_dim, vb.pp("output.dense"))?,
            })
        };
        Ok(Self {
            attention,
            attn_residual: Affine::load(
                config.input_dim,
                config.attn_output_dim,
                vb.pp("attention.output.residual"),
            )?,
            norm1: manual_layer_norm(config.attn_output_dim, eps, vb.pp("attention.output.LayerNorm"))?,
            ffn,
            ffn_residual: Affine::load(
                config.attn_output_dim,
                config.ffn_output_dim,
                vb.pp("output.residual"),
            )?,
            norm2: manual_layer_norm(config.ffn_output_dim, eps, vb.pp("output.LayerNorm"))?,
            config: *config,
        })
    }

    /// Structural widths.
    pub fn config(&self) -> &PackedLayerConfig {
        &self.config
    }

    /// Attention block, absent when pruned.
    pub fn attention(&self) -> Option<&PackedSelfAttention> {
        self.attention.as_ref()
    }

    /// Feed-forward block, absent when pruned.
    pub fn ffn(&self) -> Option<&PackedFeedForward> {
        self.ffn.as_ref()
    }

    /// Attention skip connection.
    pub fn attn_residual(&self) -> &Affine {
        &self.attn_residual
    }

    /// Feed-forward skip connection.
    pub fn ffn_residual(&self) -> &Affine {
        &self.ffn_residual
    }

    /// Forward pass
    /// Input: (batch, seq_len, input_dim)
    /// Output: (batch, seq_len, ffn_output_dim)
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let mut pre1 = self.attn_residual.forward(x)?;
        if let Some(attn) = &self.attention {
            pre1 = (pre1 + attn.forward(x, mask)?)?;
        }
        let s1 = self.norm1.forward(&pre1)?;

        let mut pre2 = self.ffn_residual.forward(&s1)?;
        if let Some(ffn) = &self.ffn {
            pre2 = (pre2 + ffn.forward(&s1)?)?;
        }
        self.norm2.forward(&pre2)
    }

    /// Attention scores over live heads; `None` when attention was pruned.
    pub fn attention_scores(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Option<Tensor>> {
        self.attention.as_ref().map(|a| a.scores(x, mask)).transpose()
    }
}

impl NamedTensors for PackedLayer {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        if let Some(attn) = &self.attention {
            attn.collect_tensors(&join(prefix, "attention"), out);
        }
        self.attn_residual
            .collect_tensors(&join(prefix, "attention.output.residual"), out);
        self.norm1
            .collect_tensors(&join(prefix, "attention.output.LayerNorm"), out);
        if let Some(ffn) = &self.ffn {
            ffn.intermediate
                .collect_tensors(&join(prefix, "intermediate.dense"), out);
            ffn.output.collect_tensors(&join(prefix, "output.dense"), out);
        }
        self.ffn_residual
            .collect_tensors(&join(prefix, "output.residual"), out);
        self.norm2.collect_tensors(&join(prefix, "output.LayerNorm"), out);
    }
}
