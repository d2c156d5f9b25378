//! Gated multi-head self-attention.
//!
//! Query and value projections carry a compactor plus a mask after the base
//! transform. The key projection carries only a compactor and reuses the
//! query mask as a 0/1 indicator, so the query/key gate scales the dot
//! product exactly once. Each head has its own gate, and the whole block has
//! a scalar gate.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::attention::{attend, merge_heads, score_scale, scaled_scores, split_heads};
use crate::compactor::{PrunableLinear, StageLayout};
use crate::config::EncoderConfig;
use crate::mask::FeatureMask;
use crate::params::{join, NamedTensors, TensorMap};

/// Self-attention block of a gated encoder layer.
#[derive(Debug, Clone)]
pub struct GatedSelfAttention {
    query: PrunableLinear,
    key: PrunableLinear,
    value: PrunableLinear,
    head_mask: FeatureMask,
    output: PrunableLinear,
    block_mask: FeatureMask,
    num_heads: usize,
    head_dim: usize,
}

impl GatedSelfAttention {
    /// Load under `vb` (usually `encoder.layer.{i}.attention`).
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let threshold = config.gate_threshold;
        let vb_self = vb.pp("self");
        let vb_out = vb.pp("output");

        Ok(Self {
            query: PrunableLinear::load(hidden, hidden, StageLayout::GATED_OUTPUT, threshold, vb_self.pp("query"))?,
            key: PrunableLinear::load(hidden, hidden, StageLayout::COMPACTOR_AFTER, threshold, vb_self.pp("key"))?,
            value: PrunableLinear::load(hidden, hidden, StageLayout::GATED_OUTPUT, threshold, vb_self.pp("value"))?,
            head_mask: FeatureMask::load(config.num_heads, threshold, vb_self.pp("mask"))?,
            output: PrunableLinear::load(hidden, hidden, StageLayout::COMPACTOR_BEFORE, threshold, vb_out.pp("dense"))?,
            block_mask: FeatureMask::load(1, threshold, vb_out.pp("mask"))?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    /// Query stage; owns the query/key mask.
    pub fn query(&self) -> &PrunableLinear {
        &self.query
    }

    /// Key stage.
    pub fn key(&self) -> &PrunableLinear {
        &self.key
    }

    /// Value stage; owns the value/output mask.
    pub fn value(&self) -> &PrunableLinear {
        &self.value
    }

    /// Attention output projection.
    pub fn output(&self) -> &PrunableLinear {
        &self.output
    }

    /// One gate per head.
    pub fn head_mask(&self) -> &FeatureMask {
        &self.head_mask
    }

    /// Scalar gate over the whole block.
    pub fn block_mask(&self) -> &FeatureMask {
        &self.block_mask
    }

    /// Number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    fn query_key(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let q = self.query.forward(x)?;
        let k = self.key.forward(x)?;
        let k = match self.query.mask() {
            Some(mask) => k.broadcast_mul(&mask.indicator()?)?,
            None => k,
        };
        Ok((
            split_heads(&q, self.num_heads, self.head_dim)?,
            split_heads(&k, self.num_heads, self.head_dim)?,
        ))
    }

    /// Scaled attention scores `(batch, heads, seq, seq)`, mask included.
    pub fn scores(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (q, k) = self.query_key(x)?;
        scaled_scores(&q, &k, score_scale(self.head_dim), mask)
    }

    /// Forward pass
    /// Input: (batch, seq_len, hidden_size)
    /// Output: (batch, seq_len, hidden_size), before the residual add
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let scores = self.scores(x, mask)?;
        let v = split_heads(&self.value.forward(x)?, self.num_heads, self.head_dim)?;

        let context = attend(&scores, &v)?;
        let head_gates = self.head_mask.effective()?.reshape((1, self.num_heads, 1, 1))?;
        let context = merge_heads(&context.broadcast_mul(&head_gates)?)?;

        let out = self.output.forward(&context)?;
        out.broadcast_mul(&self.block_mask.effective()?)
    }
}

impl NamedTensors for GatedSelfAttention {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        let self_prefix = join(prefix, "self");
        let out_prefix = join(prefix, "output");
        self.query.collect_tensors(&join(&self_prefix, "query"), out);
        self.key.collect_tensors(&join(&self_prefix, "key"), out);
        self.value.collect_tensors(&join(&self_prefix, "value"), out);
        self.head_mask.collect_tensors(&join(&self_prefix, "mask"), out);
        self.output.collect_tensors(&join(&out_prefix, "dense"), out);
        self.block_mask.collect_tensors(&join(&out_prefix, "mask"), out);
    }
}
