//! Retained-feature accounting for a gated encoder.
//!
//! All figures come from hard keep indicators (gate above threshold), so
//! they describe exactly what compaction will keep.

use serde::{Deserialize, Serialize};

use crate::error::CompactResult;
use crate::gated::GatedEncoderModel;
use crate::mask::FeatureMask;

/// Kept fractions of one encoder layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSparsity {
    /// Kept fraction of the post-attention norm features
    pub attn_hidden: f64,
    /// Kept fraction of the post-feed-forward norm features
    pub ffn_hidden: f64,
    /// Kept fraction of query/key dims
    pub qk: f64,
    /// Kept fraction of value/output dims
    pub vo: f64,
    /// Kept fraction of heads
    pub heads: f64,
    /// Kept fraction of feed-forward neurons
    pub filter: f64,
    /// Attention block gate open
    pub attention_kept: bool,
    /// Feed-forward block gate open
    pub ffn_kept: bool,
}

/// Model-wide sparsity summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparsityReport {
    /// Kept fraction of the embedding norm features
    pub embedding_hidden: f64,
    /// One entry per layer
    pub layers: Vec<LayerSparsity>,
    /// Retained projection parameters over the dense projection count
    pub projection_fraction: f64,
    /// Same, with the residual transforms counted as well
    pub total_fraction: f64,
}

fn indicator(mask: &FeatureMask) -> CompactResult<Vec<f64>> {
    let mut keep = vec![0.0; mask.features()];
    for i in mask.parse()?.indices {
        keep[i as usize] = 1.0;
    }
    Ok(keep)
}

fn fraction(keep: &[f64]) -> f64 {
    if keep.is_empty() {
        0.0
    } else {
        keep.iter().sum::<f64>() / keep.len() as f64
    }
}

impl SparsityReport {
    /// Measure `model`'s masks.
    pub fn from_model(model: &GatedEncoderModel) -> CompactResult<Self> {
        let config = model.config();
        let head_dim = config.head_dim();
        let dense = config.projection_parameter_count() as f64;

        let mut prev = indicator(model.embedding_norm().mask())?;
        let embedding_hidden = fraction(&prev);
        let mut layers = Vec::with_capacity(model.num_layers());
        let mut projection = 0.0;
        let mut residual = 0.0;

        for layer in model.layers() {
            let attention = layer.attention();
            let hidden1 = indicator(layer.norm1().mask())?;
            let hidden2 = indicator(layer.norm2().mask())?;
            let heads = indicator(attention.head_mask())?;
            let qk = match attention.query().mask() {
                Some(m) => indicator(m)?,
                None => Vec::new(),
            };
            let vo = match attention.value().mask() {
                Some(m) => indicator(m)?,
                None => Vec::new(),
            };
            let filter = match layer.ffn().output().mask() {
                Some(m) => indicator(m)?,
                None => Vec::new(),
            };
            let attention_kept = attention.block_mask().block_gate()?.is_some();
            let ffn_kept = layer.ffn().block_mask().block_gate()?.is_some();

            let in0: f64 = prev.iter().sum();
            let in1: f64 = hidden1.iter().sum();
            let in2: f64 = hidden2.iter().sum();
            let head_weighted = |keep: &[f64]| -> f64 {
                keep.iter()
                    .enumerate()
                    .map(|(j, k)| k * heads.get(j / head_dim).copied().unwrap_or(0.0))
                    .sum()
            };
            let attn_gate = if attention_kept { 1.0 } else { 0.0 };
            let ffn_gate = if ffn_kept { 1.0 } else { 0.0 };
            let filter_kept: f64 = filter.iter().sum();

            projection += attn_gate * (2.0 * in0 * head_weighted(&qk) + (in0 + in1) * head_weighted(&vo));
            projection += ffn_gate * (in1 + in2) * filter_kept;
            residual += in0 * in1 + in1 * in2;

            layers.push(LayerSparsity {
                attn_hidden: fraction(&hidden1),
                ffn_hidden: fraction(&hidden2),
                qk: fraction(&qk),
                vo: fraction(&vo),
                heads: fraction(&heads),
                filter: fraction(&filter),
                attention_kept,
                ffn_kept,
            });
            prev = hidden2;
        }

        Ok(Self {
            embedding_hidden,
            layers,
            projection_fraction: projection / dense,
            total_fraction: (projection + residual) / dense,
        })
    }
}
