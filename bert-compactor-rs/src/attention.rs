//! Multi-head attention primitives shared by the gated and packed encoders.
//!
//! Query/key and value/output head widths are independent: after
//! compaction a head may keep fewer query/key dims than value/output dims,
//! or none at all.

use candle_core::{DType, Result, Tensor};

use crate::norm::manual_softmax_last_dim;

/// Added to scores of padded key positions.
pub const MASKED_SCORE: f64 = -10_000.0;

/// `(batch, seq, heads * head_dim)` → `(batch, heads, seq, head_dim)`.
pub fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq_len, _) = x.dims3()?;
    x.reshape((batch, seq_len, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// `(batch, heads, seq, head_dim)` → `(batch, seq, heads * head_dim)`.
pub fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (batch, num_heads, seq_len, head_dim) = x.dims4()?;
    x.transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq_len, num_heads * head_dim))
}

/// Score scale `1 / sqrt(head_dim)` of the uncompacted architecture.
pub fn score_scale(head_dim: usize) -> f64 {
    1.0 / (head_dim as f64).sqrt()
}

/// Scaled query·key scores with an optional additive mask.
///
/// Inputs are `(batch, heads, seq, dim)`; output is `(batch, heads, seq, seq)`.
pub fn scaled_scores(q: &Tensor, k: &Tensor, scale: f64, mask: Option<&Tensor>) -> Result<Tensor> {
    let k_t = k.t()?.contiguous()?;
    let scores = (q.matmul(&k_t)? * scale)?;
    match mask {
        Some(m) => scores.broadcast_add(m),
        None => Ok(scores),
    }
}

/// Scores for heads that kept no query/key dims: zero plus the mask.
pub fn zero_scores(
    batch: usize,
    num_heads: usize,
    seq_len: usize,
    dtype: DType,
    mask: Option<&Tensor>,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let scores = Tensor::zeros((batch, num_heads, seq_len, seq_len), dtype, device)?;
    match mask {
        Some(m) => scores.broadcast_add(m),
        None => Ok(scores),
    }
}

/// Attention-weighted values: softmax over keys, then `probs · v`.
pub fn attend(scores: &Tensor, v: &Tensor) -> Result<Tensor> {
    manual_softmax_last_dim(scores)?.matmul(v)
}

/// Turn a `(batch, seq)` 0/1 padding mask into an additive
/// `(batch, 1, 1, seq)` score mask.
pub fn extended_attention_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch, seq_len) = mask.dims2()?;
    let keep = mask.to_dtype(dtype)?;
    let additive = ((1.0 - keep)? * MASKED_SCORE)?;
    additive.reshape((batch, 1, 1, seq_len))
}
