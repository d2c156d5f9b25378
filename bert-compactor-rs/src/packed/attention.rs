//! Dense self-attention with independent query/key and value/output head widths.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::affine::Affine;
use crate::attention::{attend, merge_heads, score_scale, scaled_scores, split_heads, zero_scores};
use crate::config::PackedLayerConfig;
use crate::params::{join, NamedTensors, TensorMap};

/// Self-attention of a packed layer.
///
/// Query and key are absent when the live heads kept no query/key dims;
/// scores are then all zero.
#[derive(Debug, Clone)]
pub struct PackedSelfAttention {
    query: Option<Affine>,
    key: Option<Affine>,
    value: Affine,
    output: Affine,
    num_heads: usize,
    qk_head_dim: usize,
    vo_head_dim: usize,
    scale: f64,
}

impl PackedSelfAttention {
    /// Load under `vb` (usually `encoder.layer.{i}.attention`).
    ///
    /// `base_head_dim` is the head width of the uncompacted encoder; the
    /// score scale keeps using it.
    pub fn new(config: &PackedLayerConfig, base_head_dim: usize, vb: VarBuilder) -> Result<Self> {
        let vb_self = vb.pp("self");
        let (query, key) = if config.qk_dim > 0 {
            (
                Some(Affine::load(config.input_dim, config.qk_dim, vb_self.pp("query"))?),
                Some(Affine::load(config.input_dim, config.qk_dim, vb_self.pp("key"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            query,
            key,
            value: Affine::load(config.input_dim, config.vo_dim, vb_self.pp("value"))?,
            output: Affine::load(config.vo_dim, config.attn_output_dim, vb.pp("output.dense"))?,
            num_heads: config.num_heads,
            qk_head_dim: config.qk_head_dim(),
            vo_head_dim: config.vo_head_dim(),
            scale: score_scale(base_head_dim),
        })
    }

    /// Number of live heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Fused query transform, if any.
    pub fn query(&self) -> Option<&Affine> {
        self.query.as_ref()
    }

    /// Fused key transform, if any.
    pub fn key(&self) -> Option<&Affine> {
        self.key.as_ref()
    }

    /// Fused value transform.
    pub fn value(&self) -> &Affine {
        &self.value
    }

    /// Fused output transform.
    pub fn output(&self) -> &Affine {
        &self.output
    }

    /// Scaled attention scores `(batch, live heads, seq, seq)`, mask included.
    pub fn scores(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        match (&self.query, &self.key) {
            (Some(query), Some(key)) => {
                let q = split_heads(&query.forward(x)?, self.num_heads, self.qk_head_dim)?;
                let k = split_heads(&key.forward(x)?, self.num_heads, self.qk_head_dim)?;
                scaled_scores(&q, &k, self.scale, mask)
            }
            _ => {
                let (batch, seq_len, _) = x.dims3()?;
                zero_scores(batch, self.num_heads, seq_len, x.dtype(), mask, x.device())
            }
        }
    }

    /// Forward pass, before the residual add.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let scores = self.scores(x, mask)?;
        let v = split_heads(&self.value.forward(x)?, self.num_heads, self.vo_head_dim)?;
        let context = merge_heads(&attend(&scores, &v)?)?;
        self.output.forward(&context)
    }
}

impl NamedTensors for PackedSelfAttention {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        let self_prefix = join(prefix, "self");
        if let Some(q) = &self.query {
            q.collect_tensors(&join(&self_prefix, "query"), out);
        }
        if let Some(k) = &self.key {
            k.collect_tensors(&join(&self_prefix, "key"), out);
        }
        self.value.collect_tensors(&join(&self_prefix, "value"), out);
        self.output.collect_tensors(&join(prefix, "output.dense"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer_config(qk_dim: usize) -> PackedLayerConfig {
        PackedLayerConfig {
            input_dim: 6,
            attn_output_dim: 5,
            ffn_output_dim: 5,
            num_heads: 2,
            qk_dim,
            vo_dim: 4,
            ffn_dim: 3,
            prune_attn: false,
            prune_ffn: false,
        }
    }

    #[test]
    fn test_asymmetric_head_widths() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let attn = PackedSelfAttention::new(&layer_config(6), 4, vb.pp("attention")).unwrap();

        let x = Tensor::randn(0.0f64, 1.0, (2, 3, 6), &device).unwrap();
        assert_eq!(attn.scores(&x, None).unwrap().dims(), &[2, 2, 3, 3]);
        assert_eq!(attn.forward(&x, None).unwrap().dims(), &[2, 3, 5]);
    }

    #[test]
    fn test_no_query_key_dims() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let attn = PackedSelfAttention::new(&layer_config(0), 4, vb.pp("attention")).unwrap();
        assert!(attn.query().is_none());

        let x = Tensor::randn(0.0f64, 1.0, (1, 3, 6), &device).unwrap();
        let scores = attn.scores(&x, None).unwrap();
        let total = scores.abs().unwrap().sum_all().unwrap().to_scalar::<f64>().unwrap();
        assert_eq!(total, 0.0);
        assert!(!attn.named_tensors("a").contains_key("a.self.query.weight"));
    }
}
