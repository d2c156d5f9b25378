//! Gated (training-time) encoder model.
//!
//! Parameter layout follows the usual BERT naming, with masks and
//! compactors nested under the module they gate:
//!
//! ```text
//! embeddings.{word,position,token_type}_embeddings
//! embeddings.LayerNorm.{weight,bias,mask,in_comp,out_comp}
//! encoder.layer.{i}.attention.self.{query,key,value,mask}
//! encoder.layer.{i}.attention.output.{dense,mask,LayerNorm}
//! encoder.layer.{i}.intermediate.dense
//! encoder.layer.{i}.output.{dense,mask,LayerNorm}
//! pooler.dense, classifier | qa_outputs
//! ```

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::attention::extended_attention_mask;
use crate::config::EncoderConfig;
use crate::embedding::TokenEmbeddings;
use crate::error::CompactResult;
use crate::gated::layer::GatedLayer;
use crate::heads::{EncoderOutput, Head, Pooler};
use crate::norm::NormWithCompactor;
use crate::params::{join, load_safetensors, save_safetensors, var_builder, NamedTensors, TensorMap};

/// Encoder whose prunable features are gated rather than removed.
#[derive(Debug, Clone)]
pub struct GatedEncoderModel {
    embeddings: TokenEmbeddings,
    embedding_norm: NormWithCompactor,
    layers: Vec<GatedLayer>,
    pooler: Option<Pooler>,
    head: Option<Head>,
    config: EncoderConfig,
}

impl GatedEncoderModel {
    /// Build from a VarBuilder (random init through a `VarMap`, or a checkpoint).
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> CompactResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let embeddings = TokenEmbeddings::new(config, vb.pp("embeddings"))?;
        let embedding_norm = NormWithCompactor::load(
            hidden,
            config.layer_norm_eps,
            config.gate_threshold,
            vb.pp("embeddings.LayerNorm"),
        )?;

        let layers = (0..config.num_layers)
            .map(|i| GatedLayer::new(config, vb.pp(format!("encoder.layer.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let pooler = if config.add_pooler {
            Some(Pooler::load(hidden, hidden, vb.pp("pooler"))?)
        } else {
            None
        };
        let head = config
            .task
            .map(|task| Head::load(task, hidden, vb.clone()))
            .transpose()?;

        Ok(Self {
            embeddings,
            embedding_norm,
            layers,
            pooler,
            head,
            config: config.clone(),
        })
    }

    /// Load from a safetensors checkpoint.
    pub fn load(config: &EncoderConfig, path: &Path, dtype: DType, device: &Device) -> CompactResult<Self> {
        let tensors = load_safetensors(path, device)?;
        Self::new(config, var_builder(tensors, dtype, device))
    }

    /// Save every parameter, masks and compactors included.
    pub fn save(&self, path: &Path) -> CompactResult<()> {
        save_safetensors(&self.named_tensors(""), path)
    }

    /// Embedding stage output: normalized, full width.
    pub fn embed(&self, input_ids: &Tensor, token_type_ids: Option<&Tensor>) -> CompactResult<Tensor> {
        let e = self.embeddings.forward(input_ids, token_type_ids)?;
        Ok(self.embedding_norm.forward(&e)?)
    }

    /// Full forward pass.
    ///
    /// `attention_mask` is a `(batch, seq)` 0/1 padding mask.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> CompactResult<EncoderOutput> {
        let mask = self.score_mask(attention_mask)?;
        let mut hidden = self.embed(input_ids, token_type_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, mask.as_ref())?;
        }

        let pooled_output = self.pooler.as_ref().map(|p| p.forward(&hidden)).transpose()?;
        let logits = self
            .head
            .as_ref()
            .map(|h| h.forward(&hidden, pooled_output.as_ref()))
            .transpose()?;
        Ok(EncoderOutput {
            sequence_output: hidden,
            pooled_output,
            logits,
        })
    }

    /// Attention scores of every layer, `(batch, heads, seq, seq)` each.
    pub fn attention_scores(
        &self,
        input_ids: &Tensor,
        token_type_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> CompactResult<Vec<Tensor>> {
        let mask = self.score_mask(attention_mask)?;
        let mut hidden = self.embed(input_ids, token_type_ids)?;
        let mut scores = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            scores.push(layer.attention_scores(&hidden, mask.as_ref())?);
            hidden = layer.forward(&hidden, mask.as_ref())?;
        }
        Ok(scores)
    }

    fn score_mask(&self, attention_mask: Option<&Tensor>) -> CompactResult<Option<Tensor>> {
        let dtype = self.embedding_norm.norm().weight().dtype();
        Ok(attention_mask
            .map(|m| extended_attention_mask(m, dtype))
            .transpose()?)
    }

    /// Token embedding tables.
    pub fn embeddings(&self) -> &TokenEmbeddings {
        &self.embeddings
    }

    /// Gated embedding norm; acts as `norm0` of layer 0.
    pub fn embedding_norm(&self) -> &NormWithCompactor {
        &self.embedding_norm
    }

    /// Encoder layers in order.
    pub fn layers(&self) -> &[GatedLayer] {
        &self.layers
    }

    /// `[CLS]` pooler, if any.
    pub fn pooler(&self) -> Option<&Pooler> {
        self.pooler.as_ref()
    }

    /// Task head, if any.
    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    /// Architecture.
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Number of encoder layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl NamedTensors for GatedEncoderModel {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.embeddings.collect_tensors(&join(prefix, "embeddings"), out);
        self.embedding_norm
            .collect_tensors(&join(prefix, "embeddings.LayerNorm"), out);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.collect_tensors(&join(prefix, &format!("encoder.layer.{i}")), out);
        }
        if let Some(pooler) = &self.pooler {
            pooler.collect_tensors(&join(prefix, "pooler"), out);
        }
        if let Some(head) = &self.head {
            head.collect_tensors(prefix, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskHead;
    use candle_nn::VarMap;

    fn ids(device: &Device) -> Tensor {
        Tensor::new(&[[2u32, 7, 1, 4], [3, 3, 9, 0]], device).unwrap()
    }

    #[test]
    fn test_model_forward() {
        let config = EncoderConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);

        let model = GatedEncoderModel::new(&config, vb).unwrap();
        let out = model.forward(&ids(&device), None, None).unwrap();
        assert_eq!(out.sequence_output.dims(), &[2, 4, config.hidden_size]);
        assert_eq!(out.pooled_output.unwrap().dims(), &[2, config.hidden_size]);
        assert!(out.logits.is_none());

        let scores = model.attention_scores(&ids(&device), None, None).unwrap();
        assert_eq!(scores.len(), config.num_layers);
        assert_eq!(scores[0].dims(), &[2, config.num_heads, 4, 4]);
    }

    #[test]
    fn test_task_heads() {
        let device = Device::Cpu;
        for (task, dims) in [
            (TaskHead::SequenceClassification { num_labels: 3 }, vec![2, 3]),
            (TaskHead::QuestionAnswering, vec![2, 4, 2]),
        ] {
            let config = EncoderConfig::test().with_task(task);
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
            let model = GatedEncoderModel::new(&config, vb).unwrap();
            let out = model.forward(&ids(&device), None, None).unwrap();
            assert_eq!(out.logits.unwrap().dims(), dims.as_slice());
        }
    }

    #[test]
    fn test_named_tensors_cover_varmap() {
        let config = EncoderConfig::tiny();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let model = GatedEncoderModel::new(&config, vb).unwrap();

        let names = model.named_tensors("");
        assert_eq!(names.len(), varmap.all_vars().len());
        assert!(names.contains_key("embeddings.LayerNorm.out_comp.weight"));
        assert!(names.contains_key("encoder.layer.2.attention.self.mask.gates"));
        assert!(names.contains_key("pooler.dense.bias"));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let config = EncoderConfig::test();
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let model = GatedEncoderModel::new(&config, vb).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gated.safetensors");
        model.save(&path).unwrap();
        let loaded = GatedEncoderModel::load(&config, &path, DType::F64, &device).unwrap();

        let a = model.forward(&ids(&device), None, None).unwrap().sequence_output;
        let b = loaded.forward(&ids(&device), None, None).unwrap().sequence_output;
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f64>().unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EncoderConfig {
            num_heads: 3,
            ..EncoderConfig::test()
        };
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        assert!(GatedEncoderModel::new(&config, vb).is_err());
    }
}
