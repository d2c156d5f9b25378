//! Packed (compacted) encoder model.
//!
//! The embedding tables keep the full hidden width; a projection
//! narrows the stream to the kept features of the embedding norm. From
//! there on every width comes from [`PackedEncoderConfig`].

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;

use crate::affine::Affine;
use crate::attention::extended_attention_mask;
use crate::config::PackedEncoderConfig;
use crate::embedding::TokenEmbeddings;
use crate::error::CompactResult;
use crate::heads::{EncoderOutput, Head, Pooler};
use crate::norm::{manual_layer_norm, ManualLayerNorm};
use crate::packed::layer::PackedLayer;
use crate::params::{join, load_safetensors, save_safetensors, var_builder, NamedTensors, TensorMap};

/// Config file written by [`PackedEncoderModel::save_pretrained`].
pub const CONFIG_FILE: &str = "packed_config.json";
/// Weights file written by [`PackedEncoderModel::save_pretrained`].
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Dense encoder with dead features physically removed.
#[derive(Debug, Clone)]
pub struct PackedEncoderModel {
    embeddings: TokenEmbeddings,
    projection: Affine,
    embedding_norm: ManualLayerNorm,
    layers: Vec<PackedLayer>,
    pooler: Option<Pooler>,
    head: Option<Head>,
    config: PackedEncoderConfig,
}

impl PackedEncoderModel {
    /// Build from a VarBuilder.
    ///
    /// Only names this architecture asks for are read; anything else in the
    /// backing store is ignored.
    pub fn new(config: &PackedEncoderConfig, vb: VarBuilder) -> CompactResult<Self> {
        config.validate()?;
        let base = &config.base;
        let eps = base.layer_norm_eps;

        let embeddings = TokenEmbeddings::new(base, vb.pp("embeddings"))?;
        let projection = Affine::load(base.hidden_size, config.embedding_dim, vb.pp("embeddings.projection"))?;
        let embedding_norm = manual_layer_norm(config.embedding_dim, eps, vb.pp("embeddings.LayerNorm"))?;

        let layers = config
            .per_layer_config
            .iter()
            .enumerate()
            .map(|(i, layer)| PackedLayer::new(layer, base.head_dim(), eps, vb.pp(format!("encoder.layer.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let pooler = if config.pooler {
            Some(Pooler::load(config.output_dim(), base.hidden_size, vb.pp("pooler"))?)
        } else {
            None
        };
        let head = base
            .task
            .map(|task| {
                let input = if task.reads_pooled() {
                    base.hidden_size
                } else {
                    config.output_dim()
                };
                Head::load(task, input, vb.clone())
            })
            .transpose()?;

        Ok(Self {
            embeddings,
            projection,
            embedding_norm,
            layers,
            pooler,
            head,
            config: config.clone(),
        })
    }

    /// Build from a tensor map, ignoring names the architecture does not use.
    pub fn from_tensors(
        config: &PackedEncoderConfig,
        tensors: TensorMap,
        dtype: DType,
        device: &Device,
    ) -> CompactResult<Self> {
        Self::new(config, var_builder(tensors, dtype, device))
    }

    /// Load weights from a safetensors file.
    pub fn load(config: &PackedEncoderConfig, path: &Path, dtype: DType, device: &Device) -> CompactResult<Self> {
        Self::from_tensors(config, load_safetensors(path, device)?, dtype, device)
    }

    /// Save weights in safetensors format.
    pub fn save(&self, path: &Path) -> CompactResult<()> {
        save_safetensors(&self.named_tensors(""), path)
    }

    /// Write config and weights into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> CompactResult<()> {
        std::fs::create_dir_all(dir)?;
        self.config.to_json_file(&dir.join(CONFIG_FILE))?;
        self.save(&dir.join(WEIGHTS_FILE))
    }

    /// Read a model written by [`Self::save_pretrained`].
    pub fn from_pretrained(dir: &Path, dtype: DType, device: &Device) -> CompactResult<Self> {
        let config = PackedEncoderConfig::from_json_file(&dir.join(CONFIG_FILE))?;
        Self::load(&config, &dir.join(WEIGHTS_FILE), dtype, device)
    }

    /// Embedding stage output, `(batch, seq, embedding_dim)`.
    pub fn embed(&self, input_ids: &Tensor, token_type_ids: Option<&Tensor>) -> CompactResult<Tensor> {
        let e = self.embeddings.forward(input_ids, token_type_ids)?;
        Ok(self.embedding_norm.forward(&self.projection.forward(&e)?)?)
    }

    /// Full forward pass.
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

    /// Attention scores per layer over live heads; `None` for pruned blocks.
    pub fn attention_scores(
        &self,
        input_ids: &Tensor,
        token_type_ids: Option<&Tensor>,
        attention_mask: Option<&Tensor>,
    ) -> CompactResult<Vec<Option<Tensor>>> {
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
        let dtype = self.projection.dtype();
        Ok(attention_mask
            .map(|m| extended_attention_mask(m, dtype))
            .transpose()?)
    }

    /// Layers in order.
    pub fn layers(&self) -> &[PackedLayer] {
        &self.layers
    }

    /// Embedding projection onto the kept features.
    pub fn projection(&self) -> &Affine {
        &self.projection
    }

    /// `[CLS]` pooler, if any.
    pub fn pooler(&self) -> Option<&Pooler> {
        self.pooler.as_ref()
    }

    /// Task head, if any.
    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    /// Packed architecture.
    pub fn config(&self) -> &PackedEncoderConfig {
        &self.config
    }

    /// Total number of parameters.
    pub fn parameter_count(&self) -> usize {
        self.named_tensors("").values().map(Tensor::elem_count).sum()
    }
}

impl NamedTensors for PackedEncoderModel {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.embeddings.collect_tensors(&join(prefix, "embeddings"), out);
        self.projection
            .collect_tensors(&join(prefix, "embeddings.projection"), out);
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
