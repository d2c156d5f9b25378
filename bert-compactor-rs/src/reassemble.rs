//! Whole-model compaction.
//!
//! [`CompactorMixer::mix`] walks the gated encoder boundary by boundary:
//! embedding norm, every layer (a fold over [`compact_layer`]), then the
//! pooler and task head. The fused tensors are overlaid on the gated
//! model's own named tensors and a [`PackedEncoderModel`] is built from the
//! result, so anything both models share by name (embedding tables, an
//! unfused classifier) transfers as is.

use candle_core::{DType, Device, Module, Tensor};
use tracing::{debug, info};

use crate::affine::Affine;
use crate::compact::{compact_layer, parse_hidden, CompactedLayer};
use crate::config::{CompactionConfig, PackedEncoderConfig};
use crate::error::{CompactError, CompactResult};
use crate::gated::GatedEncoderModel;
use crate::heads::{Head, Pooler};
use crate::mixer::merge;
use crate::norm::ManualLayerNorm;
use crate::packed::PackedEncoderModel;
use crate::params::{NamedTensors, TensorMap};

/// Everything a compaction run produces, before a packed model is built.
#[derive(Debug, Clone)]
pub struct CompactedModel {
    config: PackedEncoderConfig,
    tensors: TensorMap,
    layers: Vec<CompactedLayer>,
    sequence_lift: Affine,
    dtype: DType,
}

impl CompactedModel {
    /// Packed architecture.
    pub fn config(&self) -> &PackedEncoderConfig {
        &self.config
    }

    /// Gated tensors with every fused tensor overlaid.
    pub fn tensors(&self) -> &TensorMap {
        &self.tensors
    }

    /// Per-layer fusion results.
    pub fn layers(&self) -> &[CompactedLayer] {
        &self.layers
    }

    /// Maps the packed sequence output back onto the gated one.
    pub fn sequence_lift(&self) -> &Affine {
        &self.sequence_lift
    }

    /// Build the packed model on `device`.
    pub fn instantiate(&self, device: &Device) -> CompactResult<PackedEncoderModel> {
        PackedEncoderModel::from_tensors(&self.config, self.tensors.clone(), self.dtype, device)
    }

    /// Lift a packed `sequence_output` to the gated model's hidden width.
    pub fn lift_sequence(&self, sequence: &Tensor) -> CompactResult<Tensor> {
        Ok(self.sequence_lift.forward(sequence)?)
    }
}

/// Drives compaction of one gated encoder.
pub struct CompactorMixer<'a> {
    model: &'a GatedEncoderModel,
    config: CompactionConfig,
}

impl<'a> CompactorMixer<'a> {
    /// Create a mixer over `model`.
    pub fn new(model: &'a GatedEncoderModel, config: CompactionConfig) -> Self {
        Self { model, config }
    }

    /// Run compaction.
    ///
    /// The gated model is only read; both models can be used afterwards.
    ///
    /// # Errors
    ///
    /// - `EmptyMask` if any hidden-stream norm keeps nothing
    /// - `RaggedHeads` if live heads of a layer keep different widths
    /// - `MissingModule` if the pooler is required but absent
    /// - `DimensionMismatch` if the packed widths do not chain
    pub fn mix(&self) -> CompactResult<CompactedModel> {
        let model = self.model;
        let base = model.config();
        info!(
            "Compacting encoder: {} layers, hidden {}, {} heads",
            base.num_layers, base.hidden_size, base.num_heads
        );

        let emb_norm = model.embedding_norm();
        let kept_e = parse_hidden(emb_norm, "embeddings.LayerNorm")?;
        let projection = emb_norm.entry(&kept_e)?.with_explicit_bias()?;
        let embedding_norm = emb_norm.extract(&kept_e.indices)?;
        debug!("Embedding: {} of {} features kept", kept_e.len(), base.hidden_size);

        let (layers, last_norm) = model.layers().iter().enumerate().try_fold(
            (Vec::with_capacity(model.num_layers()), emb_norm),
            |(mut acc, prev), (index, layer)| {
                let (compacted, next) = compact_layer(index, prev, layer, base)?;
                acc.push(compacted);
                Ok::<_, CompactError>((acc, next))
            },
        )?;

        let kept_last = parse_hidden(last_norm, "final LayerNorm")?;
        let sequence_lift = last_norm.lift(&kept_last)?;

        let pooler = match model.pooler() {
            Some(pooler) => Some(Pooler::new(
                merge(&sequence_lift, pooler.dense())?.with_explicit_bias()?,
            )),
            None if self.config.require_pooler => return Err(CompactError::pooler_missing()),
            None => None,
        };

        let head = model
            .head()
            .map(|head| -> CompactResult<Head> {
                let dense = if head.task().reads_pooled() {
                    head.dense().detach()
                } else {
                    merge(&sequence_lift, head.dense())?
                };
                Ok(Head::new(head.task(), dense.with_explicit_bias()?))
            })
            .transpose()?;

        let config = PackedEncoderConfig {
            base: base.clone(),
            embedding_dim: kept_e.len(),
            per_layer_config: layers.iter().map(|l| l.config).collect(),
            pooler: pooler.is_some(),
        };
        config.validate()?;

        let tensors = overlay(
            model.named_tensors(""),
            &projection,
            &embedding_norm,
            &layers,
            pooler.as_ref(),
            head.as_ref(),
        );

        info!(
            "Compaction done: embedding {} -> {}, output width {}, parameters {} -> {}",
            base.hidden_size,
            config.embedding_dim,
            config.output_dim(),
            model.named_tensors("").values().map(Tensor::elem_count).sum::<usize>(),
            config.parameter_count()
        );

        Ok(CompactedModel {
            config,
            tensors,
            layers,
            sequence_lift,
            dtype: emb_norm.norm().weight().dtype(),
        })
    }
}

fn overlay(
    mut tensors: TensorMap,
    projection: &Affine,
    embedding_norm: &ManualLayerNorm,
    layers: &[CompactedLayer],
    pooler: Option<&Pooler>,
    head: Option<&Head>,
) -> TensorMap {
    projection.collect_tensors("embeddings.projection", &mut tensors);
    embedding_norm.collect_tensors("embeddings.LayerNorm", &mut tensors);
    for (i, layer) in layers.iter().enumerate() {
        layer.collect_tensors(&format!("encoder.layer.{i}"), &mut tensors);
    }
    if let Some(pooler) = pooler {
        pooler.collect_tensors("pooler", &mut tensors);
    }
    if let Some(head) = head {
        head.collect_tensors("", &mut tensors);
    }
    tensors
}

/// Compact `model` and build the packed model on its device.
pub fn compact(model: &GatedEncoderModel, config: CompactionConfig) -> CompactResult<PackedEncoderModel> {
    let compacted = CompactorMixer::new(model, config).mix()?;
    let device = model.embedding_norm().norm().weight().device().clone();
    compacted.instantiate(&device)
}
