//! Per-layer compaction.
//!
//! [`compact_layer`] is one step of a fold over the encoder layers: it takes
//! the norm whose output feeds the layer (the embedding norm for layer 0,
//! otherwise the previous layer's `norm2`) and returns the fused layer plus
//! the norm that feeds the next one.
//!
//! Every consumer of a gated norm sees `out_comp(g ⊙ n)`, where `n` is the
//! normalized stream. The packed stream carries only the kept entries of
//! `n`, so each consumer starts from `lift = out_comp.extract(Input, idx, g)`.
//! Every producer feeding a gated norm ends with
//! `entry = in_comp.extract(Output, idx, g)`.

use candle_core::Tensor;
use tracing::{debug, warn};

use crate::affine::Affine;
use crate::compactor::{Compactor, PrunableLinear, Side};
use crate::config::{EncoderConfig, PackedLayerConfig};
use crate::error::{CompactError, CompactResult};
use crate::gated::{GatedFeedForward, GatedLayer, GatedSelfAttention};
use crate::mask::{FeatureMask, MaskSelection};
use crate::mixer::{apply_to_vector, merge, LinearMixer};
use crate::norm::{ManualLayerNorm, NormWithCompactor};
use crate::params::{join, NamedTensors, TensorMap};

/// Fused attention transforms of one layer.
#[derive(Debug, Clone)]
pub struct CompactedAttention {
    /// `K0 → qk_dim`, absent when no query/key dim survives
    pub query: Option<Affine>,
    /// `K0 → qk_dim`, absent when no query/key dim survives
    pub key: Option<Affine>,
    /// `K0 → vo_dim`
    pub value: Affine,
    /// `vo_dim → K1`
    pub output: Affine,
}

/// Fused feed-forward transforms of one layer.
#[derive(Debug, Clone)]
pub struct CompactedFeedForward {
    /// `K1 → ffn_dim`
    pub intermediate: Affine,
    /// `ffn_dim → K2`
    pub output: Affine,
}

/// Result of compacting one encoder layer.
#[derive(Debug, Clone)]
pub struct CompactedLayer {
    /// Packed widths
    pub config: PackedLayerConfig,
    /// Attention block, absent when pruned
    pub attention: Option<CompactedAttention>,
    /// `K0 → K1` skip connection
    pub attn_residual: Affine,
    /// Norm over the `K1` kept features
    pub norm1: ManualLayerNorm,
    /// Feed-forward block, absent when pruned
    pub ffn: Option<CompactedFeedForward>,
    /// `K1 → K2` skip connection
    pub ffn_residual: Affine,
    /// Norm over the `K2` kept features
    pub norm2: ManualLayerNorm,
}

impl NamedTensors for CompactedLayer {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        if let Some(attn) = &self.attention {
            let self_prefix = join(prefix, "attention.self");
            if let Some(q) = &attn.query {
                q.collect_tensors(&join(&self_prefix, "query"), out);
            }
            if let Some(k) = &attn.key {
                k.collect_tensors(&join(&self_prefix, "key"), out);
            }
            attn.value.collect_tensors(&join(&self_prefix, "value"), out);
            attn.output
                .collect_tensors(&join(prefix, "attention.output.dense"), out);
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

/// Surviving heads of one attention block.
#[derive(Debug, Clone)]
struct HeadPlan {
    live: Vec<usize>,
    qk: MaskSelection,
    vo: MaskSelection,
    block_gate: f64,
}

/// Kept features of a hidden-stream norm; empty is refused.
pub fn parse_hidden(norm: &NormWithCompactor, name: &str) -> CompactResult<MaskSelection> {
    norm.mask().parse()?.require_nonempty(name)
}

fn stage_mask<'a>(stage: &'a PrunableLinear, name: &str) -> CompactResult<&'a FeatureMask> {
    stage
        .mask()
        .ok_or_else(|| CompactError::missing_module(format!("{name}.mask")))
}

fn stage_compactor<'a>(
    stage: &'a PrunableLinear,
    name: &str,
) -> CompactResult<&'a Compactor> {
    stage
        .compactor()
        .ok_or_else(|| CompactError::missing_module(format!("{name}.compactor")))
}

fn uniform_counts(
    layer: usize,
    projection: &'static str,
    selection: &MaskSelection,
    live: &[usize],
    num_heads: usize,
    head_dim: usize,
) -> CompactResult<usize> {
    let all = selection.group_counts(num_heads, head_dim);
    let counts: Vec<usize> = live.iter().map(|&h| all[h]).collect();
    match counts.first() {
        Some(&first) if counts.iter().all(|&c| c == first) => Ok(first),
        Some(_) => Err(CompactError::RaggedHeads {
            layer,
            projection,
            counts,
        }),
        None => Ok(0),
    }
}

fn plan_heads(
    index: usize,
    attention: &GatedSelfAttention,
) -> CompactResult<Option<HeadPlan>> {
    let Some(block_gate) = attention.block_mask().block_gate()? else {
        return Ok(None);
    };

    let num_heads = attention.num_heads();
    let head_dim = attention.head_dim();
    let heads = attention.head_mask().parse()?;
    let mut head_gates = vec![None; num_heads];
    for (&h, &value) in heads.indices.iter().zip(&heads.values) {
        if let Some(slot) = head_gates.get_mut(h as usize) {
            *slot = Some(value);
        }
    }

    let qk = stage_mask(attention.query(), "attention.self.query")?.parse()?;
    let vo = stage_mask(attention.value(), "attention.self.value")?.parse()?;

    let vo_counts = vo.group_counts(num_heads, head_dim);
    let live: Vec<usize> = (0..num_heads)
        .filter(|&h| head_gates[h].is_some() && vo_counts[h] > 0)
        .collect();
    if live.is_empty() {
        return Ok(None);
    }

    uniform_counts(index, "query/key", &qk, &live, num_heads, head_dim)?;
    uniform_counts(index, "value/output", &vo, &live, num_heads, head_dim)?;

    let is_live = |h: usize| live.contains(&h);
    let qk = qk.filter_groups(head_dim, is_live, |_| 1.0);
    let vo = vo.filter_groups(head_dim, is_live, |h| head_gates[h].unwrap_or(0.0));

    Ok(Some(HeadPlan {
        live,
        qk,
        vo,
        block_gate,
    }))
}

fn fuse_attention(
    plan: &HeadPlan,
    attention: &GatedSelfAttention,
    lift0: &Affine,
    entry1: &Affine,
) -> CompactResult<CompactedAttention> {
    let query_stage = attention.query();
    let key_stage = attention.key();
    let value_stage = attention.value();
    let output_stage = attention.output();

    // Only the query absorbs the query/key gate; the key keeps it as 0/1.
    let (query, key) = if plan.qk.is_empty() {
        (None, None)
    } else {
        let q_comp = stage_compactor(query_stage, "attention.self.query")?.extract(
            Side::Output,
            &plan.qk.indices,
            Some(&plan.qk.values),
        )?;
        let k_comp = stage_compactor(key_stage, "attention.self.key")?.extract(
            Side::Output,
            &plan.qk.indices,
            None,
        )?;
        let query = LinearMixer::new(lift0.clone())
            .merge(&query_stage.extract())?
            .merge(&q_comp)?
            .into_affine();
        let key = LinearMixer::new(lift0.clone())
            .merge(&key_stage.extract())?
            .merge(&k_comp)?
            .into_affine();
        (Some(query.with_explicit_bias()?), Some(key.with_explicit_bias()?))
    };

    let v_comp = stage_compactor(value_stage, "attention.self.value")?.extract(
        Side::Output,
        &plan.vo.indices,
        Some(&plan.vo.values),
    )?;
    let value = LinearMixer::new(lift0.clone())
        .merge(&value_stage.extract())?
        .merge(&v_comp)?
        .into_affine();

    let o_comp = stage_compactor(output_stage, "attention.output.dense")?.extract(
        Side::Input,
        &plan.vo.indices,
        None,
    )?;
    let output = LinearMixer::new(o_comp)
        .merge(&output_stage.extract())?
        .scale(plan.block_gate)?
        .merge(entry1)?
        .into_affine();

    Ok(CompactedAttention {
        query,
        key,
        value: value.with_explicit_bias()?,
        output: output.with_explicit_bias()?,
    })
}

fn fuse_ffn(
    index: usize,
    ffn: &GatedFeedForward,
    lift1: &Affine,
    entry2: &Affine,
) -> CompactResult<(Option<CompactedFeedForward>, Option<Tensor>)> {
    let down = ffn.output();
    let filter = stage_mask(down, "output.dense")?.parse()?;
    let Some(block_gate) = ffn.block_mask().block_gate()? else {
        warn!("Layer {}: feed-forward block gate closed, pruning block", index);
        return Ok((None, None));
    };

    if filter.is_empty() {
        warn!("Layer {}: no feed-forward neuron survives, pruning block", index);
        let constant = down.extract().bias_or_zeros()?.affine(block_gate, 0.0)?;
        return Ok((None, Some(apply_to_vector(entry2, &constant)?)));
    }

    let intermediate = LinearMixer::new(lift1.clone())
        .merge(&ffn.intermediate().detach())?
        .merge_mask(&filter.indices)?
        .into_affine();
    let output = LinearMixer::new(down.extract_columns(&filter.indices, &filter.values)?)
        .scale(block_gate)?
        .merge(entry2)?
        .into_affine();

    Ok((
        Some(CompactedFeedForward {
            intermediate: intermediate.with_explicit_bias()?,
            output: output.with_explicit_bias()?,
        }),
        None,
    ))
}

/// Compact one encoder layer.
///
/// Returns the fused layer and `layer.norm2()`, which feeds the next layer.
///
/// # Errors
///
/// - `EmptyMask` if a hidden-stream norm keeps nothing
/// - `RaggedHeads` if live heads keep different widths
/// - `MissingModule` if a stage lacks its mask or compactor
pub fn compact_layer<'a>(
    index: usize,
    prev_norm: &NormWithCompactor,
    layer: &'a GatedLayer,
    config: &EncoderConfig,
) -> CompactResult<(CompactedLayer, &'a NormWithCompactor)> {
    let attention = layer.attention();
    if attention.num_heads() != config.num_heads || attention.head_dim() != config.head_dim() {
        return Err(CompactError::dimension_mismatch(
            format!("layer {index} head layout"),
            config.num_heads,
            attention.num_heads(),
        ));
    }

    let kept0 = parse_hidden(prev_norm, &format!("layer {index} input LayerNorm"))?;
    let kept1 = parse_hidden(
        layer.norm1(),
        &format!("encoder.layer.{index}.attention.output.LayerNorm"),
    )?;
    let kept2 = parse_hidden(layer.norm2(), &format!("encoder.layer.{index}.output.LayerNorm"))?;

    let norm1 = layer.norm1().extract(&kept1.indices)?;
    let norm2 = layer.norm2().extract(&kept2.indices)?;

    let lift0 = prev_norm.lift(&kept0)?;
    let entry1 = layer.norm1().entry(&kept1)?;
    let lift1 = layer.norm1().lift(&kept1)?;
    let entry2 = layer.norm2().entry(&kept2)?;

    let mut attn_residual = merge(&lift0, &entry1)?;
    let plan = plan_heads(index, attention)?;
    let compacted_attention = match &plan {
        Some(plan) => Some(fuse_attention(plan, attention, &lift0, &entry1)?),
        None => {
            warn!("Layer {}: no attention head survives, pruning block", index);
            if let Some(block_gate) = attention.block_mask().block_gate()? {
                let constant = attention
                    .output()
                    .extract()
                    .bias_or_zeros()?
                    .affine(block_gate, 0.0)?;
                attn_residual = attn_residual.with_bias_offset(&apply_to_vector(&entry1, &constant)?)?;
            }
            None
        }
    };

    let mut ffn_residual = merge(&lift1, &entry2)?;
    let (compacted_ffn, ffn_constant) = fuse_ffn(index, layer.ffn(), &lift1, &entry2)?;
    if let Some(constant) = ffn_constant {
        ffn_residual = ffn_residual.with_bias_offset(&constant)?;
    }

    let (num_heads, qk_dim, vo_dim) = match &plan {
        Some(p) => (p.live.len(), p.qk.len(), p.vo.len()),
        None => (0, 0, 0),
    };
    let packed = PackedLayerConfig {
        input_dim: kept0.len(),
        attn_output_dim: kept1.len(),
        ffn_output_dim: kept2.len(),
        num_heads,
        qk_dim,
        vo_dim,
        ffn_dim: compacted_ffn
            .as_ref()
            .map_or(0, |f| f.intermediate.out_features()),
        prune_attn: compacted_attention.is_none(),
        prune_ffn: compacted_ffn.is_none(),
    };

    debug!(
        "Layer {}: widths {} -> {} -> {}, heads {}, qk {}, vo {}, ffn {}",
        index,
        packed.input_dim,
        packed.attn_output_dim,
        packed.ffn_output_dim,
        packed.num_heads,
        packed.qk_dim,
        packed.vo_dim,
        packed.ffn_dim
    );

    Ok((
        CompactedLayer {
            config: packed,
            attention: compacted_attention,
            attn_residual: attn_residual.with_explicit_bias()?,
            norm1,
            ffn: compacted_ffn,
            ffn_residual: ffn_residual.with_explicit_bias()?,
            norm2,
        },
        layer.norm2(),
    ))
}
