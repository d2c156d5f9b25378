//! Shared fixtures for integration tests.
#![allow(dead_code)]

use bert_compactor_rs::prelude::*;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;

/// Gated model over a fresh VarMap, F64 on CPU.
pub fn gated_model(config: &EncoderConfig) -> (VarMap, GatedEncoderModel) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F64, &Device::Cpu);
    let model = GatedEncoderModel::new(config, vb).unwrap();
    (varmap, model)
}

/// Overwrite one variable in place; models built from `varmap` see the change.
pub fn set(varmap: &mut VarMap, name: &str, values: &[f64]) {
    let t = Tensor::new(values, &Device::Cpu).unwrap();
    varmap.set_one(name, t).unwrap();
}

fn names_matching(varmap: &VarMap, suffix: &str) -> Vec<(String, Vec<usize>)> {
    let data = varmap.data().lock().unwrap();
    let mut names: Vec<(String, Vec<usize>)> = data
        .iter()
        .filter(|(name, _)| name.ends_with(suffix))
        .map(|(name, var)| (name.clone(), var.dims().to_vec()))
        .collect();
    names.sort();
    names
}

/// Replace every compactor with the identity.
pub fn identity_compactors(varmap: &mut VarMap) {
    for suffix in ["in_comp.weight", "out_comp.weight", "compactor.weight"] {
        for (name, dims) in names_matching(varmap, suffix) {
            let eye = Tensor::eye(dims[0], DType::F64, &Device::Cpu).unwrap();
            varmap.set_one(name, eye).unwrap();
        }
    }
}

/// Non-trivial LayerNorm affine parameters.
pub fn randomize_norms(varmap: &mut VarMap, rng: &mut StdRng) {
    for (name, dims) in names_matching(varmap, "LayerNorm.weight") {
        let values: Vec<f64> = (0..dims[0]).map(|_| rng.gen_range(0.5..1.5)).collect();
        set(varmap, &name, &values);
    }
    for (name, dims) in names_matching(varmap, "LayerNorm.bias") {
        let values: Vec<f64> = (0..dims[0]).map(|_| rng.gen_range(-0.2..0.2)).collect();
        set(varmap, &name, &values);
    }
}

/// Gate vector of `width` keeping `kept` at `value`.
pub fn keep(width: usize, kept: &[usize], value: f64) -> Vec<f64> {
    let mut gates = vec![0.0; width];
    for &i in kept {
        gates[i] = value;
    }
    gates
}

/// Random gates keeping `count` of `width` features, values in `[0.5, 1.5)`.
pub fn random_gates(rng: &mut StdRng, width: usize, count: usize) -> Vec<f64> {
    let mut gates = vec![0.0; width];
    for i in sample(rng, width, count).into_vec() {
        gates[i] = rng.gen_range(0.5..1.5);
    }
    gates
}

/// Random per-head gates with the same kept count in every head.
pub fn random_head_gates(rng: &mut StdRng, num_heads: usize, head_dim: usize, count: usize) -> Vec<f64> {
    (0..num_heads)
        .flat_map(|_| random_gates(rng, head_dim, count))
        .collect()
}

/// Hidden-norm gate names in stream order: embedding norm, then norm1/norm2 per layer.
pub fn hidden_norm_names(config: &EncoderConfig) -> Vec<String> {
    let mut names = vec!["embeddings.LayerNorm.mask.gates".to_string()];
    for i in 0..config.num_layers {
        names.push(format!("encoder.layer.{i}.attention.output.LayerNorm.mask.gates"));
        names.push(format!("encoder.layer.{i}.output.LayerNorm.mask.gates"));
    }
    names
}

/// Random structured pruning over every mask of the model.
///
/// Layer 0 loses head 1; the last layer's attention block is closed; the
/// other blocks keep gates away from one.
pub fn prune_randomly(varmap: &mut VarMap, config: &EncoderConfig, rng: &mut StdRng) {
    let hidden = config.hidden_size;
    let heads = config.num_heads;
    let head_dim = config.head_dim();

    for name in hidden_norm_names(config) {
        let count = rng.gen_range(hidden / 2..=hidden);
        let gates = random_gates(rng, hidden, count);
        set(varmap, &name, &gates);
    }

    for i in 0..config.num_layers {
        let root = format!("encoder.layer.{i}");
        let qk_count = rng.gen_range(1..=head_dim);
        let vo_count = rng.gen_range(1..=head_dim);
        let qk = random_head_gates(rng, heads, head_dim, qk_count);
        let vo = random_head_gates(rng, heads, head_dim, vo_count);
        set(varmap, &format!("{root}.attention.self.query.mask.gates"), &qk);
        set(varmap, &format!("{root}.attention.self.value.mask.gates"), &vo);

        let mut head_gates: Vec<f64> = (0..heads).map(|_| rng.gen_range(0.5..1.5)).collect();
        if i == 0 && heads > 1 {
            head_gates[1] = 0.0;
        }
        set(varmap, &format!("{root}.attention.self.mask.gates"), &head_gates);

        let attn_gate = if i + 1 == config.num_layers && config.num_layers > 1 {
            0.0
        } else {
            rng.gen_range(0.5..1.5)
        };
        set(varmap, &format!("{root}.attention.output.mask.gates"), &[attn_gate]);

        let filter_count = rng.gen_range(1..=config.intermediate_size);
        let filter = random_gates(rng, config.intermediate_size, filter_count);
        set(varmap, &format!("{root}.output.dense.mask.gates"), &filter);
        set(varmap, &format!("{root}.output.mask.gates"), &[rng.gen_range(0.5..1.5)]);
    }
}

/// Token ids and a padding mask for a small batch.
pub fn batch(config: &EncoderConfig, rng: &mut StdRng) -> (Tensor, Tensor, Tensor) {
    let (b, s) = (2, 5);
    let ids: Vec<u32> = (0..b * s)
        .map(|_| rng.gen_range(0..config.vocab_size as u32))
        .collect();
    let types: Vec<u32> = (0..b * s).map(|i| u32::from(i % s >= 3)).collect();
    let ids = Tensor::from_vec(ids, (b, s), &Device::Cpu).unwrap();
    let types = Tensor::from_vec(types, (b, s), &Device::Cpu).unwrap();
    let mask = Tensor::new(&[[1u32, 1, 1, 1, 1], [1, 1, 1, 0, 0]], &Device::Cpu).unwrap();
    (ids, types, mask)
}

/// Largest absolute elementwise difference.
pub fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f64>()
        .unwrap()
}

/// Select entries `indices` of the last dimension.
pub fn select_last(x: &Tensor, indices: &[u32]) -> Tensor {
    let idx = Tensor::new(indices, x.device()).unwrap();
    x.index_select(&idx, x.rank() - 1).unwrap()
}
