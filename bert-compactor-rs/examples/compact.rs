//! Compact a gated encoder checkpoint into a packed encoder.
//!
//! Usage:
//!   cargo run --example compact -- <config.json> <gated.safetensors> <out_dir>
//!
//! Without arguments a small randomly initialized encoder is gated by hand
//! and compacted into `./packed-demo`.
//!
//! Set `RUST_LOG=debug` to see per-layer widths.

use std::path::{Path, PathBuf};
use std::time::Instant;

use bert_compactor_rs::prelude::*;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn demo_model(device: &Device) -> anyhow::Result<(VarMap, GatedEncoderModel)> {
    let config = EncoderConfig::tiny().with_task(TaskHead::SequenceClassification { num_labels: 2 });
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = GatedEncoderModel::new(&config, vb)?;

    // Keep every other hidden feature and drop one head per layer.
    let hidden: Vec<f32> = (0..config.hidden_size)
        .map(|i| if i % 2 == 0 { 1.0 } else { 0.0 })
        .collect();
    let mut heads = vec![1.0f32; config.num_heads];
    heads[config.num_heads - 1] = 0.0;

    varmap.set_one("embeddings.LayerNorm.mask.gates", Tensor::new(hidden.as_slice(), device)?)?;
    for i in 0..config.num_layers {
        for norm in ["attention.output.LayerNorm", "output.LayerNorm"] {
            varmap.set_one(
                format!("encoder.layer.{i}.{norm}.mask.gates"),
                Tensor::new(hidden.as_slice(), device)?,
            )?;
        }
        varmap.set_one(
            format!("encoder.layer.{i}.attention.self.mask.gates"),
            Tensor::new(heads.as_slice(), device)?,
        )?;
    }
    Ok((varmap, model))
}

fn load_model(config: &Path, weights: &Path, device: &Device) -> anyhow::Result<GatedEncoderModel> {
    let config = EncoderConfig::from_json_file(config)?;
    Ok(GatedEncoderModel::load(&config, weights, DType::F32, device)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let device = Device::Cpu;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let (_varmap, gated, out_dir) = match args.as_slice() {
        [config, weights, out] => (
            None,
            load_model(Path::new(config), Path::new(weights), &device)?,
            PathBuf::from(out),
        ),
        [] => {
            let (varmap, model) = demo_model(&device)?;
            (Some(varmap), model, PathBuf::from("packed-demo"))
        }
        _ => anyhow::bail!("usage: compact <config.json> <gated.safetensors> <out_dir>"),
    };

    println!("=== Encoder Compaction ===\n");
    let report = SparsityReport::from_model(&gated)?;
    println!("Embedding features kept: {:.1}%", report.embedding_hidden * 100.0);
    for (i, layer) in report.layers.iter().enumerate() {
        println!(
            "Layer {}: hidden {:.0}%/{:.0}%, heads {:.0}%, qk {:.0}%, vo {:.0}%, ffn {:.0}%{}{}",
            i,
            layer.attn_hidden * 100.0,
            layer.ffn_hidden * 100.0,
            layer.heads * 100.0,
            layer.qk * 100.0,
            layer.vo * 100.0,
            layer.filter * 100.0,
            if layer.attention_kept { "" } else { " [attention pruned]" },
            if layer.ffn_kept { "" } else { " [ffn pruned]" },
        );
    }
    println!("Expected projection parameters retained: {:.1}%\n", report.projection_fraction * 100.0);

    let start = Instant::now();
    let packed = compact(&gated, CompactionConfig::new().with_require_pooler(false))?;
    println!("Compacted in {:.2?}", start.elapsed());
    println!("Packed parameters: {}", packed.parameter_count());

    packed.save_pretrained(&out_dir)?;
    println!("Saved to {}", out_dir.display());
    Ok(())
}
