//! Compaction of gated BERT-style encoders into packed dense encoders.
//!
//! A gated encoder is trained with a mask over every prunable feature group
//! (hidden features at each LayerNorm, query/key and value/output dims per
//! head, whole heads, feed-forward neurons, whole sub-blocks) plus square
//! compactors around each normalization and projection. This crate folds
//! those masks and compactors into the surrounding affine transforms and
//! produces a smaller encoder that computes the same function on the kept
//! features:
//! - Gate folding: kept gate values are absorbed into adjacent transforms
//! - Compactor fusion: compactors are reduced to the kept rows/columns and
//!   merged with their neighbours
//! - Residual re-expression: skip connections between differently sized
//!   kept-feature sets become explicit transforms
//!
//! # Example
//!
//! ```no_run
//! use bert_compactor_rs::prelude::*;
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let config = EncoderConfig::tiny();
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let gated = GatedEncoderModel::new(&config, vb).unwrap();
//!
//! let packed = compact(&gated, CompactionConfig::default()).unwrap();
//! println!("{} parameters", packed.parameter_count());
//! ```

pub mod affine;
pub mod attention;
pub mod compact;
pub mod compactor;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gated;
pub mod heads;
pub mod mask;
pub mod mixer;
pub mod norm;
pub mod packed;
pub mod params;
pub mod reassemble;
pub mod sparsity;

pub use affine::Affine;
pub use compact::{compact_layer, CompactedLayer};
pub use compactor::{Compactor, PrunableLinear, Side, StageLayout};
pub use config::{CompactionConfig, EncoderConfig, PackedEncoderConfig, PackedLayerConfig, TaskHead};
pub use error::{CompactError, CompactResult};
pub use gated::GatedEncoderModel;
pub use heads::EncoderOutput;
pub use mask::{FeatureMask, MaskSelection};
pub use mixer::{merge, LinearMixer};
pub use norm::{ManualLayerNorm, NormWithCompactor};
pub use packed::PackedEncoderModel;
pub use params::{NamedTensors, TensorMap};
pub use reassemble::{compact, CompactedModel, CompactorMixer};
pub use sparsity::SparsityReport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{CompactionConfig, EncoderConfig, PackedEncoderConfig, TaskHead};
    pub use crate::error::{CompactError, CompactResult};
    pub use crate::gated::GatedEncoderModel;
    pub use crate::packed::PackedEncoderModel;
    pub use crate::params::NamedTensors;
    pub use crate::reassemble::{compact, CompactedModel, CompactorMixer};
    pub use crate::sparsity::SparsityReport;
}
