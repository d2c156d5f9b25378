//! Named parameter maps used to move weights between architectures.
//!
//! Both encoders expose their tensors under dotted names. Reassembly
//! overlays fused tensors onto the gated model's map and lets the packed
//! model pick what it needs through a `VarBuilder`; names it never asks for
//! are left behind.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::error::CompactResult;

/// Parameter name → tensor.
pub type TensorMap = HashMap<String, Tensor>;

/// Modules that can list their tensors under a name prefix.
pub trait NamedTensors {
    /// Insert every tensor of this module into `out`, prefixed with `prefix`.
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap);

    /// Collect into a fresh map.
    fn named_tensors(&self, prefix: &str) -> TensorMap {
        let mut out = TensorMap::new();
        self.collect_tensors(prefix, &mut out);
        out
    }
}

/// Join a prefix and a name with a dot, skipping empty prefixes.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Build a `VarBuilder` backed by a tensor map.
///
/// Lookups of names absent from the map fail; extra names are ignored.
pub fn var_builder(tensors: TensorMap, dtype: DType, device: &Device) -> VarBuilder<'static> {
    VarBuilder::from_tensors(tensors, dtype, device)
}

/// Save a tensor map in safetensors format.
pub fn save_safetensors(tensors: &TensorMap, path: &Path) -> CompactResult<()> {
    candle_core::safetensors::save(tensors, path)?;
    Ok(())
}

/// Load a tensor map from a safetensors file.
pub fn load_safetensors(path: &Path, device: &Device) -> CompactResult<TensorMap> {
    Ok(candle_core::safetensors::load(path, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("", "weight"), "weight");
        assert_eq!(join("pooler.dense", "bias"), "pooler.dense.bias");
    }

    #[test]
    fn test_var_builder_ignores_extra_names() {
        let device = Device::Cpu;
        let mut tensors = TensorMap::new();
        tensors.insert(
            "kept.weight".to_string(),
            Tensor::ones((2, 3), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "mask.gates".to_string(),
            Tensor::ones(3, DType::F32, &device).unwrap(),
        );

        let vb = var_builder(tensors, DType::F32, &device);
        let weight = vb.get((2, 3), "kept.weight").unwrap();
        assert_eq!(weight.dims(), &[2, 3]);
        assert!(vb.get(4, "absent").is_err());
    }

    #[test]
    fn test_safetensors_roundtrip() {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let mut tensors = TensorMap::new();
        tensors.insert(
            "a".to_string(),
            Tensor::new(&[1.0f64, 2.0, 3.0], &device).unwrap(),
        );
        save_safetensors(&tensors, &path).unwrap();

        let loaded = load_safetensors(&path, &device).unwrap();
        let values: Vec<f64> = loaded["a"].to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }
}
