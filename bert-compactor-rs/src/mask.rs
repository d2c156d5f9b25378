//! Feature masks: per-feature keep/drop gates.
//!
//! A mask holds one learned gate per feature. Gates above the drop
//! threshold are kept; the gate value itself is a scale that compaction
//! folds into a neighbouring transform.

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{CompactError, CompactResult};
use crate::params::{join, NamedTensors, TensorMap};

/// Kept features of a mask, in ascending index order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskSelection {
    /// Gate magnitudes of the kept features
    pub values: Vec<f64>,
    /// Positions of the kept features, strictly increasing
    pub indices: Vec<u32>,
}

impl MaskSelection {
    /// Number of kept features.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when nothing is kept.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Fail with [`CompactError::EmptyMask`] when nothing is kept.
    pub fn require_nonempty(self, name: &str) -> CompactResult<Self> {
        if self.is_empty() {
            return Err(CompactError::empty_mask(name));
        }
        Ok(self)
    }

    /// Number of kept features falling in each contiguous group of `group_size`.
    pub fn group_counts(&self, num_groups: usize, group_size: usize) -> Vec<usize> {
        let mut counts = vec![0; num_groups];
        for &index in &self.indices {
            let group = index as usize / group_size;
            if group < num_groups {
                counts[group] += 1;
            }
        }
        counts
    }

    /// Keep only entries whose group is accepted by `keep`, with values
    /// multiplied by `scale(group)`.
    pub fn filter_groups(
        &self,
        group_size: usize,
        keep: impl Fn(usize) -> bool,
        scale: impl Fn(usize) -> f64,
    ) -> Self {
        let mut out = Self::default();
        for (&index, &value) in self.indices.iter().zip(&self.values) {
            let group = index as usize / group_size;
            if keep(group) {
                out.indices.push(index);
                out.values.push(value * scale(group));
            }
        }
        out
    }
}

/// Learned gates over a universe of `features` features.
#[derive(Debug, Clone)]
pub struct FeatureMask {
    gates: Tensor,
    threshold: f64,
}

impl FeatureMask {
    /// Wrap a 1D gate tensor.
    pub fn new(gates: Tensor, threshold: f64) -> CompactResult<Self> {
        gates.dims1()?;
        Ok(Self { gates, threshold })
    }

    /// Load gates named `gates` under `vb`; fresh gates start fully open.
    pub fn load(features: usize, threshold: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let gates = vb.get_with_hints(features, "gates", Init::Const(1.0))?;
        Ok(Self { gates, threshold })
    }

    /// Size of the feature universe.
    pub fn features(&self) -> usize {
        self.gates.dims().first().copied().unwrap_or(0)
    }

    /// Raw gate tensor.
    pub fn gates(&self) -> &Tensor {
        &self.gates
    }

    /// Drop threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn gate_values(&self) -> candle_core::Result<Vec<f64>> {
        self.gates.to_dtype(DType::F64)?.to_vec1::<f64>()
    }

    /// Split gates into kept `(values, indices)`.
    pub fn parse(&self) -> CompactResult<MaskSelection> {
        let mut selection = MaskSelection::default();
        for (index, gate) in self.gate_values()?.into_iter().enumerate() {
            if gate > self.threshold {
                selection.indices.push(index as u32);
                selection.values.push(gate);
            }
        }
        Ok(selection)
    }

    /// Number of kept features.
    pub fn packed_size(&self) -> CompactResult<usize> {
        Ok(self.parse()?.len())
    }

    /// Gate where kept, zero where dropped.
    pub fn effective(&self) -> candle_core::Result<Tensor> {
        let values: Vec<f64> = self
            .gate_values()?
            .into_iter()
            .map(|g| if g > self.threshold { g } else { 0.0 })
            .collect();
        let len = values.len();
        Tensor::from_vec(values, len, self.gates.device())?.to_dtype(self.gates.dtype())
    }

    /// One where kept, zero where dropped.
    pub fn indicator(&self) -> candle_core::Result<Tensor> {
        let values: Vec<f64> = self
            .gate_values()?
            .into_iter()
            .map(|g| if g > self.threshold { 1.0 } else { 0.0 })
            .collect();
        let len = values.len();
        Tensor::from_vec(values, len, self.gates.device())?.to_dtype(self.gates.dtype())
    }

    /// Scalar gate of a single-feature (block) mask, `None` when dropped.
    pub fn block_gate(&self) -> CompactResult<Option<f64>> {
        if self.features() != 1 {
            return Err(CompactError::dimension_mismatch("block gate", 1, self.features()));
        }
        Ok(self.parse()?.values.first().copied())
    }
}

impl NamedTensors for FeatureMask {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        out.insert(join(prefix, "gates"), self.gates.clone());
    }
}
