//! Compactors and prunable affine stages.
//!
//! A compactor is a square, bias-free probe placed next to a mask during
//! training. After training it is reduced to the kept rows or columns and
//! fused into a neighbouring dense transform; it never appears in the packed
//! architecture.

use candle_core::{Module, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::affine::Affine;
use crate::error::{CompactError, CompactResult};
use crate::mask::FeatureMask;
use crate::params::{join, NamedTensors, TensorMap};

/// Which side of a compactor the kept features live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Kept features index the compactor's input: select columns, `K → D`
    Input,
    /// Kept features index the compactor's output: select rows, `D → K`
    Output,
}

/// Square `D×D` probe transform.
#[derive(Debug, Clone)]
pub struct Compactor {
    weight: Tensor,
}

impl Compactor {
    /// Wrap an existing square weight.
    pub fn new(weight: Tensor) -> CompactResult<Self> {
        let (rows, cols) = weight.dims2()?;
        if rows != cols {
            return Err(CompactError::dimension_mismatch("compactor", rows, cols));
        }
        Ok(Self { weight })
    }

    /// Load (or initialize) a compactor over `size` features.
    pub fn load(size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let stdev = 1.0 / (size as f64).sqrt();
        let weight = vb.get_with_hints((size, size), "weight", Init::Randn { mean: 0.0, stdev })?;
        Ok(Self { weight })
    }

    /// Number of features on either side.
    pub fn size(&self) -> usize {
        self.weight.dims().first().copied().unwrap_or(0)
    }

    /// Weight `[D, D]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Reduce to the kept features, optionally scaling each by its gate.
    ///
    /// `Side::Output` keeps rows (`D → K`) and scales rows; `Side::Input`
    /// keeps columns (`K → D`) and scales columns.
    pub fn extract(&self, side: Side, indices: &[u32], values: Option<&[f64]>) -> CompactResult<Affine> {
        let full = Affine::new(self.weight.detach(), None)?;
        match side {
            Side::Output => {
                let reduced = full.select_rows(indices)?;
                match values {
                    Some(v) => reduced.scale_rows(v),
                    None => Ok(reduced),
                }
            }
            Side::Input => {
                let reduced = full.select_columns(indices)?;
                match values {
                    Some(v) => reduced.scale_columns(v),
                    None => Ok(reduced),
                }
            }
        }
    }
}

impl Module for Compactor {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.broadcast_matmul(&self.weight.t()?)
    }
}

impl NamedTensors for Compactor {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        out.insert(join(prefix, "weight"), self.weight.clone());
    }
}

/// Where a prunable stage carries its compactor and its bare mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLayout {
    /// Side of the base transform holding a compactor
    pub compactor: Option<Side>,
    /// Side of the base transform holding a selection mask
    pub mask: Option<Side>,
}

impl StageLayout {
    /// Query and value projections: compactor then mask after the base.
    pub const GATED_OUTPUT: Self = Self {
        compactor: Some(Side::Output),
        mask: Some(Side::Output),
    };
    /// Key projection: compactor after, mask shared with the query.
    pub const COMPACTOR_AFTER: Self = Self {
        compactor: Some(Side::Output),
        mask: None,
    };
    /// Attention output projection: compactor before the base.
    pub const COMPACTOR_BEFORE: Self = Self {
        compactor: Some(Side::Input),
        mask: None,
    };
    /// Feed-forward down-projection: mask before the base.
    pub const MASK_BEFORE: Self = Self {
        compactor: None,
        mask: Some(Side::Input),
    };
}

/// Base affine transform wrapped with an optional compactor and mask.
#[derive(Debug, Clone)]
pub struct PrunableLinear {
    base: Affine,
    compactor: Option<Compactor>,
    mask: Option<FeatureMask>,
    layout: StageLayout,
}

impl PrunableLinear {
    /// Assemble from parts; the parts must agree with `layout`.
    pub fn new(
        base: Affine,
        compactor: Option<Compactor>,
        mask: Option<FeatureMask>,
        layout: StageLayout,
    ) -> CompactResult<Self> {
        let check = |side: Side, size: usize, what: &str| -> CompactResult<()> {
            let expected = match side {
                Side::Input => base.in_features(),
                Side::Output => base.out_features(),
            };
            if expected != size {
                return Err(CompactError::dimension_mismatch(what, expected, size));
            }
            Ok(())
        };
        match (layout.compactor, &compactor) {
            (Some(side), Some(c)) => check(side, c.size(), "stage compactor")?,
            (None, None) => {}
            _ => return Err(CompactError::invalid_config("compactor does not match stage layout")),
        }
        match (layout.mask, &mask) {
            (Some(side), Some(m)) => check(side, m.features(), "stage mask")?,
            (None, None) => {}
            _ => return Err(CompactError::invalid_config("mask does not match stage layout")),
        }
        Ok(Self {
            base,
            compactor,
            mask,
            layout,
        })
    }

    /// Load a stage under `vb`: base at `vb`, compactor at `compactor`, mask at `mask`.
    pub fn load(
        in_features: usize,
        out_features: usize,
        layout: StageLayout,
        threshold: f64,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let base = Affine::load(in_features, out_features, vb.clone())?;
        let side_size = |side: Side| match side {
            Side::Input => in_features,
            Side::Output => out_features,
        };
        let compactor = layout
            .compactor
            .map(|side| Compactor::load(side_size(side), vb.pp("compactor")))
            .transpose()?;
        let mask = layout
            .mask
            .map(|side| FeatureMask::load(side_size(side), threshold, vb.pp("mask")))
            .transpose()?;
        Ok(Self {
            base,
            compactor,
            mask,
            layout,
        })
    }

    /// Bare base transform.
    pub fn extract(&self) -> Affine {
        self.base.detach()
    }

    /// Base transform restricted to the input columns at `indices`, each
    /// column scaled by the matching gate value.
    pub fn extract_columns(&self, indices: &[u32], values: &[f64]) -> CompactResult<Affine> {
        self.base.detach().select_columns(indices)?.scale_columns(values)
    }

    /// Stage layout.
    pub fn layout(&self) -> StageLayout {
        self.layout
    }

    /// Mask, if this stage carries one.
    pub fn mask(&self) -> Option<&FeatureMask> {
        self.mask.as_ref()
    }

    /// Compactor, if this stage carries one.
    pub fn compactor(&self) -> Option<&Compactor> {
        self.compactor.as_ref()
    }

    fn apply_mask(&self, side: Side, x: Tensor) -> candle_core::Result<Tensor> {
        match (&self.mask, self.layout.mask) {
            (Some(mask), Some(s)) if s == side => x.broadcast_mul(&mask.effective()?),
            _ => Ok(x),
        }
    }

    fn apply_compactor(&self, side: Side, x: Tensor) -> candle_core::Result<Tensor> {
        match (&self.compactor, self.layout.compactor) {
            (Some(c), Some(s)) if s == side => c.forward(&x),
            _ => Ok(x),
        }
    }
}

impl Module for PrunableLinear {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.apply_mask(Side::Input, x.clone())?;
        let x = self.apply_compactor(Side::Input, x)?;
        let x = self.base.forward(&x)?;
        let x = self.apply_compactor(Side::Output, x)?;
        self.apply_mask(Side::Output, x)
    }
}

impl NamedTensors for PrunableLinear {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.base.collect_tensors(prefix, out);
        if let Some(c) = &self.compactor {
            c.collect_tensors(&join(prefix, "compactor"), out);
        }
        if let Some(m) = &self.mask {
            m.collect_tensors(&join(prefix, "mask"), out);
        }
    }
}
