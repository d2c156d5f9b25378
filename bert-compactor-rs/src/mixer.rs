//! Affine fusion: collapsing a chain of transforms into one.
//!
//! ```text
//! merge(A, B) = B ∘ A:   W = W_B · W_A,   b = W_B · b_A + b_B
//! ```
//!
//! A missing bias counts as zero. The fused transform carries a bias
//! whenever either operand contributed one.

use candle_core::Tensor;

use crate::affine::Affine;
use crate::error::{CompactError, CompactResult};

/// Accumulator for a chain of affine transforms applied left to right.
#[derive(Debug, Clone)]
pub struct LinearMixer {
    current: Affine,
}

impl LinearMixer {
    /// Start a chain at `first`.
    pub fn new(first: Affine) -> Self {
        Self {
            current: first.detach(),
        }
    }

    /// Append `next` after the current chain.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the chain's output width differs from
    /// `next`'s input width.
    pub fn merge(self, next: &Affine) -> CompactResult<Self> {
        Ok(Self {
            current: merge(&self.current, next)?,
        })
    }

    /// Keep only the output rows at `indices`.
    pub fn merge_mask(self, indices: &[u32]) -> CompactResult<Self> {
        Ok(Self {
            current: self.current.select_rows(indices)?,
        })
    }

    /// Multiply the whole chain by a scalar gate.
    pub fn scale(self, factor: f64) -> CompactResult<Self> {
        Ok(Self {
            current: self.current.scale(factor)?,
        })
    }

    /// Current output width.
    pub fn out_features(&self) -> usize {
        self.current.out_features()
    }

    /// Finish the chain.
    pub fn into_affine(self) -> Affine {
        self.current
    }
}

/// `A` then `B`.
pub fn merge(a: &Affine, b: &Affine) -> CompactResult<Affine> {
    if a.out_features() != b.in_features() {
        return Err(CompactError::dimension_mismatch(
            "affine fusion",
            b.in_features(),
            a.out_features(),
        ));
    }
    let w_a = a.weight().detach();
    let w_b = b.weight().detach();
    let weight = w_b.matmul(&w_a)?;

    let carried = match a.bias() {
        Some(b_a) => Some(apply_weight(&w_b, &b_a.detach())?),
        None => None,
    };
    let bias = match (carried, b.bias()) {
        (Some(c), Some(b_b)) => Some(c.add(&b_b.detach())?),
        (Some(c), None) => Some(c),
        (None, Some(b_b)) => Some(b_b.detach()),
        (None, None) => None,
    };
    Affine::new(weight, bias)
}

/// Apply a transform to a single constant vector.
pub fn apply_to_vector(transform: &Affine, v: &Tensor) -> CompactResult<Tensor> {
    let len = v.dims1()?;
    if len != transform.in_features() {
        return Err(CompactError::dimension_mismatch(
            "vector transform",
            transform.in_features(),
            len,
        ));
    }
    let out = apply_weight(transform.weight(), v)?;
    Ok(match transform.bias() {
        Some(b) => out.add(b)?,
        None => out,
    })
}

fn apply_weight(weight: &Tensor, v: &Tensor) -> candle_core::Result<Tensor> {
    weight.matmul(&v.unsqueeze(1)?)?.squeeze(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Module};

    fn random_affine(out: usize, inp: usize, bias: bool) -> Affine {
        let device = Device::Cpu;
        let w = Tensor::randn(0.0f64, 1.0, (out, inp), &device).unwrap();
        let b = bias.then(|| Tensor::randn(0.0f64, 1.0, out, &device).unwrap());
        Affine::new(w, b).unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        let a: Vec<f64> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f64> = b.flatten_all().unwrap().to_vec1().unwrap();
        a.iter().zip(&b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn test_merge_matches_sequential() {
        let a = random_affine(5, 4, true);
        let b = random_affine(3, 5, true);
        let x = Tensor::randn(0.0f64, 1.0, (6, 4), &Device::Cpu).unwrap();

        let sequential = b.forward(&a.forward(&x).unwrap()).unwrap();
        let fused = merge(&a, &b).unwrap();
        assert_eq!(fused.in_features(), 4);
        assert_eq!(fused.out_features(), 3);
        assert!(max_diff(&fused.forward(&x).unwrap(), &sequential) < 1e-10);
    }

    #[test]
    fn test_bias_presence() {
        let no_bias = merge(&random_affine(3, 3, false), &random_affine(3, 3, false)).unwrap();
        assert!(no_bias.bias().is_none());

        let first_only = merge(&random_affine(3, 3, true), &random_affine(2, 3, false)).unwrap();
        assert!(first_only.bias().is_some());

        let second_only = merge(&random_affine(3, 3, false), &random_affine(2, 3, true)).unwrap();
        assert!(second_only.bias().is_some());
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = merge(&random_affine(5, 4, true), &random_affine(3, 6, true)).unwrap_err();
        assert!(matches!(
            err,
            CompactError::DimensionMismatch {
                expected: 6,
                got: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_mixer_chain_and_mask() {
        let a = random_affine(6, 4, true);
        let b = random_affine(5, 6, false);
        let x = Tensor::randn(0.0f64, 1.0, (2, 4), &Device::Cpu).unwrap();
        let indices = [0u32, 4];

        let fused = LinearMixer::new(a.clone())
            .merge(&b)
            .unwrap()
            .merge_mask(&indices)
            .unwrap()
            .into_affine();

        let expected = b
            .forward(&a.forward(&x).unwrap())
            .unwrap()
            .index_select(&Tensor::new(&indices, &Device::Cpu).unwrap(), 1)
            .unwrap();
        assert!(max_diff(&fused.forward(&x).unwrap(), &expected) < 1e-10);
    }

    #[test]
    fn test_apply_to_vector() {
        let device = Device::Cpu;
        let a = Affine::new(
            Tensor::new(&[[1.0f64, 2.0], [0.0, -1.0]], &device).unwrap(),
            Some(Tensor::new(&[0.5f64, 0.5], &device).unwrap()),
        )
        .unwrap();
        let v = Tensor::new(&[1.0f64, 1.0], &device).unwrap();
        let out: Vec<f64> = apply_to_vector(&a, &v).unwrap().to_vec1().unwrap();
        assert_eq!(out, vec![3.5, -0.5]);

        let wrong = Tensor::zeros(3, DType::F64, &device).unwrap();
        assert!(apply_to_vector(&a, &wrong).is_err());
    }
}
