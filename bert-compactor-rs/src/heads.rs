//! Pooler and task heads shared by both encoders.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::affine::Affine;
use crate::config::TaskHead;
use crate::params::{join, NamedTensors, TensorMap};

/// Everything an encoder forward pass produces.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Final hidden stream `(batch, seq, width)`
    pub sequence_output: Tensor,
    /// `tanh(dense(h[CLS]))`, when the encoder has a pooler
    pub pooled_output: Option<Tensor>,
    /// Task-head logits, when the encoder has a head
    pub logits: Option<Tensor>,
}

/// `[CLS]` pooler: dense layer plus tanh on the first position.
#[derive(Debug, Clone)]
pub struct Pooler {
    dense: Affine,
}

impl Pooler {
    /// Wrap a fused or loaded dense transform.
    pub fn new(dense: Affine) -> Self {
        Self { dense }
    }

    /// Load `dense` under `vb` (usually `pooler`).
    pub fn load(in_features: usize, out_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: Affine::load(in_features, out_features, vb.pp("dense"))?,
        })
    }

    /// Dense transform.
    pub fn dense(&self) -> &Affine {
        &self.dense
    }
}

impl Module for Pooler {
    fn forward(&self, sequence: &Tensor) -> Result<Tensor> {
        let first = sequence.i((.., 0))?;
        self.dense.forward(&first)?.tanh()
    }
}

impl NamedTensors for Pooler {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.dense.collect_tensors(&join(prefix, "dense"), out);
    }
}

/// Task head and the transform it applies.
#[derive(Debug, Clone)]
pub struct Head {
    task: TaskHead,
    dense: Affine,
}

impl Head {
    /// Wrap a fused or loaded transform.
    pub fn new(task: TaskHead, dense: Affine) -> Self {
        Self { task, dense }
    }

    /// Load the head named after its task prefix.
    pub fn load(task: TaskHead, in_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            task,
            dense: Affine::load(in_features, task.out_features(), vb.pp(task.prefix()))?,
        })
    }

    /// Task kind.
    pub fn task(&self) -> TaskHead {
        self.task
    }

    /// Dense transform.
    pub fn dense(&self) -> &Affine {
        &self.dense
    }

    /// Logits from whichever stream the task reads.
    pub fn forward(&self, sequence: &Tensor, pooled: Option<&Tensor>) -> Result<Tensor> {
        if self.task.reads_pooled() {
            let pooled = pooled.ok_or_else(|| {
                candle_core::Error::Msg("classification head requires pooled output".to_string())
            })?;
            self.dense.forward(pooled)
        } else {
            self.dense.forward(sequence)
        }
    }
}

impl NamedTensors for Head {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        self.dense
            .collect_tensors(&join(prefix, self.task.prefix()), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_pooler_reads_first_position() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let pooler = Pooler::load(4, 3, vb.pp("pooler")).unwrap();

        let seq = Tensor::randn(0.0f64, 1.0, (2, 5, 4), &device).unwrap();
        let pooled = pooler.forward(&seq).unwrap();
        assert_eq!(pooled.dims(), &[2, 3]);

        let names = pooler.named_tensors("pooler");
        assert!(names.contains_key("pooler.dense.weight"));
    }

    #[test]
    fn test_heads_pick_their_stream() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, &device);
        let seq = Tensor::randn(0.0f64, 1.0, (2, 5, 4), &device).unwrap();
        let pooled = Tensor::randn(0.0f64, 1.0, (2, 4), &device).unwrap();

        let qa = Head::load(TaskHead::QuestionAnswering, 4, vb.clone()).unwrap();
        assert_eq!(qa.forward(&seq, None).unwrap().dims(), &[2, 5, 2]);

        let cls = Head::load(TaskHead::SequenceClassification { num_labels: 3 }, 4, vb).unwrap();
        assert_eq!(cls.forward(&seq, Some(&pooled)).unwrap().dims(), &[2, 3]);
        assert!(cls.forward(&seq, None).is_err());
    }
}
