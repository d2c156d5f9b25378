//! Configuration for gated encoders, compaction runs and packed encoders.
//!
//! `EncoderConfig` describes the architecture the gates were trained on.
//! `PackedEncoderConfig` is derived by the compaction engine and describes
//! the smaller architecture; it is never written by hand.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CompactError, CompactResult};

/// Task head stacked on top of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskHead {
    /// Linear classifier over the pooled `[CLS]` representation.
    SequenceClassification {
        /// Number of output labels
        num_labels: usize,
    },
    /// Start/end span logits over every sequence position.
    QuestionAnswering,
}

impl TaskHead {
    /// Parameter prefix of the head.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::SequenceClassification { .. } => "classifier",
            Self::QuestionAnswering => "qa_outputs",
        }
    }

    /// Number of logits produced per input (or per position).
    pub fn out_features(&self) -> usize {
        match self {
            Self::SequenceClassification { num_labels } => *num_labels,
            Self::QuestionAnswering => 2,
        }
    }

    /// Whether the head reads the pooled output rather than the sequence.
    pub fn reads_pooled(&self) -> bool {
        matches!(self, Self::SequenceClassification { .. })
    }
}

/// Architecture of the gated (training-time) encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden dimension size
    pub hidden_size: usize,
    /// Number of encoder layers
    pub num_layers: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Feed-forward intermediate dimension
    pub intermediate_size: usize,
    /// Maximum number of positions
    pub max_position_embeddings: usize,
    /// Number of token types (segments)
    pub type_vocab_size: usize,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
    /// Gates at or below this value are treated as dropped
    pub gate_threshold: f64,
    /// Whether the encoder carries a `[CLS]` pooler
    pub add_pooler: bool,
    /// Optional task head
    pub task: Option<TaskHead>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::base()
    }
}

impl EncoderConfig {
    /// BERT-base sized encoder
    pub fn base() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            gate_threshold: 0.0,
            add_pooler: true,
            task: None,
        }
    }

    /// Small multi-layer encoder for integration tests
    pub fn tiny() -> Self {
        Self {
            vocab_size: 64,
            hidden_size: 16,
            num_layers: 3,
            num_heads: 4,
            intermediate_size: 32,
            max_position_embeddings: 32,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            gate_threshold: 0.0,
            add_pooler: true,
            task: None,
        }
    }

    /// Single-layer configuration (minimal for unit tests)
    pub fn test() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 8,
            num_layers: 1,
            num_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            gate_threshold: 0.0,
            add_pooler: true,
            task: None,
        }
    }

    /// Attach a task head.
    #[must_use]
    pub fn with_task(mut self, task: TaskHead) -> Self {
        self.task = Some(task);
        self
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// Dense parameter count of the projection matrices (no embeddings).
    pub fn projection_parameter_count(&self) -> usize {
        let d = self.hidden_size;
        let f = self.intermediate_size;
        (4 * d * d + 2 * d * f) * self.num_layers
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a width is zero, heads do not divide the hidden size,
    /// or a classification head has no pooler to read from.
    pub fn validate(&self) -> CompactResult<()> {
        if self.hidden_size == 0 || self.intermediate_size == 0 || self.num_heads == 0 {
            return Err(CompactError::invalid_config(
                "hidden_size, intermediate_size and num_heads must be > 0",
            ));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(CompactError::invalid_config(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.gate_threshold) {
            return Err(CompactError::invalid_config(
                "gate_threshold must be in [0, 1)",
            ));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(CompactError::invalid_config("layer_norm_eps must be > 0"));
        }
        if let Some(task) = self.task {
            if task.reads_pooled() && !self.add_pooler {
                return Err(CompactError::invalid_config(
                    "sequence classification head requires a pooler",
                ));
            }
            if task.out_features() == 0 {
                return Err(CompactError::invalid_config("task head has no outputs"));
            }
        }
        Ok(())
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> CompactResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn to_json_file(&self, path: &Path) -> CompactResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Options for one compaction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Abort when the gated model has no pooler.
    pub require_pooler: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            require_pooler: true,
        }
    }
}

impl CompactionConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require (or not) a pooler on the gated model.
    #[must_use]
    pub const fn with_require_pooler(mut self, required: bool) -> Self {
        self.require_pooler = required;
        self
    }
}

/// Structural widths of one packed encoder layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedLayerConfig {
    /// Width of the incoming hidden stream
    pub input_dim: usize,
    /// Width of the stream after the attention sub-block
    pub attn_output_dim: usize,
    /// Width of the stream after the feed-forward sub-block
    pub ffn_output_dim: usize,
    /// Number of live attention heads
    pub num_heads: usize,
    /// Retained query/key width summed over live heads
    pub qk_dim: usize,
    /// Retained value/output width summed over live heads
    pub vo_dim: usize,
    /// Retained feed-forward neurons
    pub ffn_dim: usize,
    /// Attention sub-block removed entirely
    pub prune_attn: bool,
    /// Feed-forward sub-block removed entirely
    pub prune_ffn: bool,
}

impl PackedLayerConfig {
    /// Per-head query/key width.
    pub fn qk_head_dim(&self) -> usize {
        if self.num_heads == 0 {
            0
        } else {
            self.qk_dim / self.num_heads
        }
    }

    /// Per-head value/output width.
    pub fn vo_head_dim(&self) -> usize {
        if self.num_heads == 0 {
            0
        } else {
            self.vo_dim / self.num_heads
        }
    }

    /// Parameter count of this layer, residual transforms included.
    pub fn parameter_count(&self) -> usize {
        let mut count = 0;
        if !self.prune_attn {
            count += 2 * (self.qk_dim * self.input_dim + self.qk_dim);
            count += self.vo_dim * self.input_dim + self.vo_dim;
            count += self.attn_output_dim * self.vo_dim + self.attn_output_dim;
        }
        count += self.attn_output_dim * self.input_dim + self.attn_output_dim;
        count += 2 * self.attn_output_dim;
        if !self.prune_ffn {
            count += self.ffn_dim * self.attn_output_dim + self.ffn_dim;
            count += self.ffn_output_dim * self.ffn_dim + self.ffn_output_dim;
        }
        count += self.ffn_output_dim * self.attn_output_dim + self.ffn_output_dim;
        count += 2 * self.ffn_output_dim;
        count
    }

    fn validate(&self, index: usize) -> CompactResult<()> {
        if self.input_dim == 0 || self.attn_output_dim == 0 || self.ffn_output_dim == 0 {
            return Err(CompactError::invalid_config(format!(
                "layer {index}: hidden widths must be > 0"
            )));
        }
        if self.prune_attn != (self.num_heads == 0) {
            return Err(CompactError::invalid_config(format!(
                "layer {index}: prune_attn must hold exactly when no head survives"
            )));
        }
        if self.num_heads > 0
            && (self.qk_dim % self.num_heads != 0
                || self.vo_dim % self.num_heads != 0
                || self.vo_dim == 0)
        {
            return Err(CompactError::invalid_config(format!(
                "layer {index}: head widths must split evenly over {} heads",
                self.num_heads
            )));
        }
        if self.prune_ffn != (self.ffn_dim == 0) {
            return Err(CompactError::invalid_config(format!(
                "layer {index}: prune_ffn must hold exactly when no neuron survives"
            )));
        }
        Ok(())
    }
}

/// Configuration of a packed (compacted) encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedEncoderConfig {
    /// Architecture the packed model was compacted from
    pub base: EncoderConfig,
    /// Width of the stream leaving the embedding stage
    pub embedding_dim: usize,
    /// One record per encoder layer
    pub per_layer_config: Vec<PackedLayerConfig>,
    /// Whether a pooler was carried over
    pub pooler: bool,
}

impl PackedEncoderConfig {
    /// Width of the final hidden stream.
    pub fn output_dim(&self) -> usize {
        self.per_layer_config
            .last()
            .map_or(self.embedding_dim, |layer| layer.ffn_output_dim)
    }

    /// Check that consecutive layers agree on their boundary widths.
    pub fn validate(&self) -> CompactResult<()> {
        self.base.validate()?;
        if self.embedding_dim == 0 {
            return Err(CompactError::invalid_config("embedding_dim must be > 0"));
        }
        if self.per_layer_config.len() != self.base.num_layers {
            return Err(CompactError::invalid_config(format!(
                "expected {} layer records, got {}",
                self.base.num_layers,
                self.per_layer_config.len()
            )));
        }
        let mut width = self.embedding_dim;
        for (index, layer) in self.per_layer_config.iter().enumerate() {
            layer.validate(index)?;
            if layer.input_dim != width {
                return Err(CompactError::dimension_mismatch(
                    format!("layer {index} input"),
                    width,
                    layer.input_dim,
                ));
            }
            width = layer.ffn_output_dim;
        }
        if self.base.task.is_some_and(|t| t.reads_pooled()) && !self.pooler {
            return Err(CompactError::invalid_config(
                "sequence classification head requires a pooler",
            ));
        }
        Ok(())
    }

    /// Parameter count of the packed encoder, embeddings and heads included.
    pub fn parameter_count(&self) -> usize {
        let base = &self.base;
        let d = base.hidden_size;
        let tables = (base.vocab_size + base.max_position_embeddings + base.type_vocab_size) * d;
        let projection = self.embedding_dim * d + 3 * self.embedding_dim;
        let layers: usize = self
            .per_layer_config
            .iter()
            .map(PackedLayerConfig::parameter_count)
            .sum();
        let pooler = if self.pooler {
            d * self.output_dim() + d
        } else {
            0
        };
        let head = base.task.map_or(0, |task| {
            let input = if task.reads_pooled() { d } else { self.output_dim() };
            task.out_features() * input + task.out_features()
        });
        tables + projection + layers + pooler + head
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> CompactResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn to_json_file(&self, path: &Path) -> CompactResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
