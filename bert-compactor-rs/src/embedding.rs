//! Token, position and segment embedding tables.
//!
//! The tables are never compacted; only the projection that follows them
//! is narrowed.

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

use crate::config::EncoderConfig;
use crate::params::{join, NamedTensors, TensorMap};

/// Sum of word, position and token-type embeddings.
#[derive(Debug, Clone)]
pub struct TokenEmbeddings {
    word: Embedding,
    position: Embedding,
    token_type: Embedding,
}

impl TokenEmbeddings {
    /// Load the three tables under `vb` (usually `embeddings`).
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            word: embedding(config.vocab_size, hidden, vb.pp("word_embeddings"))?,
            position: embedding(config.max_position_embeddings, hidden, vb.pp("position_embeddings"))?,
            token_type: embedding(config.type_vocab_size, hidden, vb.pp("token_type_embeddings"))?,
        })
    }

    /// Embed `(batch, seq)` token ids into `(batch, seq, hidden)`.
    ///
    /// Missing token types default to segment 0.
    pub fn forward(&self, input_ids: &Tensor, token_type_ids: Option<&Tensor>) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();

        let positions = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;
        let token_types = match token_type_ids {
            Some(t) => t.clone(),
            None => input_ids.zeros_like()?.to_dtype(DType::U32)?,
        };

        let words = self.word.forward(input_ids)?;
        let positions = self.position.forward(&positions)?;
        let segments = self.token_type.forward(&token_types)?;
        words.broadcast_add(&positions)?.broadcast_add(&segments)
    }
}

impl NamedTensors for TokenEmbeddings {
    fn collect_tensors(&self, prefix: &str, out: &mut TensorMap) {
        let tables = [
            ("word_embeddings", &self.word),
            ("position_embeddings", &self.position),
            ("token_type_embeddings", &self.token_type),
        ];
        for (name, table) in tables {
            out.insert(join(&join(prefix, name), "weight"), table.embeddings().clone());
        }
    }
}
