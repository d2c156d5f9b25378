//! Gated encoder: the model as it looks at the end of training, with every
//! prunable feature group behind a mask.

pub mod attention;
pub mod feedforward;
pub mod layer;
pub mod model;

pub use attention::GatedSelfAttention;
pub use feedforward::GatedFeedForward;
pub use layer::GatedLayer;
pub use model::GatedEncoderModel;
