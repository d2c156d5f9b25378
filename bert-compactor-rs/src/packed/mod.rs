//! Packed encoder: dead features physically removed, skip connections
//! carried by explicit residual transforms.

pub mod attention;
pub mod layer;
pub mod model;

pub use attention::PackedSelfAttention;
pub use layer::{PackedFeedForward, PackedLayer};
pub use model::PackedEncoderModel;
