pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod rope;

pub use attention::MultiHeadAttention;
pub use block::TransformerBlock;
pub use feed_forward::FeedForward;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use rope::Rotary;
