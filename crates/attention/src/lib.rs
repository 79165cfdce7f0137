//! Exact bidirectional self-attention for the triaxial encoder blocks.
//!
//! The crate defines a portable API for computing multi-head scaled
//! dot-product attention over tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. Tokens along one axis of the volume
//! attend to every other token on that axis, so no causal mask is applied.
//! The inputs `Q`, `K`, and `V` share the same dtype (bf16, f16, or f32);
//! scores and softmax run in `f32`, and the output matches
//! the input dtype and query shape.
//!
//! Dropout on the attention probabilities is a train-only concern controlled
//! through [`Config`]; evaluation-mode calls are deterministic.

pub mod core;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use reference::ExactAttention;
