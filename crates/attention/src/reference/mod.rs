//! Portable, exact implementation of bidirectional self-attention.
//!
//! This path favours clarity over raw throughput and is the kernel every
//! encoder block of the group uses.

pub mod exact;

pub use exact::ExactAttention;
