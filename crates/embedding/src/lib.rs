//! Per-axis patch embedding for volumetric scans.
//!
//! A volume `[batch, height, width, depth]` is turned into three token
//! sequences, one per spatial [`Axis`]. Each token is a full slice of the
//! volume orthogonal to its axis, projected to `hidden_size`. An optional
//! sequence projection reconciles the three axes to a common token count so
//! downstream element-wise products are well defined.

pub mod axis;
pub mod patch;

pub use axis::Axis;
pub use patch::{AxisEmbeddingConfig, AxisEmbeddings, AxisPatchEmbedding, AxisSequences};
