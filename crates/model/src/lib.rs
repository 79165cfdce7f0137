//! Triaxial group attention for volumetric encoders.
//!
//! [`AxisFactorizedAttentionGroup`] attends along the height, width and depth
//! axes of a volume separately and fuses the results through pairwise
//! element-wise interactions. [`TriaxialEncoder`] puts the axis slice
//! embeddings in front of it.

pub mod block;
pub mod config;
pub mod encoder;
pub mod error;
pub mod group;
pub mod stage;

pub use block::TransformerBlock;
pub use config::{EncoderConfig, ExecutionMode, GroupConfig};
pub use encoder::TriaxialEncoder;
pub use error::GroupError;
pub use group::{pairwise_product, AxisFactorizedAttentionGroup, GroupTrace};
pub use stage::{Stage, Stages};
