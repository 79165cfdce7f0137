//! Building blocks for the encoder blocks used by the triaxial attention group.
//!
//! Every layer consumes hidden states shaped `(batch, seq, hidden)` and
//! returns the same layout. Parameters live in the storage dtype chosen by
//! [`PrecisionPolicy`]; matmuls and reductions are promoted as described in
//! [`dtypes`].

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use dtypes::PrecisionPolicy;
