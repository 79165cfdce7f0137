//! Slice-per-token embedding of a volume along one axis.
//!
//! For the height axis a `[batch, H, W, D]` volume becomes `[batch, H, W*D]`
//! (one token per axial slice) and a linear projection maps `W*D` to
//! `hidden_size`. When a common `token_count` is configured and differs from
//! the axis extent, a second projection over the sequence dimension maps the
//! `H` tokens onto `token_count` tokens. A learned positional table is added
//! last.

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    residual::Dropout,
};
use serde::{Deserialize, Serialize};

use crate::axis::Axis;

const POSITION_STD: f64 = 0.02;

/// Shape and width of the axis embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisEmbeddingConfig {
    /// Spatial extent `[height, width, depth]` of the input volumes.
    pub volume: [usize; 3],
    pub hidden_size: usize,
    /// Common sequence length for all three axes. `None` keeps each axis
    /// extent, which then must be identical across axes.
    #[serde(default)]
    pub token_count: Option<usize>,
    #[serde(default)]
    pub dropout_p: Option<f32>,
}

impl AxisEmbeddingConfig {
    pub fn new(volume: [usize; 3], hidden_size: usize) -> Self {
        Self {
            volume,
            hidden_size,
            token_count: None,
            dropout_p: None,
        }
    }

    /// Token count shared by the three sequences.
    pub fn common_length(&self) -> Result<usize> {
        match self.token_count {
            Some(0) => bail!("token_count must be greater than zero"),
            Some(count) => Ok(count),
            None => {
                let [h, w, d] = self.volume;
                if h == w && w == d {
                    Ok(h)
                } else {
                    bail!(
                        "volume extents {:?} differ; set token_count to project every axis to a common length",
                        self.volume
                    )
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.volume.iter().any(|extent| *extent == 0) {
            bail!("volume extents must be non-zero, got {:?}", self.volume);
        }
        if self.hidden_size == 0 {
            bail!("hidden_size must be greater than zero");
        }
        if let Some(p) = self.dropout_p {
            layers::residual::validate_probability("embedding.dropout", p)?;
        }
        self.common_length().map(|_| ())
    }
}

/// Embeds a volume as a token sequence along one axis.
#[derive(Debug)]
pub struct AxisPatchEmbedding {
    axis: Axis,
    volume: [usize; 3],
    tokens: usize,
    patch_proj: Linear,
    seq_proj: Option<Linear>,
    position: Tensor,
    dropout: Dropout,
    policy: PrecisionPolicy,
}

impl AxisPatchEmbedding {
    pub fn new(
        axis: Axis,
        config: &AxisEmbeddingConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let init = LinearInit::TruncatedNormal { std: POSITION_STD };
        let extent = config.volume[axis.index()];
        let tokens = config.common_length()?;

        let patch_proj = Linear::with_init(
            LinearConfig::new(axis.slice_features(config.volume), config.hidden_size),
            &init,
            device,
            dtype,
        )?;
        let seq_proj = if tokens != extent {
            Some(Linear::with_init(
                LinearConfig::new(extent, tokens),
                &init,
                device,
                dtype,
            )?)
        } else {
            None
        };
        let position = init.sample((tokens, config.hidden_size), device, dtype)?;

        Ok(Self {
            axis,
            volume: config.volume,
            tokens,
            patch_proj,
            seq_proj,
            position,
            dropout: Dropout::new(config.dropout_p, seed)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Length of the produced sequence.
    pub fn token_count(&self) -> usize {
        self.tokens
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Maps `[batch, H, W, D]` (or `[batch, 1, H, W, D]`) to
    /// `[batch, token_count, hidden_size]`.
    pub fn forward(&self, volume: &Tensor) -> Result<Tensor> {
        let volume = squeeze_channel(volume)?;
        let (batch, h, w, d) = volume.dims4()?;
        if [h, w, d] != self.volume {
            bail!(
                "embedding.{}: expected volume extents {:?}, got {:?}",
                self.axis,
                self.volume,
                [h, w, d]
            );
        }
        if batch == 0 {
            bail!("embedding.{}: batch must be non-zero", self.axis);
        }

        let extent = self.volume[self.axis.index()];
        let slices = volume
            .permute(self.axis.leading_permutation())?
            .contiguous()?
            .reshape((batch, extent, self.axis.slice_features(self.volume)))?;
        let slices = self.policy.cast_to_storage(&slices)?;

        let mut hidden = self.patch_proj.forward(&slices, &self.policy)?;
        if let Some(seq_proj) = &self.seq_proj {
            let by_feature = hidden.transpose(1, 2)?.contiguous()?;
            hidden = seq_proj
                .forward(&by_feature, &self.policy)?
                .transpose(1, 2)?
                .contiguous()?;
        }
        let hidden = hidden.broadcast_add(&self.position)?;
        log::debug!("embedding.{} -> {:?}", self.axis, hidden.dims());
        self.dropout.forward(&hidden, &self.policy)
    }
}

/// Drops a singleton channel dimension from `[batch, 1, H, W, D]`.
fn squeeze_channel(volume: &Tensor) -> Result<Tensor> {
    match volume.dims() {
        [_, _, _, _] => Ok(volume.clone()),
        [_, 1, _, _, _] => volume.squeeze(1),
        dims => bail!(
            "expected a single-channel volume [batch, H, W, D] or [batch, 1, H, W, D], got {:?}",
            dims
        ),
    }
}

/// The three axis token sequences of one volume batch.
#[derive(Debug, Clone)]
pub struct AxisSequences {
    pub h: Tensor,
    pub w: Tensor,
    pub d: Tensor,
}

impl AxisSequences {
    pub fn get(&self, axis: Axis) -> &Tensor {
        match axis {
            Axis::Height => &self.h,
            Axis::Width => &self.w,
            Axis::Depth => &self.d,
        }
    }
}

/// One [`AxisPatchEmbedding`] per axis, sharing a configuration.
#[derive(Debug)]
pub struct AxisEmbeddings {
    config: AxisEmbeddingConfig,
    embedders: [AxisPatchEmbedding; 3],
}

impl AxisEmbeddings {
    pub fn new(config: AxisEmbeddingConfig, seed: u64, device: &Device, dtype: DType) -> Result<Self> {
        let build = |axis: Axis| {
            AxisPatchEmbedding::new(axis, &config, seed.wrapping_add(axis.index() as u64), device, dtype)
        };
        let embedders = [build(Axis::Height)?, build(Axis::Width)?, build(Axis::Depth)?];
        Ok(Self { config, embedders })
    }

    pub fn config(&self) -> &AxisEmbeddingConfig {
        &self.config
    }

    pub fn embedder(&self, axis: Axis) -> &AxisPatchEmbedding {
        &self.embedders[axis.index()]
    }

    pub fn set_training(&self, training: bool) {
        for embedder in &self.embedders {
            embedder.set_training(training);
        }
    }

    pub fn forward(&self, volume: &Tensor) -> Result<AxisSequences> {
        Ok(AxisSequences {
            h: self.embedder(Axis::Height).forward(volume)?,
            w: self.embedder(Axis::Width).forward(volume)?,
            d: self.embedder(Axis::Depth).forward(volume)?,
        })
    }
}
