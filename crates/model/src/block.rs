use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
    norm::{LayerNorm, NormConfig, NormalizationLayer},
    residual::{Residual, ResidualConfig},
};

use crate::{config::GroupConfig, error::GroupError, stage::Stage};

/// Pre-norm encoder block: `y = x + Drop(Proj(MHSA(LN(x))))`, then
/// `y + MLP(LN(y))`. Output shape equals input shape.
pub struct TransformerBlock {
    stage: Stage,
    hidden_size: usize,
    heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    norm_attn: LayerNorm,
    norm_mlp: LayerNorm,
    qkv_proj: Linear,
    out_proj: Linear,
    mlp: FeedForward,
    attention: ExactAttention,
    attention_dropout: Option<f32>,
    residual_attn: Residual,
    residual_mlp: Residual,
    training: AtomicBool,
}

impl fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("stage", &self.stage)
            .field("hidden_size", &self.hidden_size)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .field("training", &self.is_training())
            .finish()
    }
}

impl TransformerBlock {
    /// Builds a block with freshly initialised weights. `seed` drives the
    /// residual and feed-forward dropout masks; attention-probability
    /// dropout samples from the device RNG.
    ///
    /// Parameter dtypes the attention kernel cannot run (such as `f64`) are
    /// rejected with [`GroupError::Config`].
    pub fn new(
        stage: Stage,
        config: &GroupConfig,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, GroupError> {
        config.validate()?;
        if !ExactAttention::supports_dtype(dtype) {
            return Err(GroupError::Config(format!(
                "block.{stage}: parameter dtype {dtype:?} is not supported by the attention kernel"
            )));
        }
        let hidden = config.hidden_size;
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let norm_attn = LayerNorm::identity_init(NormConfig::new(hidden), dtype, device)?;
        let norm_mlp = LayerNorm::identity_init(NormConfig::new(hidden), dtype, device)?;

        let mut qkv_config = LinearConfig::fused(hidden, hidden, 3);
        qkv_config.bias = false;
        let qkv_proj = Linear::with_init(qkv_config, &LinearInit::XavierUniform, device, dtype)?;
        let out_proj = Linear::with_init(
            LinearConfig::new(hidden, hidden),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        let mut ff_config = FeedForwardConfig::new(hidden, config.mlp_dim);
        ff_config.dropout_p = config.dropout_p();
        let mlp = FeedForward::with_init(
            ff_config,
            &LinearInit::XavierUniform,
            seed.wrapping_add(1),
            device,
            dtype,
        )?;

        let residual_attn = Residual::new(ResidualConfig::new(config.dropout_p()), seed)?;
        // MLP dropout already happens inside the feed-forward.
        let residual_mlp = Residual::new(ResidualConfig::new(None), seed.wrapping_add(3))?;

        Ok(Self {
            stage,
            hidden_size: hidden,
            heads: config.num_heads,
            head_dim: config.head_dim(),
            policy,
            norm_attn,
            norm_mlp,
            qkv_proj,
            out_proj,
            mlp,
            attention: ExactAttention::new(),
            attention_dropout: config.dropout_p(),
            residual_attn,
            residual_mlp,
            training: AtomicBool::new(true),
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
        self.residual_attn.set_training(training);
        self.residual_mlp.set_training(training);
        self.mlp.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn expand_to_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, self.heads, self.head_dim))?
            .permute((0, 2, 1, 3))
    }

    fn merge_from_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let dims = tensor.dims();
        if dims.len() != 4 {
            bail!(
                "block.{}: attention output expected [batch, heads, seq, head_dim] got {:?}",
                self.stage,
                dims
            );
        }
        let (batch, seq) = (dims[0], dims[2]);
        tensor
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, self.hidden_size))
    }

    fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            dropout_p: self.attention_dropout,
            training: self.is_training(),
            ..AttentionConfig::default()
        }
    }

    /// Forward pass over a `[batch, seq, hidden]` sequence.
    pub fn forward(&self, hidden: &Tensor) -> std::result::Result<Tensor, GroupError> {
        checks::expect_batch_seq_hidden("block.input", hidden, self.hidden_size)?;
        checks::expect_non_empty_sequence("block.input", hidden)?;

        let normed = self.norm_attn.forward(hidden, &self.policy)?;
        let qkv = self.qkv_proj.forward(&normed, &self.policy)?;
        let q = self.expand_to_heads(&qkv.narrow(2, 0, self.hidden_size)?)?;
        let k = self.expand_to_heads(&qkv.narrow(2, self.hidden_size, self.hidden_size)?)?;
        let v = self.expand_to_heads(&qkv.narrow(2, 2 * self.hidden_size, self.hidden_size)?)?;

        let attended = self
            .attention
            .attend(&q, &k, &v, &self.attention_config())?;
        let projected = self
            .out_proj
            .forward(&self.merge_from_heads(&attended)?, &self.policy)?;
        let after_attn = self.residual_attn.step(&projected, hidden, &self.policy)?;

        let normed_mlp = self.norm_mlp.forward(&after_attn, &self.policy)?;
        let mlp_out = self.mlp.forward(&normed_mlp, &self.policy)?;
        Ok(self
            .residual_mlp
            .step(&mlp_out, &after_attn, &self.policy)?)
    }
}
