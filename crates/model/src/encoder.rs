use candle_core::{DType, Device, Tensor};
use embedding::AxisEmbeddings;

use crate::{config::EncoderConfig, error::GroupError, group::AxisFactorizedAttentionGroup};

/// Volume encoder: axis slice embeddings followed by the factorized group.
#[derive(Debug)]
pub struct TriaxialEncoder {
    config: EncoderConfig,
    embeddings: AxisEmbeddings,
    group: AxisFactorizedAttentionGroup,
}

impl TriaxialEncoder {
    pub fn new(config: EncoderConfig, device: &Device, dtype: DType) -> Result<Self, GroupError> {
        config.validate()?;
        let embeddings =
            AxisEmbeddings::new(config.embedding_config(), config.group.seed, device, dtype)?;
        let group = AxisFactorizedAttentionGroup::new(config.group.clone(), device, dtype)?;
        Ok(Self {
            config,
            embeddings,
            group,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn embeddings(&self) -> &AxisEmbeddings {
        &self.embeddings
    }

    pub fn group(&self) -> &AxisFactorizedAttentionGroup {
        &self.group
    }

    pub fn set_training(&self, training: bool) {
        self.embeddings.set_training(training);
        self.group.set_training(training);
    }

    /// Encodes `[batch, H, W, D]` (or `[batch, 1, H, W, D]`) volumes into
    /// `[batch, tokens, hidden]`.
    pub fn forward(&self, volume: &Tensor) -> Result<Tensor, GroupError> {
        let sequences = self.embeddings.forward(volume)?;
        self.group.forward(&sequences.h, &sequences.w, &sequences.d)
    }
}
