//! Axis-factorized attention over three axis sequences.
//!
//! Instead of attending over all `H*W*D` voxel tokens at once, the group
//! attends along each axis separately (first stage), multiplies the per-axis
//! results pairwise, refines each pair with its own block (second stage) and
//! multiplies the three refined pairs into the output:
//!
//! ```text
//! h_att  = block_h(seq_h)        hw_att = block_hw(h_att * w_att)
//! w_att  = block_w(seq_w)        hd_att = block_hd(h_att * d_att)
//! d_att  = block_d(seq_d)        wd_att = block_wd(w_att * d_att)
//!
//! output = hw_att * hd_att * wd_att
//! ```
//!
//! Every product is element-wise over `[batch, seq, hidden]` and requires
//! identical shapes; nothing is broadcast.

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

use crate::{
    block::TransformerBlock,
    config::{ExecutionMode, GroupConfig},
    error::GroupError,
    stage::{Stage, Stages},
};

/// Every intermediate tensor of one forward pass.
#[derive(Debug, Clone)]
pub struct GroupTrace {
    /// Output of each block, first and second stage.
    pub attended: Stages<Tensor>,
    /// Inputs of the second-stage blocks, in [`Stage::SECOND`] order.
    pub interactions: [Tensor; 3],
    pub output: Tensor,
}

impl GroupTrace {
    /// Pairwise product fed into a second-stage block.
    pub fn interaction(&self, stage: Stage) -> Option<&Tensor> {
        Stage::SECOND
            .iter()
            .position(|candidate| *candidate == stage)
            .map(|slot| &self.interactions[slot])
    }
}

/// Element-wise product of two stage outputs with a strict shape check.
pub fn pairwise_product(
    (left, lhs): (Stage, &Tensor),
    (right, rhs): (Stage, &Tensor),
) -> Result<Tensor, GroupError> {
    ensure_same_shape((left, lhs), (right, rhs))?;
    Ok(lhs.mul(rhs)?)
}

fn ensure_same_shape(
    (left, lhs): (Stage, &Tensor),
    (right, rhs): (Stage, &Tensor),
) -> Result<(), GroupError> {
    if lhs.dims() == rhs.dims() {
        Ok(())
    } else {
        Err(GroupError::ShapeMismatch {
            left,
            right,
            left_shape: lhs.dims().to_vec(),
            right_shape: rhs.dims().to_vec(),
        })
    }
}

fn into_triple(outputs: Vec<Tensor>, stage: Stage) -> Result<[Tensor; 3], GroupError> {
    <[Tensor; 3]>::try_from(outputs).map_err(|outputs| GroupError::InvalidInput {
        stage,
        message: format!("expected 3 stage outputs, got {}", outputs.len()),
    })
}

/// Six transformer blocks wired as two factorized attention stages.
#[derive(Debug)]
pub struct AxisFactorizedAttentionGroup {
    config: GroupConfig,
    blocks: Stages<TransformerBlock>,
}

impl AxisFactorizedAttentionGroup {
    pub fn new(config: GroupConfig, device: &Device, dtype: DType) -> Result<Self, GroupError> {
        config.validate()?;
        let blocks = Stages::try_from_fn(|stage| {
            let seed = config
                .seed
                .wrapping_add((stage.index() as u64).wrapping_mul(0x9e37_79b9));
            TransformerBlock::new(stage, &config, seed, device, dtype)
        })?;
        log::info!(
            "axis-factorized group hidden={} mlp={} heads={} dropout={} execution={:?}",
            config.hidden_size,
            config.mlp_dim,
            config.num_heads,
            config.dropout_rate,
            config.execution
        );
        Ok(Self { config, blocks })
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Switches how the blocks of each stage are scheduled.
    pub fn with_execution(mut self, execution: ExecutionMode) -> Self {
        self.config.execution = execution;
        self
    }

    pub fn block(&self, stage: Stage) -> &TransformerBlock {
        &self.blocks[stage]
    }

    /// Switches every block between training (dropout active) and evaluation.
    pub fn set_training(&self, training: bool) {
        for (_, block) in self.blocks.iter() {
            block.set_training(training);
        }
    }

    pub fn is_training(&self) -> bool {
        self.blocks.iter().any(|(_, block)| block.is_training())
    }

    /// Maps three `[batch, len, hidden]` axis sequences to one
    /// `[batch, len, hidden]` tensor.
    pub fn forward(
        &self,
        seq_h: &Tensor,
        seq_w: &Tensor,
        seq_d: &Tensor,
    ) -> Result<Tensor, GroupError> {
        Ok(self.forward_trace(seq_h, seq_w, seq_d)?.output)
    }

    /// Same as [`forward`](Self::forward) but keeps every intermediate.
    pub fn forward_trace(
        &self,
        seq_h: &Tensor,
        seq_w: &Tensor,
        seq_d: &Tensor,
    ) -> Result<GroupTrace, GroupError> {
        let inputs = [seq_h, seq_w, seq_d];
        self.validate_inputs(&inputs)?;
        log::debug!(
            "group forward h={:?} w={:?} d={:?}",
            seq_h.dims(),
            seq_w.dims(),
            seq_d.dims()
        );

        let first = self.run_stage(Stage::FIRST, inputs)?;
        let by_stage = |stage: Stage| (stage, &first[stage.index()]);

        let mut products = Vec::with_capacity(3);
        for (_, left, right) in Stage::PAIRS {
            products.push(pairwise_product(by_stage(left), by_stage(right))?);
        }
        let interactions = into_triple(products, Stage::HW)?;

        let second = self.run_stage(
            Stage::SECOND,
            [&interactions[0], &interactions[1], &interactions[2]],
        )?;
        let [hw_att, hd_att, wd_att] = &second;
        let output = pairwise_product((Stage::HW, hw_att), (Stage::HD, hd_att))?;
        ensure_same_shape((Stage::HW, &output), (Stage::WD, wd_att))?;
        let output = output.mul(wd_att)?;

        Ok(GroupTrace {
            attended: Stages::from_stages(first, second),
            interactions,
            output,
        })
    }

    fn validate_inputs(&self, inputs: &[&Tensor; 3]) -> Result<(), GroupError> {
        for (stage, input) in Stage::FIRST.into_iter().zip(inputs.iter()) {
            let dims = input.dims();
            let [batch, len, hidden] = match dims {
                [b, l, h] => [*b, *l, *h],
                _ => {
                    return Err(GroupError::InvalidInput {
                        stage,
                        message: format!("expected [batch, seq, hidden], got {dims:?}"),
                    })
                }
            };
            if hidden != self.config.hidden_size {
                return Err(GroupError::InvalidInput {
                    stage,
                    message: format!(
                        "hidden size {hidden} does not match configured {}",
                        self.config.hidden_size
                    ),
                });
            }
            if batch == 0 || len == 0 {
                return Err(GroupError::DegenerateInput {
                    stage,
                    dims: dims.to_vec(),
                });
            }
        }
        for (_, left, right) in Stage::PAIRS {
            ensure_same_shape(
                (left, inputs[left.index()]),
                (right, inputs[right.index()]),
            )?;
        }
        Ok(())
    }

    fn run_stage(
        &self,
        stages: [Stage; 3],
        inputs: [&Tensor; 3],
    ) -> Result<[Tensor; 3], GroupError> {
        let outputs = match self.config.execution {
            ExecutionMode::Sequential => stages
                .iter()
                .zip(inputs.iter())
                .map(|(stage, input)| self.blocks[*stage].forward(input))
                .collect::<Result<Vec<_>, _>>()?,
            ExecutionMode::Parallel => stages[..]
                .par_iter()
                .zip(inputs[..].par_iter())
                .map(|(stage, input)| self.blocks[*stage].forward(input))
                .collect::<Result<Vec<_>, _>>()?,
        };
        into_triple(outputs, stages[0])
    }
}
