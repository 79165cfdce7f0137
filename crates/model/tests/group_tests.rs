use std::io::Write;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{
    pairwise_product, AxisFactorizedAttentionGroup, EncoderConfig, ExecutionMode, GroupConfig,
    GroupError, Stage, TriaxialEncoder,
};

fn eval_group(config: GroupConfig) -> Result<AxisFactorizedAttentionGroup> {
    let group = AxisFactorizedAttentionGroup::new(config, &Device::Cpu, DType::F32)?;
    group.set_training(false);
    Ok(group)
}

fn ramp(len: usize, hidden: usize, offset: f32, scale: f32) -> Result<Tensor> {
    let count = len * hidden;
    let values: Vec<f32> = (0..count)
        .map(|i| offset + scale * i as f32 / count as f32)
        .collect();
    Ok(Tensor::from_vec(values, (1, len, hidden), &Device::Cpu)?)
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn output_keeps_input_shape() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 4, 0.0))?;
    let seq = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu)?;
    let output = group.forward(&seq, &seq, &seq)?;
    assert_eq!(output.dims(), &[2, 5, 16]);
    Ok(())
}

#[test]
fn mismatched_axis_lengths_are_rejected() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let seq_h = Tensor::zeros((1, 8, 16), DType::F32, &Device::Cpu)?;
    let seq_w = Tensor::zeros((1, 6, 16), DType::F32, &Device::Cpu)?;
    let seq_d = Tensor::zeros((1, 8, 16), DType::F32, &Device::Cpu)?;
    match group.forward(&seq_h, &seq_w, &seq_d) {
        Err(GroupError::ShapeMismatch {
            left,
            right,
            left_shape,
            right_shape,
        }) => {
            assert_eq!((left, right), (Stage::H, Stage::W));
            assert_eq!(left_shape, vec![1, 8, 16]);
            assert_eq!(right_shape, vec![1, 6, 16]);
        }
        other => panic!("expected shape mismatch, got {other:?}"),
    }
    Ok(())
}

#[test]
fn pairwise_product_rejects_instead_of_broadcasting() -> Result<()> {
    let lhs = Tensor::ones((1, 4, 8), DType::F32, &Device::Cpu)?;
    let rhs = Tensor::ones((1, 1, 8), DType::F32, &Device::Cpu)?;
    let result = pairwise_product((Stage::H, &lhs), (Stage::D, &rhs));
    assert!(matches!(
        result,
        Err(GroupError::ShapeMismatch {
            left: Stage::H,
            right: Stage::D,
            ..
        })
    ));
    Ok(())
}

#[test]
fn pairwise_product_commutes() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let trace = group.forward_trace(
        &ramp(8, 16, 0.0, 1.0)?,
        &ramp(8, 16, -0.5, 1.0)?,
        &ramp(8, 16, 0.25, -1.0)?,
    )?;
    let h_att = &trace.attended[Stage::H];
    let w_att = &trace.attended[Stage::W];
    let swapped = pairwise_product((Stage::W, w_att), (Stage::H, h_att))?;
    let recorded = trace.interaction(Stage::HW).expect("hw interaction");
    assert_eq!(to_vec(recorded)?, to_vec(&swapped)?);
    Ok(())
}

#[test]
fn depth_input_does_not_reach_height_or_width_blocks() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let seq_h = ramp(8, 16, 0.0, 1.0)?;
    let seq_w = ramp(8, 16, 1.0, -1.0)?;
    let before = group.forward_trace(&seq_h, &seq_w, &ramp(8, 16, 0.0, 2.0)?)?;
    let after = group.forward_trace(&seq_h, &seq_w, &ramp(8, 16, 3.0, -2.0)?)?;

    for stage in [Stage::H, Stage::W] {
        assert_eq!(
            to_vec(&before.attended[stage])?,
            to_vec(&after.attended[stage])?,
            "{stage} changed"
        );
    }
    assert_ne!(
        to_vec(&before.attended[Stage::D])?,
        to_vec(&after.attended[Stage::D])?
    );
    Ok(())
}

#[test]
fn eval_mode_is_deterministic_with_dropout_configured() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.3))?;
    let seq = Tensor::randn(0f32, 1.0, (2, 6, 16), &Device::Cpu)?;
    let first = to_vec(&group.forward(&seq, &seq, &seq)?)?;
    let second = to_vec(&group.forward(&seq, &seq, &seq)?)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn zero_length_axis_is_degenerate() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let empty = Tensor::zeros((1, 0, 16), DType::F32, &Device::Cpu)?;
    let seq = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu)?;
    match group.forward(&seq, &seq, &empty) {
        Err(GroupError::DegenerateInput { stage, dims }) => {
            assert_eq!(stage, Stage::D);
            assert_eq!(dims, vec![1, 0, 16]);
        }
        other => panic!("expected degenerate input, got {other:?}"),
    }
    Ok(())
}

#[test]
fn wrong_hidden_size_is_invalid_input() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let seq = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu)?;
    let narrow = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
    assert!(matches!(
        group.forward(&seq, &narrow, &seq),
        Err(GroupError::InvalidInput {
            stage: Stage::W,
            ..
        })
    ));
    Ok(())
}

#[test]
fn invalid_hyper_parameters_fail_construction() {
    let result = AxisFactorizedAttentionGroup::new(
        GroupConfig::new(16, 32, 3, 0.0),
        &Device::Cpu,
        DType::F32,
    );
    assert!(matches!(result, Err(GroupError::Config(_))));
}

#[test]
fn ramp_fixture_produces_finite_output() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let output = group.forward(
        &ramp(8, 16, 0.0, 1.0)?,
        &ramp(8, 16, 0.5, 1.0)?,
        &ramp(8, 16, 1.0, -1.0)?,
    )?;
    assert_eq!(output.dims(), &[1, 8, 16]);
    assert!(to_vec(&output)?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn parallel_execution_matches_sequential() -> Result<()> {
    let group = eval_group(GroupConfig::new(16, 32, 2, 0.0))?;
    let seq_h = ramp(8, 16, 0.0, 1.0)?;
    let seq_w = ramp(8, 16, 0.5, -1.0)?;
    let seq_d = ramp(8, 16, -1.0, 2.0)?;
    let sequential = to_vec(&group.forward(&seq_h, &seq_w, &seq_d)?)?;

    let group = group.with_execution(ExecutionMode::Parallel);
    let parallel = to_vec(&group.forward(&seq_h, &seq_w, &seq_d)?)?;
    assert_eq!(sequential, parallel);
    Ok(())
}

#[test]
fn unsupported_parameter_dtype_fails_at_construction() {
    let result =
        AxisFactorizedAttentionGroup::new(GroupConfig::new(16, 32, 2, 0.0), &Device::Cpu, DType::F64);
    assert!(matches!(result, Err(GroupError::Config(_))));
}

#[test]
fn trace_records_every_stage() -> Result<()> {
    let group = eval_group(GroupConfig::new(8, 16, 2, 0.0))?;
    let seq = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;
    let trace = group.forward_trace(&seq, &seq, &seq)?;
    for (stage, tensor) in trace.attended.iter() {
        assert_eq!(tensor.dims(), &[1, 3, 8], "stage {stage}");
    }
    assert!(trace.interaction(Stage::H).is_none());
    assert_eq!(trace.output.dims(), &[1, 3, 8]);
    Ok(())
}

#[test]
fn encoder_maps_volume_to_tokens() -> Result<()> {
    let mut config = EncoderConfig::new([6, 4, 5], GroupConfig::new(16, 32, 2, 0.0));
    config.token_count = Some(4);
    let encoder = TriaxialEncoder::new(config, &Device::Cpu, DType::F32)?;
    encoder.set_training(false);
    let volume = Tensor::randn(0f32, 1.0, (2, 1, 6, 4, 5), &Device::Cpu)?;
    let output = encoder.forward(&volume)?;
    assert_eq!(output.dims(), &[2, 4, 16]);
    Ok(())
}

#[test]
fn encoder_config_loads_from_toml() -> Result<()> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    write!(
        file,
        "volume = [8, 8, 8]\n\n[group]\nhidden_size = 16\nmlp_dim = 32\nnum_heads = 2\ndropout_rate = 0.1\nexecution = \"parallel\"\n"
    )?;
    let config = EncoderConfig::from_path(file.path())?;
    assert_eq!(config.volume, [8, 8, 8]);
    assert_eq!(config.group.execution, ExecutionMode::Parallel);
    assert_eq!(config.token_count, None);
    Ok(())
}

#[test]
fn encoder_config_rejects_unknown_extension() -> Result<()> {
    let file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    assert!(matches!(
        EncoderConfig::from_path(file.path()),
        Err(GroupError::ConfigFormat(_))
    ));
    Ok(())
}
