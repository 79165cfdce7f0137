use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Device};
use clap::{Parser, ValueEnum};
use model::{EncoderConfig, TriaxialEncoder};
use volume_data::{build_loaders, Loaders, PipelineConfig, VolumeLoader};

fn main() {
    if let Err(err) = run() {
        eprintln!("inspection failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Split {
    Train,
    Val,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs the triaxial encoder over a data pipeline and reports output shapes",
    long_about = None
)]
struct Args {
    #[arg(long, value_name = "PATH", help = "Pipeline config (toml or json)")]
    pipeline: PathBuf,

    #[arg(long, value_name = "PATH", help = "Encoder config (toml or json)")]
    encoder: PathBuf,

    #[arg(long, value_enum, default_value_t = Split::Train, help = "Loader to iterate")]
    split: Split,

    #[arg(long, default_value_t = 0, help = "Epoch used to seed shuffling and augmentation")]
    epoch: u64,

    #[arg(long, help = "Stop after this many batches")]
    max_batches: Option<usize>,
}

fn select_loader(loaders: Loaders, split: Split) -> VolumeLoader {
    match (loaders, split) {
        (Loaders::Train { train, .. }, Split::Train) => train,
        (Loaders::Train { val, .. }, Split::Val) => val,
        (Loaders::Test(test), _) => test,
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let device = Device::Cpu;

    let pipeline = PipelineConfig::from_path(&args.pipeline)
        .with_context(|| format!("loading pipeline config {}", args.pipeline.display()))?;
    let encoder_config = EncoderConfig::from_path(&args.encoder)
        .with_context(|| format!("loading encoder config {}", args.encoder.display()))?;

    let encoder = TriaxialEncoder::new(encoder_config, &device, DType::F32)?;
    encoder.set_training(false);

    let mut loader = select_loader(build_loaders(&pipeline, &device)?, args.split);
    loader.set_epoch(args.epoch);
    println!(
        "epoch {}: {} items, {} batches of up to {}",
        args.epoch,
        loader.num_items(),
        loader.len(),
        loader.batch_size()
    );

    let limit = args.max_batches.unwrap_or(usize::MAX);
    let mut non_finite = 0usize;
    for (step, batch) in loader.iter().take(limit).enumerate() {
        let batch = batch?;
        let dims = batch.image.dims().to_vec();
        ensure!(
            dims.len() == 5 && dims[1] == 1,
            "encoder expects single-channel volumes, batch {step} has shape {dims:?}"
        );
        let volume = [dims[2], dims[3], dims[4]];
        ensure!(
            volume == encoder.config().volume,
            "batch {step} volume {volume:?} does not match encoder volume {:?}",
            encoder.config().volume
        );

        let output = encoder.forward(&batch.image)?;
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        let finite = values.iter().all(|v| v.is_finite());
        if !finite {
            non_finite += 1;
        }
        let mean = values.iter().map(|v| f64::from(*v)).sum::<f64>() / values.len().max(1) as f64;
        println!(
            "batch {step}: items {:?} image {:?} -> output {:?} mean {mean:.5} finite {finite}",
            batch.indices,
            dims,
            output.dims()
        );
    }

    ensure!(non_finite == 0, "{non_finite} batches produced non-finite outputs");
    println!("all batches produced finite outputs");
    Ok(())
}
