//! `vip-train`: train a querier/classifier pair and report query efficiency.
//!
//! ```bash
//! vip-train --config mnist.json
//! vip-train --synthetic 256 --epochs 3 --sampling adaptive
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vip_query::SamplingStrategy;
use vip_train::{load_mnist, synthetic, DataSource, TrainConfig, Trainer};

#[derive(Parser, Debug)]
#[command(name = "vip-train", version, about = "Sequential patch acquisition training", long_about = None)]
struct Args {
    /// JSON config file. Without one the MNIST preset is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// random, random-variable or adaptive.
    #[arg(long, value_parser = parse_sampling)]
    sampling: Option<SamplingStrategy>,

    #[arg(long)]
    seed: Option<u64>,

    /// Directory with the MNIST IDX files.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    save_dir: Option<PathBuf>,

    /// Train on N synthetic images (and N/4 test images) instead of MNIST.
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,

    /// trace, debug, info, warn or error; `RUST_LOG` overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_sampling(s: &str) -> Result<SamplingStrategy, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown sampling strategy `{}`", s))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match args.config.as_deref() {
        Some(path) => TrainConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TrainConfig::mnist(),
    };

    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(sampling) = args.sampling {
        config.sampling = sampling;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(dir) = args.save_dir {
        config.save_dir = dir;
    }
    if let Some(dir) = args.data_dir {
        config.data = DataSource::Mnist { dir };
    }
    if let Some(n) = args.synthetic {
        config.data = DataSource::Synthetic {
            train: n,
            test: (n / 4).max(1),
        };
    }
    config.validate().context("invalid configuration")?;

    let (train, test) = match &config.data {
        DataSource::Mnist { dir } => (
            load_mnist(dir, true).context("loading MNIST train split")?,
            load_mnist(dir, false).context("loading MNIST test split")?,
        ),
        DataSource::Synthetic { train, test } => (
            synthetic(&config.grid, *train, config.num_classes, config.seed)?,
            synthetic(&config.grid, *test, config.num_classes, config.seed.wrapping_add(1))?,
        ),
    };

    let mut trainer = Trainer::new(config)?;
    let summary = trainer.run(&train, &test)?;
    if let Some(last) = summary.evals.last() {
        info!(
            acc_max = last.acc_max,
            acc_ip = last.acc_ip,
            qry_need_avg = last.qry_need_avg,
            "finished"
        );
    }
    Ok(())
}
