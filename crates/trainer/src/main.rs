//! `hpc-trainer` -- submit one fast-trainer job to the HPC worker pool.
//!
//! Reads the page image and its five layer masks, publishes them to the
//! job broker, waits for the trained models and writes them to the output
//! directory. Ctrl-C cancels the wait and releases the broker session.
//!
//! # Environment variables
//!
//! | Variable                | Required | Default | Description                        |
//! |-------------------------|----------|---------|------------------------------------|
//! | `HPC_RABBITMQ_HOST`     | yes      | --      | Broker host name                   |
//! | `HPC_RABBITMQ_USER`     | yes      | --      | Broker user                        |
//! | `HPC_RABBITMQ_PASSWORD` | yes      | --      | Broker password                    |
//! | `HPC_RABBITMQ_PORT`     | no       | `5672`  | Broker port                        |
//! | `HPC_RABBITMQ_VHOST`    | no       | `/`     | Broker virtual host                |
//! | `HPC_MAX_WAIT_SECS`     | no       | --      | Give up after this many seconds    |
//! | `RUST_LOG`              | no       | `hpc_trainer=info,hpc_dispatch=info` | Log filter |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use hpc_broker::{AmqpConnector, BrokerConfig};
use hpc_dispatch::JobRunner;
use hpc_trainer::settings::{
    DEFAULT_CPUS, DEFAULT_MAX_EPOCHS, DEFAULT_MAX_MEMORY_MB, DEFAULT_MAX_TIME, DEFAULT_PATCH_SIZE,
};
use hpc_trainer::{output_paths_in, FastTrainer, TrainingSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hpc-trainer")]
#[command(about = "Train patch-wise layout analysis models on the HPC worker pool")]
struct Cli {
    /// Page image (RGB PNG or JPEG).
    #[arg(long)]
    image: PathBuf,

    /// RGBA PNG background layer.
    #[arg(long)]
    background: PathBuf,

    /// RGBA PNG music symbol layer.
    #[arg(long)]
    music_symbols: PathBuf,

    /// RGBA PNG staff lines layer.
    #[arg(long)]
    staff_lines: PathBuf,

    /// RGBA PNG text layer.
    #[arg(long)]
    text: PathBuf,

    /// RGBA PNG selected regions.
    #[arg(long)]
    selected_regions: PathBuf,

    /// Directory the trained models are written to.
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_EPOCHS)]
    max_epochs: i64,

    #[arg(long, default_value_t = DEFAULT_PATCH_SIZE)]
    patch_height: i64,

    #[arg(long, default_value_t = DEFAULT_PATCH_SIZE)]
    patch_width: i64,

    /// Wall-clock limit for the remote job, `D-HH:MM`.
    #[arg(long, default_value = DEFAULT_MAX_TIME)]
    max_time: String,

    #[arg(long, default_value_t = DEFAULT_MAX_MEMORY_MB)]
    max_memory_mb: i64,

    #[arg(long, default_value_t = DEFAULT_CPUS)]
    cpus: i64,

    /// Stop waiting for the models after this many seconds.
    #[arg(long, env = "HPC_MAX_WAIT_SECS")]
    max_wait_secs: Option<u64>,
}

impl Cli {
    fn settings(&self) -> TrainingSettings {
        TrainingSettings {
            max_epochs: self.max_epochs,
            patch_height: self.patch_height,
            patch_width: self.patch_width,
            max_time: self.max_time.clone(),
            max_memory_mb: self.max_memory_mb,
            cpus: self.cpus,
        }
    }

    fn input_paths(&self) -> BTreeMap<String, PathBuf> {
        [
            ("Image", &self.image),
            ("rgba PNG - Background layer", &self.background),
            ("rgba PNG - Music symbol layer", &self.music_symbols),
            ("rgba PNG - Staff lines layer", &self.staff_lines),
            ("rgba PNG - Text", &self.text),
            ("rgba PNG - Selected regions", &self.selected_regions),
        ]
        .into_iter()
        .map(|(port, path)| (port.to_string(), path.clone()))
        .collect()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hpc_trainer=info,hpc_dispatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = cli.settings().checked()?;
    let config = BrokerConfig::from_env().context("invalid broker configuration")?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        vhost = %config.virtual_host,
        output_dir = %cli.output_dir.display(),
        "Starting hpc-trainer",
    );

    let mut runner = JobRunner::new(Arc::new(AmqpConnector::new()), config);
    if let Some(secs) = cli.max_wait_secs {
        runner = runner.with_max_wait(Duration::from_secs(secs));
    }
    let trainer = FastTrainer::new(runner);

    let inputs = cli.input_paths();
    let outputs = output_paths_in(&cli.output_dir);

    let run = trainer.run(&inputs, &settings, &outputs);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling training job");
            trainer.runner().shutdown();
            run.await
        }
    };

    result.context("training job failed")?;
    tracing::info!(output_dir = %cli.output_dir.display(), "Training complete");
    Ok(())
}
