use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use corpus_gpt::checkpoint::Checkpoints;
use corpus_gpt::runtime::{load_model, seed, select_device};
use corpus_gpt::{evaluate, load_config, load_tokenizer, predict, train};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a GPT on a directory of text files and sample from it")]
struct Args {
    /// Configuration files applied in order (later files override earlier ones).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    config: Vec<PathBuf>,
    /// Override the dataset name.
    #[arg(long, global = true)]
    dataset: Option<String>,
    /// Override the CUDA device ordinal; negative runs on the CPU.
    #[arg(long, value_name = "N", global = true, allow_hyphen_values = true)]
    gpu_id: Option<i64>,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Train on `datasets/<dataset>/<train_dir>`.
    Train,
    /// Report the loss of a checkpoint on the test set.
    Test,
    /// Continue every file of the predict set.
    Predict,
    /// Answer prompts read from stdin.
    Question,
    /// Write the parameter summary and exit.
    Params,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Test => "test",
            Mode::Predict => "predict",
            Mode::Question => "question",
            Mode::Params => "params",
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(dataset) = args.dataset.clone() {
        config.dataset = dataset;
    }
    if let Some(gpu_id) = args.gpu_id {
        config.gpu_id = gpu_id;
    }
    config.validate()?;

    let device = select_device(&config)?;
    let seed = seed(&config);
    config.seed = seed;
    let tokenizer = load_tokenizer(&config)?;
    let checkpoints = Checkpoints::new(config.checkpoint_dir());
    let argv: Vec<String> = std::env::args().collect();
    checkpoints.record_options(args.mode.name(), &argv, &config)?;
    info!(mode = args.mode.name(), dataset = %config.dataset, "starting");

    match args.mode {
        Mode::Train => train::run(&config, device, tokenizer.as_ref()),
        Mode::Test => {
            evaluate::test(&config, device, tokenizer.as_ref())?;
            Ok(())
        }
        Mode::Predict => {
            let (_vs, model, _) =
                load_model(&config, device, &checkpoints, Some(&config.predict.load_epoch))?;
            predict::predict(&config, &model, device, tokenizer.as_ref(), seed, io::stdout().lock())?;
            Ok(())
        }
        Mode::Question => {
            let (_vs, model, _) =
                load_model(&config, device, &checkpoints, Some(&config.question.load_epoch))?;
            predict::question(
                &config,
                &model,
                device,
                tokenizer.as_ref(),
                seed,
                io::stdin().lock(),
                io::stdout().lock(),
            )?;
            Ok(())
        }
        Mode::Params => {
            let (vs, _, _) = load_model(&config, device, &checkpoints, None)?;
            checkpoints.write_model_summary(&vs, "GPT")
        }
    }
}
