/// Train a message-passing network on one QM9 target with EMA evaluation
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use molprop::config::DecayPolicyConfig;
use molprop::data::{MoleculeLoader, Qm9Dataset};
use molprop::utils::{count_parameters, seed_device, select_device};
use molprop::{MessagePassingNet, PropertyModel, TrainConfig, Trainer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ScheduleKind {
    Exponential,
    MultiStep,
    OneCycle,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Molecular property regression on QM9")]
struct Cli {
    /// TOML or JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// CUDA ordinal
    #[arg(long)]
    gpu: Option<usize>,

    /// Random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Number of epochs to train
    #[arg(long)]
    epochs: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Weight decay
    #[arg(long)]
    wd: Option<f64>,

    /// Number of message-passing layers
    #[arg(long)]
    n_layer: Option<usize>,

    /// Hidden feature size
    #[arg(long)]
    dim: Option<usize>,

    /// Directory of .npy dataset files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Index of the regression target (0-11)
    #[arg(long)]
    target: Option<usize>,

    /// Distance cutoff for the radius graph
    #[arg(long)]
    cutoff: Option<f64>,

    /// Directory receiving checkpoints
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    /// Decay policy after warmup
    #[arg(long, value_enum)]
    schedule: Option<ScheduleKind>,

    /// Decay factor for exponential and multi-step policies
    #[arg(long)]
    gamma: Option<f64>,

    /// Comma-separated post-warmup epochs for the multi-step policy
    #[arg(long, value_delimiter = ',')]
    milestones: Vec<usize>,

    /// Peak rate for one-cycle (defaults to --lr)
    #[arg(long)]
    max_lr: Option<f64>,

    /// Warmup length in epochs
    #[arg(long)]
    warmup_epochs: Option<f64>,

    /// Warmup target multiplier
    #[arg(long)]
    multiplier: Option<f64>,

    /// EMA decay
    #[arg(long)]
    ema_decay: Option<f64>,

    /// Global gradient norm ceiling
    #[arg(long)]
    max_grad_norm: Option<f64>,

    /// Periodic checkpoint cadence in epochs
    #[arg(long)]
    save_every: Option<usize>,
}

impl Cli {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_path(path)
                .with_context(|| format!("failed to load configuration {}", path.display()))?,
            None => TrainConfig::default(),
        };

        if let Some(v) = self.gpu {
            config.gpu = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.epochs {
            config.epochs = v;
        }
        if let Some(v) = self.lr {
            config.lr = v;
        }
        if let Some(v) = self.wd {
            config.weight_decay = v;
        }
        if let Some(v) = self.n_layer {
            config.model.n_layer = v;
        }
        if let Some(v) = self.dim {
            config.model.dim = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.target {
            config.target = v;
        }
        if let Some(v) = self.cutoff {
            config.model.cutoff = v;
        }
        if let Some(v) = self.checkpoint_dir {
            config.checkpoint_dir = v;
        }
        if self.checkpoint_path.is_some() {
            config.checkpoint_path = self.checkpoint_path;
        }
        if let Some(v) = self.warmup_epochs {
            config.schedule.warmup_epochs = v;
        }
        if let Some(v) = self.multiplier {
            config.schedule.multiplier = v;
        }
        if let Some(v) = self.ema_decay {
            config.ema_decay = v;
        }
        if let Some(v) = self.max_grad_norm {
            config.max_grad_norm = v;
        }
        if let Some(v) = self.save_every {
            config.save_every = v;
        }

        let gamma = self.gamma.unwrap_or(0.9961697);
        match self.schedule {
            Some(ScheduleKind::Exponential) => {
                config.schedule.policy = DecayPolicyConfig::Exponential { gamma };
            }
            Some(ScheduleKind::MultiStep) => {
                config.schedule.policy = DecayPolicyConfig::MultiStep {
                    milestones: self.milestones,
                    gamma: self.gamma.unwrap_or(0.1),
                };
            }
            Some(ScheduleKind::OneCycle) => {
                config.schedule.policy = DecayPolicyConfig::OneCycle {
                    max_lr: self.max_lr,
                    pct_start: 0.3,
                    div_factor: 25.0,
                    final_div_factor: 1e4,
                };
            }
            None => {
                if let (Some(g), DecayPolicyConfig::Exponential { gamma }) =
                    (self.gamma, &mut config.schedule.policy)
                {
                    *gamma = g;
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;
    let device = select_device(config.gpu)?;
    seed_device(&device, config.seed)?;

    let dataset = Qm9Dataset::from_directory(&config.data_dir, config.target_column())
        .with_context(|| format!("failed to load dataset from {}", config.data_dir.display()))?;
    log::info!("# of graphs: {}", dataset.len());
    if !dataset.metadata().description.is_empty() {
        log::info!("Dataset: {}", dataset.metadata().description);
    }

    let split = dataset.split(config.train_size, config.valid_size, config.seed)?;
    let cutoff = config.model.cutoff;
    let mut train = MoleculeLoader::new(split.train, config.batch_size, cutoff, true, config.seed);
    let mut valid = MoleculeLoader::new(split.valid, config.batch_size, cutoff, false, config.seed);
    let mut test = MoleculeLoader::new(split.test, config.batch_size, cutoff, false, config.seed);
    log::info!("Loaded the QM9 dataset. Target property: {}", config.target_name());

    let model = MessagePassingNet::new(&config.model, &device)?;
    log::info!(
        "Loaded the model: {} parameters",
        count_parameters(&model.parameters())
    );

    let mut trainer = Trainer::new(model, &config, train.num_batches(), device)?;
    if let Some(path) = &config.checkpoint_path {
        trainer
            .resume_from(path)
            .with_context(|| format!("failed to resume from {}", path.display()))?;
    }

    let summary = trainer.fit(&mut train, &mut valid, &mut test)?;
    println!("{}", summary);
    Ok(())
}
