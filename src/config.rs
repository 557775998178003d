/// Configuration for training runs
///
/// A single immutable value built once (defaults, then an optional config
/// file, then CLI overrides) and passed by reference to the trainer, the
/// schedule composer and the checkpoint store.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Property names for the twelve regression targets exposed by the CLI.
pub const TARGET_NAMES: [&str; 12] = [
    "mu (D)",
    "a (a^3_0)",
    "e_HOMO (eV)",
    "e_LUMO (eV)",
    "delta e (eV)",
    "R^2 (a^2_0)",
    "ZPVE (eV)",
    "U_0 (eV)",
    "U (eV)",
    "H (eV)",
    "G (eV)",
    "c_v (cal/mol.K)",
];

/// Configuration for the message-passing network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hidden feature size per atom
    pub dim: usize,

    /// Number of message-passing layers
    pub n_layer: usize,

    /// Distance cutoff (Angstrom) used to build the radius graph
    pub cutoff: f64,

    /// Number of Gaussian radial basis functions on [0, cutoff]
    pub num_radial: usize,

    /// Largest atomic number the embedding table covers
    pub max_atomic_number: usize,

    /// Dropout probability in the readout head
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim: 128,
            n_layer: 6,
            cutoff: 5.0,
            num_radial: 32,
            max_atomic_number: 10,
            dropout: 0.0,
        }
    }
}

/// Decay policy that takes over once warmup has finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecayPolicyConfig {
    /// `lr = peak * gamma^epoch`
    Exponential { gamma: f64 },
    /// `lr = peak * gamma^(milestones passed)`
    MultiStep { milestones: Vec<usize>, gamma: f64 },
    /// One-cycle over the whole run; the warmup wrapper is bypassed
    OneCycle {
        max_lr: Option<f64>,
        pct_start: f64,
        div_factor: f64,
        final_div_factor: f64,
    },
}

/// Learning-rate schedule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Warmup length in epochs
    pub warmup_epochs: f64,

    /// Warmup ramps from 0 to `multiplier * lr`
    pub multiplier: f64,

    /// Policy applied after warmup
    pub policy: DecayPolicyConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_epochs: 1.0,
            multiplier: 1.0,
            policy: DecayPolicyConfig::Exponential { gamma: 0.9961697 },
        }
    }
}

/// Top-level training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Index of the regression target (0..12)
    pub target: usize,

    /// Number of epochs to train
    pub epochs: usize,

    /// Batch size
    pub batch_size: usize,

    /// Base learning rate
    pub lr: f64,

    /// L2 weight decay folded into the Adam gradient
    pub weight_decay: f64,

    /// Adam betas and epsilon
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,

    /// Global L2 gradient-norm ceiling
    pub max_grad_norm: f64,

    /// EMA decay for the parameter shadow
    pub ema_decay: f64,

    /// Periodic checkpoint cadence in completed epochs
    pub save_every: usize,

    /// Random seed for shuffling and the dataset split
    pub seed: u64,

    /// CUDA ordinal, used only when CUDA is available
    pub gpu: usize,

    /// Molecules in the training split
    pub train_size: usize,

    /// Molecules in the validation split; the rest is test
    pub valid_size: usize,

    /// Dataset directory
    pub data_dir: PathBuf,

    /// Directory receiving checkpoint files
    pub checkpoint_dir: PathBuf,

    /// Checkpoint to resume from
    pub checkpoint_path: Option<PathBuf>,

    pub model: ModelConfig,

    pub schedule: ScheduleConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            target: 7,
            epochs: 900,
            batch_size: 128,
            lr: 1e-4,
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: 1000.0,
            ema_decay: 0.999,
            save_every: 5,
            seed: 920,
            gpu: 0,
            train_size: 110_000,
            valid_size: 10_000,
            data_dir: PathBuf::from("data/QM9"),
            checkpoint_dir: PathBuf::from("checkpoint"),
            checkpoint_path: None,
            model: ModelConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Load a configuration from a TOML or JSON file
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrainConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(crate::TrainError::Config(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, reporting every problem at once
    pub fn validate(&self) -> crate::Result<()> {
        let mut errors = Vec::new();

        if self.target >= TARGET_NAMES.len() {
            errors.push(format!("target must be in 0..{}", TARGET_NAMES.len()));
        }
        if self.batch_size == 0 {
            errors.push("batch_size must be > 0".to_string());
        }
        if self.lr <= 0.0 {
            errors.push("lr must be > 0".to_string());
        }
        if self.weight_decay < 0.0 {
            errors.push("weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.beta1 && self.beta1 < 1.0) || !(0.0 < self.beta2 && self.beta2 < 1.0) {
            errors.push("Adam betas must be in (0, 1)".to_string());
        }
        if self.max_grad_norm <= 0.0 {
            errors.push("max_grad_norm must be > 0".to_string());
        }
        if !(0.0 < self.ema_decay && self.ema_decay < 1.0) {
            errors.push("ema_decay must be in (0, 1)".to_string());
        }
        if self.save_every == 0 {
            errors.push("save_every must be > 0".to_string());
        }
        if self.model.dim == 0 || self.model.n_layer == 0 || self.model.num_radial == 0 {
            errors.push("model dim, n_layer and num_radial must be > 0".to_string());
        }
        if self.model.cutoff <= 0.0 {
            errors.push("model cutoff must be > 0".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model dropout must be in [0, 1)".to_string());
        }
        if self.schedule.warmup_epochs <= 0.0 {
            errors.push("schedule warmup_epochs must be > 0".to_string());
        }
        if self.schedule.multiplier <= 0.0 {
            errors.push("schedule multiplier must be > 0".to_string());
        }
        match &self.schedule.policy {
            DecayPolicyConfig::Exponential { gamma } | DecayPolicyConfig::MultiStep { gamma, .. }
                if *gamma <= 0.0 =>
            {
                errors.push("schedule gamma must be > 0".to_string());
            }
            DecayPolicyConfig::OneCycle {
                pct_start,
                div_factor,
                final_div_factor,
                ..
            } => {
                if !(0.0 < *pct_start && *pct_start < 1.0) {
                    errors.push("one-cycle pct_start must be in (0, 1)".to_string());
                }
                if *div_factor <= 0.0 || *final_div_factor <= 0.0 {
                    errors.push("one-cycle div factors must be > 0".to_string());
                }
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(crate::TrainError::Config(errors.join("; ")))
        }
    }

    /// Dataset column for the configured target. The four thermodynamic
    /// energies (7..=10) live five columns further right.
    pub fn target_column(&self) -> usize {
        if (7..=10).contains(&self.target) {
            self.target + 5
        } else {
            self.target
        }
    }

    /// Human-readable name for the configured target
    pub fn target_name(&self) -> &'static str {
        TARGET_NAMES.get(self.target).copied().unwrap_or("unknown")
    }
}
