//! Molecular property regression with EMA-shadowed evaluation
//!
//! Trains a message-passing network on QM9-style molecular graphs and scores
//! it under an exponential moving average of its weights.
//!
//! # Architecture
//!
//! The training core is made of:
//! - **ParameterShadow**: EMA of the live parameters, swapped in for evaluation
//! - **ScheduleComposer**: linear warmup on a fractional-epoch axis composed
//!   with an exponential, multi-step or one-cycle decay policy
//! - **CheckpointStore**: periodic and best-so-far safetensors snapshots
//! - **Trainer**: the epoch loop tying the above together
//!
//! # Example
//!
//! ```ignore
//! use molprop::{TrainConfig, Trainer, MessagePassingNet};
//!
//! let config = TrainConfig::default();
//! let model = MessagePassingNet::new(&config.model, &device)?;
//! let mut trainer = Trainer::new(model, &config, train.num_batches(), device)?;
//! let summary = trainer.fit(&mut train, &mut valid, &mut test)?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{ModelConfig, ScheduleConfig, TrainConfig};
pub use models::{MessagePassingNet, PropertyModel};
pub use training::{RunSummary, Trainer};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("Non-finite loss {loss} at epoch {epoch}, step {step}")]
    NumericInstability { epoch: usize, step: usize, loss: f64 },

    #[error("Parameter shadow misuse: {0}")]
    ShadowMisuse(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
