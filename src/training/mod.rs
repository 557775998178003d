/// Training infrastructure: EMA shadow, schedules, checkpoints and the epoch loop
pub mod checkpoint;
pub mod clip;
pub mod ema;
pub mod evaluator;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointRecord, CheckpointStore, Resumed};
pub use clip::clip_grad_norm;
pub use ema::{ParameterShadow, ShadowGuard};
pub use evaluator::evaluate;
pub use optimizer::{Adam, AdamConfig};
pub use scheduler::{DecayPolicy, OneCycle, ScheduleComposer, ScheduleUnit};
pub use trainer::{BestTracker, EpochReport, RunSummary, Trainer};
