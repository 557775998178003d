/// Epoch-level training loop for property models
use candle_core::{DType, Device, Var};
use std::fmt;
use std::path::Path;

use super::checkpoint::{CheckpointRecord, CheckpointStore};
use super::clip::clip_grad_norm;
use super::ema::ParameterShadow;
use super::evaluator::evaluate;
use super::optimizer::{Adam, AdamConfig};
use super::scheduler::ScheduleComposer;
use crate::config::TrainConfig;
use crate::data::BatchDataLoader;
use crate::models::PropertyModel;
use crate::TrainError;

/// True when a periodic checkpoint is due after `completed_epochs`
pub fn is_checkpoint_epoch(completed_epochs: usize, save_every: usize) -> bool {
    save_every > 0 && completed_epochs > 0 && completed_epochs % save_every == 0
}

/// Best-so-far validation tracking
///
/// Ties count as improvements, so the latest of several equal epochs wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestTracker {
    best_epoch: Option<usize>,
    best_val_loss: Option<f64>,
    test_loss: Option<f64>,
}

impl BestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a checkpoint's best-so-far values
    pub fn from_checkpoint(valid_loss_min: f64, best_epoch: Option<usize>, test_loss: Option<f64>) -> Self {
        Self {
            best_epoch,
            best_val_loss: Some(valid_loss_min),
            test_loss,
        }
    }

    /// First observation, or `val_loss <= best`
    pub fn is_improvement(&self, val_loss: f64) -> bool {
        match self.best_val_loss {
            None => true,
            Some(best) => val_loss <= best,
        }
    }

    pub fn record(&mut self, epoch: usize, val_loss: f64, test_loss: f64) {
        self.best_epoch = Some(epoch);
        self.best_val_loss = Some(val_loss);
        self.test_loss = Some(test_loss);
    }

    /// 0-based epoch of the best validation loss
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    /// Test MAE measured at the best epoch
    pub fn test_loss(&self) -> Option<f64> {
        self.test_loss
    }
}

/// One line of per-epoch progress
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// 1-based epoch number
    pub epoch: usize,
    /// Learning rate currently in the optimizer
    pub lr: f64,
    /// Rate of the decay policy alone
    pub policy_lr: f64,
    pub train_mae: f64,
    pub valid_mae: f64,
    /// Test MAE at the best epoch so far
    pub test_mae: f64,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch: {:03}, LR: {:.7}, LLR: {:.7}, Train MAE: {:.7}, Validation MAE: {:.7}, Test MAE: {:.7}",
            self.epoch, self.lr, self.policy_lr, self.train_mae, self.valid_mae, self.test_mae
        )
    }
}

/// Outcome of [`Trainer::fit`]
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub test_loss: Option<f64>,
    /// Reports for the epochs run by this call
    pub history: Vec<EpochReport>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.best_epoch, self.test_loss) {
            (Some(epoch), Some(test)) => write!(f, "Best Epoch: {}, Best Test MAE: {:.7}", epoch, test),
            (Some(epoch), None) => write!(f, "Best Epoch: {}, Best Test MAE: n/a", epoch),
            _ => write!(f, "Best Epoch: none, Best Test MAE: n/a"),
        }
    }
}

/// Trainer for a [`PropertyModel`]
///
/// Owns the optimizer, the learning-rate schedule, the EMA shadow and the
/// checkpoint store. Per batch the order is fixed: forward, MAE loss,
/// backward, clip, optimizer step, schedule step, shadow update.
pub struct Trainer<M: PropertyModel> {
    model: M,
    params: Vec<(String, Var)>,
    optimizer: Adam,
    scheduler: ScheduleComposer,
    shadow: ParameterShadow,
    store: CheckpointStore,
    config: TrainConfig,
    device: Device,
    start_epoch: usize,
    global_step: usize,
    best: BestTracker,
}

impl<M: PropertyModel> Trainer<M> {
    /// Create new trainer
    ///
    /// # Arguments
    /// * `model` - Model to train
    /// * `config` - Run configuration, validated here
    /// * `steps_per_epoch` - Training batches per epoch (sizes one-cycle)
    /// * `device` - Device batches are placed on
    pub fn new(model: M, config: &TrainConfig, steps_per_epoch: usize, device: Device) -> crate::Result<Self> {
        config.validate()?;

        let params = model.parameters();
        let scheduler = ScheduleComposer::from_config(config, steps_per_epoch)?;
        let optimizer = Adam::new(
            params.clone(),
            AdamConfig {
                lr: scheduler.initial_rate(),
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: config.weight_decay,
            },
        )?;
        let shadow = ParameterShadow::new(&params, config.ema_decay)?;

        log::info!(
            "Trainer ready: {} parameter tensors, {} steps per epoch, {} epochs",
            params.len(),
            steps_per_epoch,
            config.epochs
        );

        Ok(Self {
            model,
            params,
            optimizer,
            scheduler,
            shadow,
            store: CheckpointStore::new(config),
            config: config.clone(),
            device,
            start_epoch: 0,
            global_step: 0,
            best: BestTracker::new(),
        })
    }

    /// Restore model, optimizer, schedule and best-so-far from a checkpoint
    ///
    /// Training continues at the checkpoint's next epoch. A checkpoint without
    /// shadow tensors re-snapshots the shadow from the restored weights.
    pub fn resume_from(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        let resumed = CheckpointStore::load_into(path, &self.params, &mut self.optimizer, &mut self.scheduler)?;

        match resumed.shadow {
            Some(shadow) => self.shadow.load_state(shadow)?,
            None => {
                log::warn!("Checkpoint has no EMA shadow; starting it from the restored weights");
                self.shadow = ParameterShadow::new(&self.params, self.config.ema_decay)?;
            }
        }

        self.start_epoch = resumed.next_epoch;
        self.global_step = self.optimizer.step_count();
        self.best = BestTracker::from_checkpoint(resumed.valid_loss_min, resumed.best_epoch, resumed.test_loss);

        log::info!("start_epoch = {}", self.start_epoch);
        log::info!("valid_loss_min = {:.6}", resumed.valid_loss_min);
        Ok(())
    }

    /// Run one pass over `loader`
    ///
    /// # Returns
    /// Sum of per-batch loss times batch size, divided by the dataset size
    pub fn train_epoch(&mut self, epoch: usize, loader: &mut dyn BatchDataLoader) -> crate::Result<f64> {
        let len = loader.dataset_len();
        if len == 0 {
            return Err(TrainError::Data("training set is empty".to_string()));
        }
        let num_batches = loader.num_batches().max(1) as f64;

        loader.reset();
        let mut loss_all = 0.0f64;
        let mut step = 0usize;

        while let Some(batch) = loader.next_batch(&self.device)? {
            let output = self.model.forward_t(&batch, true)?;
            let loss = output.sub(&batch.targets)?.abs()?.mean_all()?;
            let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            if !loss_value.is_finite() {
                return Err(TrainError::NumericInstability {
                    epoch,
                    step,
                    loss: loss_value,
                });
            }
            loss_all += loss_value * batch.num_graphs as f64;

            let mut grads = loss.backward()?;
            let grad_norm = clip_grad_norm(&self.params, &mut grads, self.config.max_grad_norm)?;
            self.optimizer.step(&grads)?;

            let virtual_epoch = epoch as f64 + step as f64 / num_batches;
            let lr = self.scheduler.step(virtual_epoch)?;
            self.optimizer.set_learning_rate(lr);

            self.shadow.update(&self.params)?;

            log::debug!(
                "epoch {} step {}: loss={:.6}, grad_norm={:.4}, lr={:.7}",
                epoch,
                step,
                loss_value,
                grad_norm,
                lr
            );

            step += 1;
            self.global_step += 1;
        }

        Ok(loss_all / len as f64)
    }

    /// Full training loop from the current start epoch to `config.epochs`
    pub fn fit(
        &mut self,
        train: &mut dyn BatchDataLoader,
        valid: &mut dyn BatchDataLoader,
        test: &mut dyn BatchDataLoader,
    ) -> crate::Result<RunSummary> {
        log::info!("===================================================================================");
        log::info!("Start training: epochs {}..{}", self.start_epoch, self.config.epochs);
        log::info!("===================================================================================");

        let mut history = Vec::new();

        for epoch in self.start_epoch..self.config.epochs {
            let train_loss = self.train_epoch(epoch, train)?;
            let val_loss = evaluate(&self.model, &mut self.shadow, &self.params, valid, &self.device)?;

            let is_best = self.best.is_improvement(val_loss);
            if is_best {
                let test_loss = evaluate(&self.model, &mut self.shadow, &self.params, test, &self.device)?;
                self.best.record(epoch, val_loss, test_loss);
            }

            let completed = epoch + 1;
            if is_checkpoint_epoch(completed, self.config.save_every) {
                let record = self.checkpoint_record(completed)?;
                let periodic = self.store.periodic_path(completed, train_loss, val_loss);
                self.store.save(&record, is_best, &periodic, &self.store.best_path())?;
            } else if is_best {
                let record = self.checkpoint_record(completed)?;
                self.store.save_best(&record, &self.store.best_path())?;
            }

            let report = EpochReport {
                epoch: completed,
                lr: self.optimizer.learning_rate(),
                policy_lr: self.scheduler.policy_rate(),
                train_mae: train_loss,
                valid_mae: val_loss,
                test_mae: self.best.test_loss().unwrap_or(f64::NAN),
            };
            log::info!("{}", report);
            history.push(report);

            self.start_epoch = completed;
        }

        let summary = RunSummary {
            best_epoch: self.best.best_epoch(),
            best_val_loss: self.best.best_val_loss(),
            test_loss: self.best.test_loss(),
            history,
        };
        log::info!("===================================================================================");
        log::info!("{}", summary);
        Ok(summary)
    }

    fn checkpoint_record(&self, next_epoch: usize) -> crate::Result<CheckpointRecord> {
        let valid_loss_min = self.best.best_val_loss().unwrap_or(f64::INFINITY);
        let mut record =
            CheckpointRecord::capture(next_epoch, valid_loss_min, &self.params, &self.optimizer, &self.scheduler)?;
        record.shadow = Some(self.shadow.state().clone());
        record.best_epoch = self.best.best_epoch();
        record.test_loss = self.best.test_loss();
        Ok(record)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &ScheduleComposer {
        &self.scheduler
    }

    pub fn shadow(&self) -> &ParameterShadow {
        &self.shadow
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn best(&self) -> &BestTracker {
        &self.best
    }

    /// Epoch the next call to `fit` starts at
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Optimizer steps taken over the whole run
    pub fn global_step(&self) -> usize {
        self.global_step
    }
}
