/// Training checkpoints with safetensors
///
/// One `.cpt` file holds a whole checkpoint record: tensors (model weights,
/// Adam moments, optionally the EMA shadow) in the safetensors body and the
/// scalar state as string metadata in the header.
use candle_core::{Device, Tensor, Var};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::optimizer::{Adam, AdamState, ParamState};
use super::scheduler::{ScheduleComposer, ScheduleState};
use crate::config::TrainConfig;
use crate::TrainError;

pub const CHECKPOINT_VERSION: u32 = 1;

const KEY_VERSION: &str = "format_version";
const KEY_EPOCH: &str = "epoch";
const KEY_VALID_LOSS_MIN: &str = "valid_loss_min";
const KEY_OPTIMIZER: &str = "optimizer";
const KEY_SCHEDULER: &str = "scheduler";
const KEY_BEST_EPOCH: &str = "best_epoch";
const KEY_TEST_LOSS: &str = "test_loss";

const PREFIX_STATE_DICT: &str = "state_dict.";
const PREFIX_EXP_AVG: &str = "optimizer.exp_avg.";
const PREFIX_EXP_AVG_SQ: &str = "optimizer.exp_avg_sq.";
const PREFIX_SHADOW: &str = "shadow.";

/// Everything needed to resume a run
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Next epoch to run
    pub epoch: usize,
    /// Best validation loss seen so far
    pub valid_loss_min: f64,
    /// Model parameters by name
    pub state_dict: BTreeMap<String, Tensor>,
    /// Adam scalar state
    pub optimizer: AdamState,
    /// Adam moments by parameter name
    pub optimizer_moments: BTreeMap<String, ParamState>,
    /// Learning-rate schedule position
    pub scheduler: ScheduleState,
    /// EMA shadow values, when saved
    pub shadow: Option<BTreeMap<String, Tensor>>,
    /// Epoch (0-based) that produced `valid_loss_min`
    pub best_epoch: Option<usize>,
    /// Test MAE measured at `best_epoch`
    pub test_loss: Option<f64>,
}

impl CheckpointRecord {
    /// Snapshot live training state
    pub fn capture(
        epoch: usize,
        valid_loss_min: f64,
        params: &[(String, Var)],
        optimizer: &Adam,
        scheduler: &ScheduleComposer,
    ) -> crate::Result<Self> {
        let mut state_dict = BTreeMap::new();
        for (name, var) in params {
            state_dict.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        let (optimizer_state, moments) = optimizer.state();
        Ok(Self {
            epoch,
            valid_loss_min,
            state_dict,
            optimizer: optimizer_state,
            optimizer_moments: moments.clone(),
            scheduler: scheduler.state(),
            shadow: None,
            best_epoch: None,
            test_loss: None,
        })
    }

    fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for (name, t) in &self.state_dict {
            tensors.push((format!("{}{}", PREFIX_STATE_DICT, name), t.clone()));
        }
        for (name, state) in &self.optimizer_moments {
            tensors.push((format!("{}{}", PREFIX_EXP_AVG, name), state.exp_avg.clone()));
            tensors.push((format!("{}{}", PREFIX_EXP_AVG_SQ, name), state.exp_avg_sq.clone()));
        }
        if let Some(shadow) = &self.shadow {
            for (name, t) in shadow {
                tensors.push((format!("{}{}", PREFIX_SHADOW, name), t.clone()));
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(KEY_VERSION.to_string(), CHECKPOINT_VERSION.to_string());
        metadata.insert(KEY_EPOCH.to_string(), self.epoch.to_string());
        metadata.insert(KEY_VALID_LOSS_MIN.to_string(), self.valid_loss_min.to_string());
        metadata.insert(KEY_OPTIMIZER.to_string(), serde_json::to_string(&self.optimizer)?);
        metadata.insert(KEY_SCHEDULER.to_string(), serde_json::to_string(&self.scheduler)?);
        if let Some(best_epoch) = self.best_epoch {
            metadata.insert(KEY_BEST_EPOCH.to_string(), best_epoch.to_string());
        }
        if let Some(test_loss) = self.test_loss {
            metadata.insert(KEY_TEST_LOSS.to_string(), test_loss.to_string());
        }

        Ok(safetensors::serialize(tensors, &Some(metadata))?)
    }

    fn from_bytes(data: &[u8], device: &Device) -> crate::Result<Self> {
        let (_, header) = SafeTensors::read_metadata(data)
            .map_err(|e| TrainError::CorruptCheckpoint(format!("unreadable header: {}", e)))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = candle_core::safetensors::load_buffer(data, device)
            .map_err(|e| TrainError::CorruptCheckpoint(format!("unreadable tensors: {}", e)))?;

        let version: u32 = parse_required(&metadata, KEY_VERSION)?;
        if version != CHECKPOINT_VERSION {
            return Err(TrainError::CorruptCheckpoint(format!(
                "unsupported checkpoint version {} (expected {})",
                version, CHECKPOINT_VERSION
            )));
        }
        let epoch: usize = parse_required(&metadata, KEY_EPOCH)?;
        let valid_loss_min: f64 = parse_required(&metadata, KEY_VALID_LOSS_MIN)?;
        let optimizer: AdamState = json_required(&metadata, KEY_OPTIMIZER)?;
        let scheduler: ScheduleState = json_required(&metadata, KEY_SCHEDULER)?;
        let best_epoch = parse_optional(&metadata, KEY_BEST_EPOCH)?;
        let test_loss = parse_optional(&metadata, KEY_TEST_LOSS)?;

        let mut state_dict = BTreeMap::new();
        let mut exp_avg = BTreeMap::new();
        let mut exp_avg_sq = BTreeMap::new();
        let mut shadow = BTreeMap::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(PREFIX_STATE_DICT) {
                state_dict.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(PREFIX_EXP_AVG_SQ) {
                exp_avg_sq.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(PREFIX_EXP_AVG) {
                exp_avg.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix(PREFIX_SHADOW) {
                shadow.insert(name.to_string(), tensor);
            } else {
                log::warn!("Ignoring unrecognised checkpoint tensor '{}'", key);
            }
        }

        if state_dict.is_empty() {
            return Err(TrainError::CorruptCheckpoint(
                "missing required key 'state_dict'".to_string(),
            ));
        }

        let mut optimizer_moments = BTreeMap::new();
        for (name, m) in exp_avg {
            let v = exp_avg_sq.remove(&name).ok_or_else(|| {
                TrainError::CorruptCheckpoint(format!("optimizer moment pair incomplete for '{}'", name))
            })?;
            optimizer_moments.insert(
                name,
                ParamState {
                    exp_avg: m,
                    exp_avg_sq: v,
                },
            );
        }
        if let Some(name) = exp_avg_sq.keys().next() {
            return Err(TrainError::CorruptCheckpoint(format!(
                "optimizer moment pair incomplete for '{}'",
                name
            )));
        }

        Ok(Self {
            epoch,
            valid_loss_min,
            state_dict,
            optimizer,
            optimizer_moments,
            scheduler,
            shadow: if shadow.is_empty() { None } else { Some(shadow) },
            best_epoch,
            test_loss,
        })
    }
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str) -> crate::Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TrainError::CorruptCheckpoint(format!("missing required key '{}'", key)))
}

fn parse_required<T: std::str::FromStr>(metadata: &HashMap<String, String>, key: &str) -> crate::Result<T> {
    let raw = required(metadata, key)?;
    raw.parse()
        .map_err(|_| TrainError::CorruptCheckpoint(format!("invalid value '{}' for '{}'", raw, key)))
}

fn parse_optional<T: std::str::FromStr>(
    metadata: &HashMap<String, String>,
    key: &str,
) -> crate::Result<Option<T>> {
    match metadata.get(key) {
        Some(_) => parse_required(metadata, key).map(Some),
        None => Ok(None),
    }
}

fn json_required<T: serde::de::DeserializeOwned>(
    metadata: &HashMap<String, String>,
    key: &str,
) -> crate::Result<T> {
    let raw = required(metadata, key)?;
    serde_json::from_str(raw)
        .map_err(|e| TrainError::CorruptCheckpoint(format!("invalid '{}' state: {}", key, e)))
}

/// State handed back to the trainer after restoring a checkpoint
#[derive(Debug, Clone)]
pub struct Resumed {
    pub next_epoch: usize,
    pub valid_loss_min: f64,
    pub best_epoch: Option<usize>,
    pub test_loss: Option<f64>,
    pub shadow: Option<BTreeMap<String, Tensor>>,
}

/// Reads and writes the periodic and best-so-far checkpoint files
///
/// Cadence is decided by the caller.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    target: usize,
}

impl CheckpointStore {
    pub fn new(config: &TrainConfig) -> Self {
        Self {
            dir: config.checkpoint_dir.clone(),
            target: config.target,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{dir}/target-{t}-{epoch}-train-{train:.3}-val-{val:.3}.cpt`
    pub fn periodic_path(&self, epoch: usize, train_loss: f64, val_loss: f64) -> PathBuf {
        self.dir.join(format!(
            "target-{}-{}-train-{:.3}-val-{:.3}.cpt",
            self.target, epoch, train_loss, val_loss
        ))
    }

    /// `{dir}/target-{t}-best-epoch.cpt`
    pub fn best_path(&self) -> PathBuf {
        self.dir.join(format!("target-{}-best-epoch.cpt", self.target))
    }

    /// Overwrite `periodic_path`, and `best_path` too when `is_best`
    ///
    /// The two files are written independently; a failure on the second
    /// write leaves the first intact.
    pub fn save(
        &self,
        record: &CheckpointRecord,
        is_best: bool,
        periodic_path: &Path,
        best_path: &Path,
    ) -> crate::Result<()> {
        let bytes = record.to_bytes()?;
        write_file(periodic_path, &bytes)?;
        log::info!("Saved checkpoint to {}", periodic_path.display());
        if is_best {
            write_file(best_path, &bytes)?;
            log::info!("Saved best checkpoint to {}", best_path.display());
        }
        Ok(())
    }

    /// Overwrite only the best-so-far file
    pub fn save_best(&self, record: &CheckpointRecord, best_path: &Path) -> crate::Result<()> {
        write_file(best_path, &record.to_bytes()?)?;
        log::info!("Saved best checkpoint to {}", best_path.display());
        Ok(())
    }

    /// Read a checkpoint record
    pub fn load(path: impl AsRef<Path>, device: &Device) -> crate::Result<CheckpointRecord> {
        let data = std::fs::read(path.as_ref())?;
        CheckpointRecord::from_bytes(&data, device)
    }

    /// Read a checkpoint and restore model weights, optimizer and schedule
    ///
    /// Every model parameter must be present in the record with its shape.
    pub fn load_into(
        path: impl AsRef<Path>,
        params: &[(String, Var)],
        optimizer: &mut Adam,
        scheduler: &mut ScheduleComposer,
    ) -> crate::Result<Resumed> {
        let path = path.as_ref();
        let device = params
            .first()
            .map(|(_, v)| v.as_tensor().device().clone())
            .unwrap_or(Device::Cpu);
        let mut record = Self::load(path, &device)?;

        for (name, var) in params {
            let tensor = record.state_dict.remove(name).ok_or_else(|| {
                TrainError::CorruptCheckpoint(format!("checkpoint missing parameter '{}'", name))
            })?;
            if tensor.dims() != var.as_tensor().dims() {
                return Err(TrainError::CorruptCheckpoint(format!(
                    "shape mismatch for '{}': checkpoint {:?}, model {:?}",
                    name,
                    tensor.dims(),
                    var.as_tensor().dims()
                )));
            }
            var.set(&tensor.to_dtype(var.as_tensor().dtype())?)?;
        }
        if let Some(extra) = record.state_dict.keys().next() {
            return Err(TrainError::CorruptCheckpoint(format!(
                "checkpoint contains unused parameter '{}'",
                extra
            )));
        }

        optimizer.load_state(record.optimizer, record.optimizer_moments)?;
        scheduler.load_state(record.scheduler)?;

        log::info!(
            "Restored checkpoint {} (next epoch {}, valid_loss_min {:.6})",
            path.display(),
            record.epoch,
            record.valid_loss_min
        );

        Ok(Resumed {
            next_epoch: record.epoch,
            valid_loss_min: record.valid_loss_min,
            best_epoch: record.best_epoch,
            test_loss: record.test_loss,
            shadow: record.shadow,
        })
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizer::AdamConfig;
    use crate::training::scheduler::DecayPolicy;
    use candle_core::DType;

    fn setup() -> crate::Result<(Vec<(String, Var)>, Adam, ScheduleComposer)> {
        let device = Device::Cpu;
        let params = vec![
            (
                "layer.bias".to_string(),
                Var::from_tensor(&Tensor::new(&[0.5f32, -0.25], &device)?)?,
            ),
            (
                "layer.weight".to_string(),
                Var::from_tensor(&Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device)?)?,
            ),
        ];
        let mut optimizer = Adam::new(params.clone(), AdamConfig::default())?;
        let loss = (params[0].1.as_tensor().sum_all()? + params[1].1.as_tensor().sqr()?.sum_all()?)?;
        optimizer.step(&loss.backward()?)?;

        let mut scheduler = ScheduleComposer::new(1e-3, 1.0, 1.0, DecayPolicy::Exponential { gamma: 0.9 })?;
        scheduler.step(0.0)?;
        scheduler.step(1.5)?;
        Ok((params, optimizer, scheduler))
    }

    fn store(dir: &Path) -> CheckpointStore {
        let config = TrainConfig {
            checkpoint_dir: dir.to_path_buf(),
            target: 7,
            ..Default::default()
        };
        CheckpointStore::new(&config)
    }

    #[test]
    fn test_file_names() {
        let store = store(Path::new("ckpt"));
        assert_eq!(
            store.periodic_path(5, 0.123456, 1.0),
            PathBuf::from("ckpt/target-7-5-train-0.123-val-1.000.cpt")
        );
        assert_eq!(store.best_path(), PathBuf::from("ckpt/target-7-best-epoch.cpt"));
    }

    #[test]
    fn test_save_load_round_trip() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path());
        let (params, optimizer, scheduler) = setup()?;

        let mut record = CheckpointRecord::capture(10, 0.0421, &params, &optimizer, &scheduler)?;
        record.best_epoch = Some(8);
        record.test_loss = Some(0.05);
        let periodic = store.periodic_path(10, 0.1, 0.0421);
        store.save(&record, false, &periodic, &store.best_path())?;
        assert!(periodic.exists());
        assert!(!store.best_path().exists());

        let loaded = CheckpointStore::load(&periodic, &Device::Cpu)?;
        assert_eq!(loaded.epoch, 10);
        assert_eq!(loaded.valid_loss_min, 0.0421);
        assert_eq!(loaded.best_epoch, Some(8));
        assert_eq!(loaded.test_loss, Some(0.05));
        assert_eq!(loaded.optimizer, record.optimizer);
        assert_eq!(loaded.scheduler, record.scheduler);
        assert!(loaded.shadow.is_none());

        for (name, t) in &record.state_dict {
            let back = &loaded.state_dict[name];
            assert_eq!(back.dims(), t.dims());
            assert_eq!(
                back.flatten_all()?.to_vec1::<f32>()?,
                t.flatten_all()?.to_vec1::<f32>()?
            );
        }
        for (name, m) in &record.optimizer_moments {
            let back = &loaded.optimizer_moments[name];
            assert_eq!(
                back.exp_avg_sq.flatten_all()?.to_vec1::<f32>()?,
                m.exp_avg_sq.flatten_all()?.to_vec1::<f32>()?
            );
        }
        Ok(())
    }

    #[test]
    fn test_best_written_only_when_flagged() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path());
        let (params, optimizer, scheduler) = setup()?;
        let record = CheckpointRecord::capture(5, 0.3, &params, &optimizer, &scheduler)?;

        store.save(&record, true, &store.periodic_path(5, 0.4, 0.3), &store.best_path())?;
        assert!(store.best_path().exists());

        let best = CheckpointStore::load(store.best_path(), &Device::Cpu)?;
        assert_eq!(best.epoch, 5);
        Ok(())
    }

    #[test]
    fn test_load_into_restores_state() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store(tmp.path());
        let (params, optimizer, scheduler) = setup()?;
        let record = CheckpointRecord::capture(3, 0.7, &params, &optimizer, &scheduler)?;
        store.save_best(&record, &store.best_path())?;

        // Fresh objects with different values
        let device = Device::Cpu;
        let fresh = vec![
            ("layer.bias".to_string(), Var::zeros(2, DType::F32, &device)?),
            ("layer.weight".to_string(), Var::zeros((2, 2), DType::F32, &device)?),
        ];
        let mut fresh_opt = Adam::new(fresh.clone(), AdamConfig::default())?;
        let mut fresh_sched =
            ScheduleComposer::new(1e-3, 1.0, 1.0, DecayPolicy::Exponential { gamma: 0.9 })?;

        let resumed = CheckpointStore::load_into(store.best_path(), &fresh, &mut fresh_opt, &mut fresh_sched)?;
        assert_eq!(resumed.next_epoch, 3);
        assert_eq!(resumed.valid_loss_min, 0.7);
        assert_eq!(fresh_opt.step_count(), 1);
        assert_eq!(fresh_sched.state(), scheduler.state());
        assert_eq!(
            fresh[1].1.as_tensor().to_vec2::<f32>()?,
            params[1].1.as_tensor().to_vec2::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_missing_key_is_corrupt() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("broken.cpt");

        // Valid safetensors without the scheduler entry
        let t = Tensor::new(&[1.0f32], &Device::Cpu)?;
        let mut metadata = HashMap::new();
        metadata.insert(KEY_VERSION.to_string(), "1".to_string());
        metadata.insert(KEY_EPOCH.to_string(), "4".to_string());
        metadata.insert(KEY_VALID_LOSS_MIN.to_string(), "0.5".to_string());
        let bytes = safetensors::serialize(vec![("state_dict.w".to_string(), t)], &Some(metadata))?;
        std::fs::write(&path, bytes)?;

        match CheckpointStore::load(&path, &Device::Cpu) {
            Err(TrainError::CorruptCheckpoint(msg)) => assert!(msg.contains("optimizer")),
            other => panic!("expected CorruptCheckpoint, got {:?}", other.map(|r| r.epoch)),
        }
        Ok(())
    }

    #[test]
    fn test_garbage_file_is_corrupt() -> crate::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("garbage.cpt");
        std::fs::write(&path, b"not a checkpoint")?;

        assert!(matches!(
            CheckpointStore::load(&path, &Device::Cpu),
            Err(TrainError::CorruptCheckpoint(_))
        ));
        Ok(())
    }
}
