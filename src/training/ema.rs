/// Exponential Moving Average for model weights
///
/// Maintains a decayed running average of every trainable parameter, used only
/// as an evaluation-time view of the model. The optimizer keeps updating the
/// live weights; the shadow never feeds back into training.
use candle_core::{Tensor, Var};
use std::collections::BTreeMap;

use crate::TrainError;

fn key_mismatch(expected: usize, got: usize) -> TrainError {
    TrainError::ShadowMisuse(format!(
        "parameter set changed: shadow tracks {} tensors, model exposes {}",
        expected, got
    ))
}

/// EMA shadow of a model's parameters
///
/// Keys are fixed at construction from the live parameter set.
/// `EMA_weight = decay * EMA_weight + (1 - decay) * weight`
pub struct ParameterShadow {
    decay: f64,
    shadow: BTreeMap<String, Tensor>,
    /// Live values stashed by `assign`, consumed by `resume`
    backup: Option<Vec<Tensor>>,
    num_updates: u64,
}

impl ParameterShadow {
    /// Snapshot every parameter by value
    ///
    /// # Arguments
    /// * `params` - Named model parameters
    /// * `decay` - Decay rate in (0, 1)
    pub fn new(params: &[(String, Var)], decay: f64) -> crate::Result<Self> {
        if !(0.0 < decay && decay < 1.0) {
            return Err(TrainError::Config(format!(
                "EMA decay must be in (0, 1), got {}",
                decay
            )));
        }

        let mut shadow = BTreeMap::new();
        for (name, var) in params {
            shadow.insert(name.clone(), var.as_tensor().detach().copy()?);
        }

        Ok(Self {
            decay,
            shadow,
            backup: None,
            num_updates: 0,
        })
    }

    fn check_keys(&self, params: &[(String, Var)]) -> crate::Result<()> {
        if params.len() != self.shadow.len() {
            return Err(key_mismatch(self.shadow.len(), params.len()));
        }
        for (name, _) in params {
            if !self.shadow.contains_key(name) {
                return Err(TrainError::ShadowMisuse(format!(
                    "parameter '{}' has no shadow",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Fold the current live values into the shadow
    ///
    /// Call once per optimizer step, after the step has been applied.
    pub fn update(&mut self, params: &[(String, Var)]) -> crate::Result<()> {
        if self.backup.is_some() {
            return Err(TrainError::ShadowMisuse(
                "update called while shadow weights are assigned".to_string(),
            ));
        }
        self.check_keys(params)?;

        for (name, var) in params {
            let live = var.as_tensor().detach();
            if let Some(shadow) = self.shadow.get_mut(name) {
                *shadow = (shadow.affine(self.decay, 0.0)? + live.affine(1.0 - self.decay, 0.0)?)?;
            }
        }

        self.num_updates += 1;
        Ok(())
    }

    /// Stash live values and write the shadow into the model
    ///
    /// Must be paired with [`ParameterShadow::resume`]. Prefer
    /// [`ParameterShadow::swap_in`], which restores on drop.
    pub fn assign(&mut self, params: &[(String, Var)]) -> crate::Result<()> {
        if self.backup.is_some() {
            return Err(TrainError::ShadowMisuse(
                "assign called twice without resume".to_string(),
            ));
        }
        self.check_keys(params)?;

        let mut backup = Vec::with_capacity(params.len());
        for (_, var) in params {
            backup.push(var.as_tensor().detach().copy()?);
        }
        for (name, var) in params {
            if let Some(shadow) = self.shadow.get(name) {
                var.set(shadow)?;
            }
        }

        self.backup = Some(backup);
        Ok(())
    }

    /// Restore the live values stashed by the last `assign`
    pub fn resume(&mut self, params: &[(String, Var)]) -> crate::Result<()> {
        let backup = self.backup.take().ok_or_else(|| {
            TrainError::ShadowMisuse("resume called without a matching assign".to_string())
        })?;
        if backup.len() != params.len() {
            return Err(key_mismatch(backup.len(), params.len()));
        }

        for ((_, var), saved) in params.iter().zip(backup.iter()) {
            var.set(saved)?;
        }
        Ok(())
    }

    /// Scoped assign: live values come back when the guard is finished or dropped
    pub fn swap_in<'a>(&'a mut self, params: &'a [(String, Var)]) -> crate::Result<ShadowGuard<'a>> {
        self.assign(params)?;
        Ok(ShadowGuard {
            shadow: self,
            params,
            restored: false,
        })
    }

    /// Whether shadow values are currently written into the model
    pub fn is_assigned(&self) -> bool {
        self.backup.is_some()
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }

    /// Shadow tensors by parameter name, for checkpointing
    pub fn state(&self) -> &BTreeMap<String, Tensor> {
        &self.shadow
    }

    /// Replace shadow values from a checkpoint
    ///
    /// Every tracked key must be present with a matching shape.
    pub fn load_state(&mut self, mut state: BTreeMap<String, Tensor>) -> crate::Result<()> {
        for (name, current) in self.shadow.iter_mut() {
            let restored = state.remove(name).ok_or_else(|| {
                TrainError::CorruptCheckpoint(format!("shadow state missing parameter '{}'", name))
            })?;
            if restored.dims() != current.dims() {
                return Err(TrainError::CorruptCheckpoint(format!(
                    "shadow shape mismatch for '{}': {:?} vs {:?}",
                    name,
                    restored.dims(),
                    current.dims()
                )));
            }
            *current = restored.to_device(current.device())?.to_dtype(current.dtype())?;
        }
        if let Some(extra) = state.keys().next() {
            return Err(TrainError::CorruptCheckpoint(format!(
                "shadow state has unknown parameter '{}'",
                extra
            )));
        }
        Ok(())
    }
}

/// Holds shadow weights in the model for the lifetime of an evaluation
pub struct ShadowGuard<'a> {
    shadow: &'a mut ParameterShadow,
    params: &'a [(String, Var)],
    restored: bool,
}

impl ShadowGuard<'_> {
    /// Put the live weights back, surfacing any restore error
    pub fn finish(mut self) -> crate::Result<()> {
        self.restored = true;
        self.shadow.resume(self.params)
    }
}

impl Drop for ShadowGuard<'_> {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = self.shadow.resume(self.params) {
                log::error!("Failed to restore live weights after evaluation: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn params(values: &[&[f32]]) -> candle_core::Result<Vec<(String, Var)>> {
        let device = Device::Cpu;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let t = Tensor::from_slice(v, v.len(), &device)?;
                Ok((format!("p{}", i), Var::from_tensor(&t)?))
            })
            .collect()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_shadow_starts_at_live_values() -> crate::Result<()> {
        let params = params(&[&[1.0, 2.0], &[3.0]])?;
        let ema = ParameterShadow::new(&params, 0.9)?;

        assert_eq!(ema.get("p0").unwrap().to_vec1::<f32>()?, vec![1.0, 2.0]);
        assert_eq!(ema.get("p1").unwrap().to_vec1::<f32>()?, vec![3.0]);
        assert_eq!(ema.num_updates(), 0);
        Ok(())
    }

    #[test]
    fn test_shadow_is_a_copy_not_an_alias() -> crate::Result<()> {
        let params = params(&[&[1.0, 1.0]])?;
        let ema = ParameterShadow::new(&params, 0.9)?;

        params[0].1.set(&Tensor::zeros(2, DType::F32, &Device::Cpu)?)?;
        assert_eq!(ema.get("p0").unwrap().to_vec1::<f32>()?, vec![1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_update_rule_per_parameter() -> crate::Result<()> {
        let params = params(&[&[1.0, 2.0], &[-4.0]])?;
        let decay = 0.9;
        let mut ema = ParameterShadow::new(&params, decay)?;

        params[0].1.set(&Tensor::new(&[0.0f32, 10.0], &Device::Cpu)?)?;
        params[1].1.set(&Tensor::new(&[4.0f32], &Device::Cpu)?)?;
        ema.update(&params)?;

        let expected = |prev: f32, live: f32| 0.9f32 * prev + 0.1f32 * live;
        let p0 = ema.get("p0").unwrap().to_vec1::<f32>()?;
        let p1 = ema.get("p1").unwrap().to_vec1::<f32>()?;
        assert!((p0[0] - expected(1.0, 0.0)).abs() < 1e-6);
        assert!((p0[1] - expected(2.0, 10.0)).abs() < 1e-6);
        assert!((p1[0] - expected(-4.0, 4.0)).abs() < 1e-6);
        assert_eq!(ema.num_updates(), 1);

        // Live weights are untouched by the update
        assert_eq!(values(&params[0].1), vec![0.0, 10.0]);
        Ok(())
    }

    #[test]
    fn test_repeated_updates_converge_to_live() -> crate::Result<()> {
        let params = params(&[&[1.0]])?;
        let mut ema = ParameterShadow::new(&params, 0.5)?;
        params[0].1.set(&Tensor::new(&[0.0f32], &Device::Cpu)?)?;

        for _ in 0..3 {
            ema.update(&params)?;
        }
        let v = ema.get("p0").unwrap().to_vec1::<f32>()?[0];
        assert!((v - 0.125).abs() < 1e-7);
        Ok(())
    }

    #[test]
    fn test_assign_resume_restores_bit_identical() -> crate::Result<()> {
        let params = params(&[&[0.1, 0.2, 0.3], &[1e-7]])?;
        let mut ema = ParameterShadow::new(&params, 0.99)?;

        params[0].1.set(&Tensor::new(&[0.7f32, -0.3, 1.0 / 3.0], &Device::Cpu)?)?;
        ema.update(&params)?;
        let before: Vec<Vec<f32>> = params.iter().map(|(_, v)| values(v)).collect();

        ema.assign(&params)?;
        assert!(ema.is_assigned());
        assert_eq!(values(&params[0].1), ema.get("p0").unwrap().to_vec1::<f32>()?);

        ema.resume(&params)?;
        let after: Vec<Vec<f32>> = params.iter().map(|(_, v)| values(v)).collect();
        for (b, a) in before.iter().zip(after.iter()) {
            let b_bits: Vec<u32> = b.iter().map(|x| x.to_bits()).collect();
            let a_bits: Vec<u32> = a.iter().map(|x| x.to_bits()).collect();
            assert_eq!(b_bits, a_bits);
        }
        Ok(())
    }

    #[test]
    fn test_resume_without_assign_is_misuse() -> crate::Result<()> {
        let params = params(&[&[1.0]])?;
        let mut ema = ParameterShadow::new(&params, 0.9)?;

        let err = ema.resume(&params).unwrap_err();
        assert!(matches!(err, TrainError::ShadowMisuse(_)));

        ema.assign(&params)?;
        ema.resume(&params)?;
        assert!(matches!(ema.resume(&params), Err(TrainError::ShadowMisuse(_))));
        Ok(())
    }

    #[test]
    fn test_double_assign_is_misuse() -> crate::Result<()> {
        let params = params(&[&[1.0]])?;
        let mut ema = ParameterShadow::new(&params, 0.9)?;

        ema.assign(&params)?;
        assert!(matches!(ema.assign(&params), Err(TrainError::ShadowMisuse(_))));
        ema.resume(&params)?;
        Ok(())
    }

    #[test]
    fn test_guard_restores_on_drop() -> crate::Result<()> {
        let params = params(&[&[1.0]])?;
        let mut ema = ParameterShadow::new(&params, 0.5)?;
        params[0].1.set(&Tensor::new(&[3.0f32], &Device::Cpu)?)?;
        ema.update(&params)?; // shadow = 2.0

        {
            let _guard = ema.swap_in(&params)?;
            assert_eq!(values(&params[0].1), vec![2.0]);
        }
        assert_eq!(values(&params[0].1), vec![3.0]);
        assert!(!ema.is_assigned());

        let guard = ema.swap_in(&params)?;
        guard.finish()?;
        assert_eq!(values(&params[0].1), vec![3.0]);
        Ok(())
    }

    #[test]
    fn test_update_rejects_changed_parameter_set() -> crate::Result<()> {
        let params_a = params(&[&[1.0]])?;
        let params_b = params(&[&[1.0], &[2.0]])?;
        let mut ema = ParameterShadow::new(&params_a, 0.9)?;

        assert!(matches!(ema.update(&params_b), Err(TrainError::ShadowMisuse(_))));
        Ok(())
    }

    #[test]
    fn test_invalid_decay() -> candle_core::Result<()> {
        let params = params(&[&[1.0]])?;
        assert!(ParameterShadow::new(&params, 1.0).is_err());
        assert!(ParameterShadow::new(&params, 0.0).is_err());
        Ok(())
    }

    #[test]
    fn test_load_state_round_trip() -> crate::Result<()> {
        let params = params(&[&[1.0, 2.0]])?;
        let mut ema = ParameterShadow::new(&params, 0.9)?;

        let mut state = BTreeMap::new();
        state.insert("p0".to_string(), Tensor::new(&[5.0f32, 6.0], &Device::Cpu)?);
        ema.load_state(state)?;
        assert_eq!(ema.get("p0").unwrap().to_vec1::<f32>()?, vec![5.0, 6.0]);

        let bad = BTreeMap::new();
        assert!(matches!(ema.load_state(bad), Err(TrainError::CorruptCheckpoint(_))));
        Ok(())
    }
}
