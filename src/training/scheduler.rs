/// Learning-rate schedules: linear warmup composed with a decay policy
///
/// Warmup is addressed on a continuous "virtual epoch" axis
/// (`epoch + batch_index / batches_per_epoch`) so the ramp advances every
/// batch. Once warmup ends the decay policy takes over on its own integer
/// epoch count. One-cycle is the exception: it owns the whole run and counts
/// optimizer steps, never epochs.
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::config::{DecayPolicyConfig, ScheduleConfig, TrainConfig};
use crate::TrainError;

/// Unit a policy advances in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleUnit {
    /// Driven by the fractional virtual epoch; warmup applies
    FractionalEpoch,
    /// One tick per `step` call; warmup is bypassed
    Step,
}

/// One-cycle learning rate with cosine annealing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneCycle {
    pub max_lr: f64,
    pub total_steps: usize,
    pub pct_start: f64,
    pub div_factor: f64,
    pub final_div_factor: f64,
}

impl OneCycle {
    pub fn initial_lr(&self) -> f64 {
        self.max_lr / self.div_factor
    }

    pub fn min_lr(&self) -> f64 {
        self.initial_lr() / self.final_div_factor
    }

    /// Cosine interpolation from `start` to `end` at `pct` in [0, 1]
    fn anneal(start: f64, end: f64, pct: f64) -> f64 {
        end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
    }

    /// Rate at optimizer step `step` (0-based)
    ///
    /// Ramps from `max_lr / div_factor` up to `max_lr` over the first
    /// `pct_start` of the budget, then anneals down to
    /// `initial_lr / final_div_factor` at step `total_steps - 1`.
    pub fn lr_at(&self, step: usize) -> f64 {
        let peak_step = self.pct_start * self.total_steps as f64 - 1.0;
        let last_step = self.total_steps as f64 - 1.0;
        let step = step as f64;

        if step <= peak_step {
            let pct = if peak_step > 0.0 { step / peak_step } else { 1.0 };
            Self::anneal(self.initial_lr(), self.max_lr, pct)
        } else {
            let span = last_step - peak_step;
            let pct = if span > 0.0 { (step - peak_step) / span } else { 1.0 };
            Self::anneal(self.max_lr, self.min_lr(), pct)
        }
    }
}

/// Policy that drives the learning rate once warmup is over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecayPolicy {
    /// `peak * gamma^epoch`
    Exponential { gamma: f64 },
    /// `peak * gamma^(number of milestones <= epoch)`
    MultiStep { milestones: Vec<usize>, gamma: f64 },
    /// Owns the entire run; counted in optimizer steps
    OneCycle(OneCycle),
}

impl DecayPolicy {
    pub fn unit(&self) -> ScheduleUnit {
        match self {
            DecayPolicy::Exponential { .. } | DecayPolicy::MultiStep { .. } => {
                ScheduleUnit::FractionalEpoch
            }
            DecayPolicy::OneCycle(_) => ScheduleUnit::Step,
        }
    }

    /// Rate at `position`: post-warmup epoch for epoch policies, step index for one-cycle
    pub fn advance(&self, peak: f64, position: usize) -> f64 {
        match self {
            DecayPolicy::Exponential { gamma } => peak * gamma.powi(position as i32),
            DecayPolicy::MultiStep { milestones, gamma } => {
                let passed = milestones.iter().filter(|&&m| m <= position).count();
                peak * gamma.powi(passed as i32)
            }
            DecayPolicy::OneCycle(cycle) => cycle.lr_at(position),
        }
    }
}

/// Serializable schedule position, stored in checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Last virtual epoch seen (epoch policies)
    pub virtual_epoch: f64,
    /// Post-warmup integer epoch, or steps taken for one-cycle
    pub policy_position: Option<usize>,
    pub last_rate: f64,
    pub base_rate: f64,
    pub warmup_epochs: f64,
    pub multiplier: f64,
    pub policy: DecayPolicy,
}

/// Linear warmup composed with a decay policy
#[derive(Debug, Clone)]
pub struct ScheduleComposer {
    base_rate: f64,
    warmup_epochs: f64,
    multiplier: f64,
    policy: DecayPolicy,
    virtual_epoch: f64,
    policy_position: Option<usize>,
    last_rate: f64,
}

impl ScheduleComposer {
    /// Create new composer
    ///
    /// # Arguments
    /// * `base_rate` - Base learning rate
    /// * `warmup_epochs` - Warmup length in epochs (> 0)
    /// * `multiplier` - Warmup target is `multiplier * base_rate`
    /// * `policy` - Post-warmup policy
    pub fn new(
        base_rate: f64,
        warmup_epochs: f64,
        multiplier: f64,
        policy: DecayPolicy,
    ) -> crate::Result<Self> {
        if base_rate <= 0.0 {
            return Err(TrainError::Schedule("base learning rate must be > 0".to_string()));
        }
        if warmup_epochs <= 0.0 {
            return Err(TrainError::Schedule("warmup length must be > 0".to_string()));
        }
        if multiplier <= 0.0 {
            return Err(TrainError::Schedule("warmup multiplier must be > 0".to_string()));
        }
        if let DecayPolicy::OneCycle(cycle) = &policy {
            if cycle.total_steps == 0 {
                return Err(TrainError::Schedule(
                    "one-cycle needs a step budget greater than zero".to_string(),
                ));
            }
        }

        let last_rate = match &policy {
            DecayPolicy::OneCycle(cycle) => cycle.initial_lr(),
            _ => 0.0,
        };

        Ok(Self {
            base_rate,
            warmup_epochs,
            multiplier,
            policy,
            virtual_epoch: 0.0,
            policy_position: None,
            last_rate,
        })
    }

    /// Build from the run configuration
    ///
    /// `steps_per_epoch` sizes the one-cycle budget (`epochs * steps_per_epoch`).
    pub fn from_config(config: &TrainConfig, steps_per_epoch: usize) -> crate::Result<Self> {
        let ScheduleConfig {
            warmup_epochs,
            multiplier,
            policy,
        } = &config.schedule;

        let policy = match policy {
            DecayPolicyConfig::Exponential { gamma } => DecayPolicy::Exponential { gamma: *gamma },
            DecayPolicyConfig::MultiStep { milestones, gamma } => {
                let mut milestones = milestones.clone();
                milestones.sort_unstable();
                DecayPolicy::MultiStep {
                    milestones,
                    gamma: *gamma,
                }
            }
            DecayPolicyConfig::OneCycle {
                max_lr,
                pct_start,
                div_factor,
                final_div_factor,
            } => DecayPolicy::OneCycle(OneCycle {
                max_lr: max_lr.unwrap_or(config.lr),
                total_steps: config.epochs * steps_per_epoch,
                pct_start: *pct_start,
                div_factor: *div_factor,
                final_div_factor: *final_div_factor,
            }),
        };

        Self::new(config.lr, *warmup_epochs, *multiplier, policy)
    }

    pub fn unit(&self) -> ScheduleUnit {
        self.policy.unit()
    }

    fn peak_rate(&self) -> f64 {
        self.base_rate * self.multiplier
    }

    /// Advance to `virtual_epoch` and return the new learning rate
    ///
    /// For [`ScheduleUnit::Step`] policies the argument is ignored and the
    /// schedule advances by exactly one step. For epoch policies a position
    /// lower than the previous one is rejected; post-warmup calls that stay in
    /// the same integer epoch leave the rate unchanged.
    pub fn step(&mut self, virtual_epoch: f64) -> crate::Result<f64> {
        match self.policy.unit() {
            ScheduleUnit::Step => self.step_one_cycle(),
            ScheduleUnit::FractionalEpoch => self.step_epoch(virtual_epoch),
        }
    }

    fn step_one_cycle(&mut self) -> crate::Result<f64> {
        let DecayPolicy::OneCycle(cycle) = &self.policy else {
            return Err(TrainError::Schedule("step-unit policy is not one-cycle".to_string()));
        };

        let step = self.policy_position.unwrap_or(0);
        if step >= cycle.total_steps {
            return Err(TrainError::Schedule(format!(
                "one-cycle stepped past its budget of {} steps",
                cycle.total_steps
            )));
        }

        self.last_rate = cycle.lr_at(step);
        self.policy_position = Some(step + 1);
        Ok(self.last_rate)
    }

    fn step_epoch(&mut self, virtual_epoch: f64) -> crate::Result<f64> {
        if !virtual_epoch.is_finite() || virtual_epoch < self.virtual_epoch {
            return Err(TrainError::Schedule(format!(
                "virtual epoch went from {} to {}",
                self.virtual_epoch, virtual_epoch
            )));
        }
        self.virtual_epoch = virtual_epoch;

        if virtual_epoch < self.warmup_epochs {
            self.last_rate = self.peak_rate() * (virtual_epoch / self.warmup_epochs);
            return Ok(self.last_rate);
        }

        let position = (virtual_epoch - self.warmup_epochs).floor() as usize;
        if self.policy_position != Some(position) {
            self.last_rate = self.policy.advance(self.peak_rate(), position);
            self.policy_position = Some(position);
        }
        Ok(self.last_rate)
    }

    /// Most recently computed learning rate
    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    /// Rate of the decay policy alone at its current position
    ///
    /// During warmup this is the policy's epoch-0 rate.
    pub fn policy_rate(&self) -> f64 {
        match self.policy.unit() {
            ScheduleUnit::Step => self.last_rate,
            ScheduleUnit::FractionalEpoch => self
                .policy
                .advance(self.peak_rate(), self.policy_position.unwrap_or(0)),
        }
    }

    /// Rate the optimizer should start with before the first step
    pub fn initial_rate(&self) -> f64 {
        match &self.policy {
            DecayPolicy::OneCycle(cycle) => cycle.initial_lr(),
            _ => 0.0,
        }
    }

    pub fn virtual_epoch(&self) -> f64 {
        self.virtual_epoch
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState {
            virtual_epoch: self.virtual_epoch,
            policy_position: self.policy_position,
            last_rate: self.last_rate,
            base_rate: self.base_rate,
            warmup_epochs: self.warmup_epochs,
            multiplier: self.multiplier,
            policy: self.policy.clone(),
        }
    }

    /// Resume exactly where a saved schedule left off
    pub fn load_state(&mut self, state: ScheduleState) -> crate::Result<()> {
        if state.policy.unit() != self.policy.unit() {
            return Err(TrainError::CorruptCheckpoint(format!(
                "checkpoint schedule unit {:?} does not match configured {:?}",
                state.policy.unit(),
                self.policy.unit()
            )));
        }
        if state.policy != self.policy
            || state.base_rate != self.base_rate
            || state.warmup_epochs != self.warmup_epochs
            || state.multiplier != self.multiplier
        {
            log::warn!("Checkpoint schedule differs from configuration; resuming with the checkpoint's schedule");
        }

        self.base_rate = state.base_rate;
        self.warmup_epochs = state.warmup_epochs;
        self.multiplier = state.multiplier;
        self.policy = state.policy;
        self.virtual_epoch = state.virtual_epoch;
        self.policy_position = state.policy_position;
        self.last_rate = state.last_rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exp(gamma: f64) -> DecayPolicy {
        DecayPolicy::Exponential { gamma }
    }

    #[test]
    fn test_warmup_is_linear_on_fractional_epochs() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(1e-3, 2.0, 1.0, exp(0.5))?;

        for v in [0.0, 0.25, 0.5, 1.0, 1.5, 1.99] {
            let lr = sched.step(v)?;
            let expected = 1e-3 * 1.0 * (v / 2.0);
            assert!((lr - expected).abs() < 1e-15, "v={} lr={} expected={}", v, lr, expected);
            assert_eq!(sched.last_rate(), lr);
        }
        Ok(())
    }

    #[test]
    fn test_warmup_honours_multiplier() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(1.0, 1.0, 4.0, exp(0.5))?;
        assert!((sched.step(0.5)? - 2.0).abs() < 1e-12);
        assert!((sched.step(1.0)? - 4.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_handoff_at_end_of_warmup() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(0.1, 1.0, 1.0, exp(0.5))?;
        sched.step(0.999)?;
        // Policy epoch 0 is the undecayed peak
        assert!((sched.step(1.0)? - 0.1).abs() < 1e-15);
        assert!((sched.step(1.5)? - 0.1).abs() < 1e-15);
        assert!((sched.step(2.0)? - 0.05).abs() < 1e-15);
        assert!((sched.step(3.0)? - 0.025).abs() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_sub_epoch_calls_after_warmup_are_noops() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(1.0, 1.0, 1.0, exp(0.9))?;
        let at_two = sched.step(2.0)?;
        for frac in [2.1, 2.4, 2.9] {
            assert_eq!(sched.step(frac)?, at_two);
        }
        assert!(sched.step(3.0)? < at_two);
        Ok(())
    }

    #[test]
    fn test_policy_rate_during_warmup() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(2.0, 1.0, 1.0, exp(0.5))?;
        sched.step(0.5)?;
        assert_eq!(sched.last_rate(), 1.0);
        assert_eq!(sched.policy_rate(), 2.0);
        sched.step(2.0)?;
        assert_eq!(sched.policy_rate(), sched.last_rate());
        Ok(())
    }

    #[test]
    fn test_multi_step_policy() -> crate::Result<()> {
        let policy = DecayPolicy::MultiStep {
            milestones: vec![2, 4],
            gamma: 0.1,
        };
        let mut sched = ScheduleComposer::new(1.0, 1.0, 1.0, policy)?;

        // Policy epochs are virtual_epoch - warmup
        let expected = [(1.0, 1.0), (2.0, 1.0), (3.0, 0.1), (4.0, 0.1), (5.0, 0.01), (9.0, 0.01)];
        for (v, lr) in expected {
            assert!((sched.step(v)? - lr).abs() < 1e-12, "v={}", v);
        }
        Ok(())
    }

    #[test]
    fn test_virtual_epoch_must_not_go_backwards() -> crate::Result<()> {
        let mut sched = ScheduleComposer::new(1.0, 1.0, 1.0, exp(0.9))?;
        sched.step(0.5)?;
        assert!(matches!(sched.step(0.25), Err(TrainError::Schedule(_))));
        // Repeating the same position is allowed
        sched.step(0.5)?;
        Ok(())
    }

    fn canonical_one_cycle(max_lr: f64, total: usize, pct: f64, div: f64, final_div: f64) -> Vec<f64> {
        let initial = max_lr / div;
        let min = initial / final_div;
        let peak_step = pct * total as f64 - 1.0;
        let end_step = total as f64 - 1.0;
        let cos = |start: f64, end: f64, p: f64| end + (start - end) / 2.0 * ((PI * p).cos() + 1.0);
        (0..total)
            .map(|s| {
                let s = s as f64;
                if s <= peak_step {
                    cos(initial, max_lr, s / peak_step)
                } else {
                    cos(max_lr, min, (s - peak_step) / (end_step - peak_step))
                }
            })
            .collect()
    }

    #[test]
    fn test_one_cycle_ignores_warmup_and_follows_curve() -> crate::Result<()> {
        let cycle = OneCycle {
            max_lr: 0.01,
            total_steps: 100,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
        };
        // Warmup of 50 epochs would dominate if it were applied
        let mut sched = ScheduleComposer::new(1e-4, 50.0, 1.0, DecayPolicy::OneCycle(cycle))?;
        assert_eq!(sched.unit(), ScheduleUnit::Step);
        assert!((sched.initial_rate() - 0.01 / 25.0).abs() < 1e-15);

        let expected = canonical_one_cycle(0.01, 100, 0.3, 25.0, 1e4);
        for (i, want) in expected.iter().enumerate() {
            // The virtual epoch argument is irrelevant for step-unit policies
            let got = sched.step(0.0)?;
            assert!((got - want).abs() < 1e-12, "step {}: {} vs {}", i, got, want);
        }

        assert!((expected[0] - 0.0004).abs() < 1e-12);
        assert!((expected[29] - 0.01).abs() < 1e-12);
        assert!((expected[99] - 0.0004 / 1e4).abs() < 1e-12);
        let peak = expected.iter().cloned().fold(f64::MIN, f64::max);
        assert!((peak - 0.01).abs() < 1e-12);

        assert!(matches!(sched.step(0.0), Err(TrainError::Schedule(_))));
        Ok(())
    }

    #[test]
    fn test_state_round_trip_resumes_exactly() -> crate::Result<()> {
        let mut a = ScheduleComposer::new(1.0, 1.0, 1.0, exp(0.9))?;
        for v in [0.0, 0.5, 1.0, 2.0, 2.5] {
            a.step(v)?;
        }

        let json = serde_json::to_string(&a.state())?;
        let mut b = ScheduleComposer::new(1.0, 1.0, 1.0, exp(0.9))?;
        b.load_state(serde_json::from_str(&json)?)?;

        assert_eq!(b.state(), a.state());
        assert_eq!(b.last_rate(), a.last_rate());
        assert!(matches!(b.step(2.0), Err(TrainError::Schedule(_))));
        assert_eq!(a.step(3.0)?, b.step(3.0)?);
        Ok(())
    }

    #[test]
    fn test_load_state_rejects_unit_mismatch() -> crate::Result<()> {
        let cycle = ScheduleComposer::new(
            1.0,
            1.0,
            1.0,
            DecayPolicy::OneCycle(OneCycle {
                max_lr: 1.0,
                total_steps: 10,
                pct_start: 0.3,
                div_factor: 25.0,
                final_div_factor: 1e4,
            }),
        )?;
        let mut epochs = ScheduleComposer::new(1.0, 1.0, 1.0, exp(0.9))?;
        assert!(matches!(
            epochs.load_state(cycle.state()),
            Err(TrainError::CorruptCheckpoint(_))
        ));
        Ok(())
    }

    #[test]
    fn test_from_config_sizes_one_cycle_budget() -> crate::Result<()> {
        let mut config = TrainConfig::default();
        config.epochs = 3;
        config.schedule.policy = DecayPolicyConfig::OneCycle {
            max_lr: None,
            pct_start: 0.3,
            div_factor: 25.0,
            final_div_factor: 1e4,
        };
        let sched = ScheduleComposer::from_config(&config, 7)?;
        match sched.state().policy {
            DecayPolicy::OneCycle(cycle) => {
                assert_eq!(cycle.total_steps, 21);
                assert_eq!(cycle.max_lr, config.lr);
            }
            other => panic!("unexpected policy {:?}", other),
        }
        Ok(())
    }
}
