//! # DDIM with dynamic step skipping
//!
//! Same update rule as [`super::ddim`], but when consecutive latents barely
//! change the scheduler jumps several plan entries ahead, saving noise
//! predictions. The plan cursor is the single source of truth for where the
//! run stands; the next timestep is always read from the plan at the cursor.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};
use tracing::{debug, warn};

use super::{
    ddim::{check_eta, ddim_step, DEFAULT_INFERENCE_STEPS},
    plan::TimestepPlan,
    types::{Scheduler, StepOutput},
    BetaSchedule, NoiseSchedule,
};
use crate::{
    error::{Result, SamplerError},
    noise::{NoiseSource, SeededNoise},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DDIMDSSSchedulerConfig {
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub eta: f64,
    pub train_timesteps: usize,
    /// Relative L2 change below which plan entries get skipped.
    pub skip_threshold: f64,
    /// Upper bound on plan entries consumed by a single step.
    pub max_skip_steps: usize,
    /// Trailing plan entries that are always visited one by one.
    pub min_steps: usize,
}

impl Default for DDIMDSSSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            eta: 0.,
            train_timesteps: 1000,
            skip_threshold: 0.01,
            max_skip_steps: 2,
            min_steps: 5,
        }
    }
}

/// When and how far the scheduler may jump ahead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipPolicy {
    pub skip_threshold: f64,
    pub max_skip_steps: usize,
    pub min_steps: usize,
}

impl SkipPolicy {
    fn validate(&self) -> Result<()> {
        if !(self.skip_threshold >= 0. && self.skip_threshold.is_finite()) {
            return Err(SamplerError::Configuration(format!(
                "skip_threshold must be finite and non-negative, got {}",
                self.skip_threshold
            )));
        }
        if self.max_skip_steps == 0 {
            return Err(SamplerError::Configuration(
                "max_skip_steps must be at least 1".to_string(),
            ));
        }
        if self.min_steps == 0 {
            return Err(SamplerError::Configuration("min_steps must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl From<&DDIMDSSSchedulerConfig> for SkipPolicy {
    fn from(config: &DDIMDSSSchedulerConfig) -> Self {
        Self {
            skip_threshold: config.skip_threshold,
            max_skip_steps: config.max_skip_steps,
            min_steps: config.min_steps,
        }
    }
}

/// `‖a − b‖₂ / ‖a‖₂`, or `None` when `a` is all zeros.
fn relative_change(latents: &Tensor, prev_latents: &Tensor) -> Option<f64> {
    let denom = latents.to_kind(Kind::Double).norm().double_value(&[]);
    if denom == 0. {
        return None;
    }
    let diff = (latents - prev_latents).to_kind(Kind::Double).norm().double_value(&[]);
    Some(diff / denom)
}

#[derive(Debug)]
pub struct DDIMDSSScheduler<N = SeededNoise> {
    schedule: Arc<NoiseSchedule>,
    plan: TimestepPlan,
    eta: f64,
    policy: SkipPolicy,
    current_step_index: usize,
    noise: N,
}

impl<N: NoiseSource> DDIMDSSScheduler<N> {
    pub fn new(config: DDIMDSSSchedulerConfig, noise: N) -> Result<Self> {
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        Self::with_schedule(Arc::new(schedule), config.eta, SkipPolicy::from(&config), noise)
    }

    pub fn with_schedule(
        schedule: Arc<NoiseSchedule>,
        eta: f64,
        policy: SkipPolicy,
        noise: N,
    ) -> Result<Self> {
        check_eta(eta)?;
        policy.validate()?;
        let steps = DEFAULT_INFERENCE_STEPS.min(schedule.num_training_steps());
        let plan = TimestepPlan::new(schedule.num_training_steps(), steps)?;
        Ok(Self { schedule, plan, eta, policy, current_step_index: 0, noise })
    }

    pub fn timesteps(&self) -> &[usize] {
        self.plan.timesteps()
    }

    pub fn plan(&self) -> &TimestepPlan {
        &self.plan
    }

    pub fn policy(&self) -> &SkipPolicy {
        &self.policy
    }

    pub fn schedule(&self) -> &Arc<NoiseSchedule> {
        &self.schedule
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    /// Timestep at the cursor, `None` once the plan is exhausted.
    pub fn current_timestep(&self) -> Option<usize> {
        self.plan.timesteps().get(self.current_step_index).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.current_step_index >= self.plan.len()
    }

    pub fn set_inference_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.plan = TimestepPlan::new(self.schedule.num_training_steps(), num_inference_steps)?;
        self.current_step_index = 0;
        debug!(num_inference_steps, step_ratio = self.plan.step_ratio(), "ddim-dss plan set");
        Ok(())
    }

    pub fn set_strength(&mut self, strength: f64) -> Result<()> {
        self.plan.set_strength(strength)?;
        self.current_step_index = 0;
        debug!(strength, start_step = self.plan.start_step(), "ddim-dss plan truncated");
        Ok(())
    }

    /// Number of plan entries the step at the cursor consumes.
    fn skip_count(&self, latents: &Tensor, prev_latents: Option<&Tensor>) -> usize {
        let len = self.plan.len();
        let idx = self.current_step_index;
        let SkipPolicy { skip_threshold, max_skip_steps, min_steps } = self.policy;
        let prev_latents = match prev_latents {
            Some(prev) if idx < len.saturating_sub(min_steps) => prev,
            _ => return 1,
        };
        match relative_change(latents, prev_latents) {
            Some(l2) if l2 < skip_threshold => {
                let skip_count = max_skip_steps.min(len - idx - min_steps);
                debug!(step_index = idx, l2, skip_count, "converging, skipping ahead");
                skip_count
            }
            l2 => {
                debug!(step_index = idx, ?l2, "single step");
                1
            }
        }
    }

    /// Performs a backward step, then moves the cursor by the returned skip count.
    ///
    /// `prev_latents` is the latent the previous call returned; without it no
    /// skip is attempted.
    pub fn step(
        &mut self,
        timestep: usize,
        latents: &Tensor,
        model_output: &Tensor,
        prev_latents: Option<&Tensor>,
    ) -> Result<StepOutput> {
        if self.is_finished() {
            return Err(SamplerError::Validation(format!(
                "plan of {} steps is already exhausted",
                self.plan.len()
            )));
        }
        // Rejected before any noise is drawn so a failed call leaves the run intact.
        if let Some(prev) = prev_latents {
            if prev.size() != latents.size() {
                return Err(SamplerError::Validation(format!(
                    "previous latent shape {:?} does not match latent shape {:?}",
                    prev.size(),
                    latents.size()
                )));
            }
        }
        if self.current_timestep() != Some(timestep) {
            warn!(timestep, expected = ?self.current_timestep(), "timestep is off the plan cursor");
        }
        let prev_sample = ddim_step(
            &self.schedule,
            self.plan.step_ratio(),
            self.eta,
            &mut self.noise,
            timestep,
            latents,
            model_output,
        )?;
        let skip_count = self.skip_count(&prev_sample, prev_latents);
        self.current_step_index += skip_count;
        Ok(StepOutput {
            latents: prev_sample,
            next_timestep: self.current_timestep(),
            skip_count,
        })
    }
}

impl<N: NoiseSource> Scheduler for DDIMDSSScheduler<N> {
    fn timesteps(&self) -> &[usize] {
        DDIMDSSScheduler::timesteps(self)
    }

    fn set_inference_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        DDIMDSSScheduler::set_inference_timesteps(self, num_inference_steps)
    }

    fn set_strength(&mut self, strength: f64) -> Result<()> {
        DDIMDSSScheduler::set_strength(self, strength)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        self.schedule.add_noise(original, noise, timestep)
    }

    fn advance(
        &mut self,
        timestep: usize,
        latents: &Tensor,
        model_output: &Tensor,
        prev_latents: Option<&Tensor>,
    ) -> Result<StepOutput> {
        self.step(timestep, latents, model_output, prev_latents)
    }
}

#[cfg(test)]
mod tests {
    use super::{DDIMDSSScheduler, DDIMDSSSchedulerConfig};
    use crate::{
        error::SamplerError,
        noise::{NoiseSource, SeededNoise},
        schedulers::ddim::{tests::CountingNoise, DDIMScheduler, DDIMSchedulerConfig},
    };
    use tch::{kind, Tensor};

    fn latents(seed: u64) -> Tensor {
        SeededNoise::new(seed).next_normal_tensor(&[1, 4, 8, 8], kind::DOUBLE_CPU)
    }

    fn dss(config: DDIMDSSSchedulerConfig) -> DDIMDSSScheduler<CountingNoise> {
        DDIMDSSScheduler::new(config, CountingNoise::new(42)).unwrap()
    }

    /// A predictor whose estimate makes the sampler stay exactly in place.
    fn stationary_eps(s: &DDIMDSSScheduler<CountingNoise>, t: usize, x: &Tensor) -> Tensor {
        // With eta = 0, x_prev == x iff eps solves the DDIM update for a fixed point.
        let ac = s.schedule().alphas_cumprod();
        let a_t = ac[t];
        let a_p = t.checked_sub(s.plan().step_ratio()).map_or(1.0, |p| ac[p]);
        let k = ((1. - a_p).sqrt() - (a_p / a_t).sqrt() * (1. - a_t).sqrt())
            / (1. - (a_p / a_t).sqrt());
        x / k
    }

    #[test]
    fn test_zero_threshold_matches_ddim() {
        for eta in [0., 0.7] {
            let mut ddim = DDIMScheduler::new(
                DDIMSchedulerConfig { eta, ..Default::default() },
                SeededNoise::new(9),
            )
            .unwrap();
            let mut dss = DDIMDSSScheduler::new(
                DDIMDSSSchedulerConfig { eta, skip_threshold: 0., ..Default::default() },
                SeededNoise::new(9),
            )
            .unwrap();
            ddim.set_inference_timesteps(10).unwrap();
            dss.set_inference_timesteps(10).unwrap();

            let mut x_ddim = latents(1);
            let mut x_dss = latents(1);
            for (i, &t) in ddim.timesteps().to_vec().iter().enumerate() {
                let eps = latents(100 + i as u64);
                x_ddim = ddim.step(t, &x_ddim, &eps).unwrap();
                let out = dss.step(t, &x_dss, &eps, (i > 0).then_some(&x_dss)).unwrap();
                assert_eq!(out.skip_count, 1);
                x_dss = out.latents;
                assert!(x_ddim.equal(&x_dss), "diverged at timestep {t}");
            }
            assert!(dss.is_finished());
        }
    }

    #[test]
    fn test_no_skip_without_previous_latent() {
        let mut s = dss(DDIMDSSSchedulerConfig { skip_threshold: f64::MAX, ..Default::default() });
        let out = s.step(980, &latents(1), &latents(2), None).unwrap();
        assert_eq!(out.skip_count, 1);
        assert_eq!(out.next_timestep, Some(960));
        assert_eq!(s.current_step_index(), 1);
    }

    #[test]
    fn test_skips_when_converged() {
        let mut s = dss(DDIMDSSSchedulerConfig::default());
        let x = latents(1);
        let eps = stationary_eps(&s, 980, &x);
        let out = s.step(980, &x, &eps, Some(&x)).unwrap();
        assert_eq!(out.skip_count, 2);
        assert_eq!(out.next_timestep, Some(940));
        assert_eq!(s.current_step_index(), 2);
    }

    #[test]
    fn test_large_change_takes_single_step() {
        let mut s = dss(DDIMDSSSchedulerConfig::default());
        let prev = latents(7) * 10.;
        let out = s.step(980, &latents(1), &latents(2), Some(&prev)).unwrap();
        assert_eq!(out.skip_count, 1);
        assert_eq!(out.next_timestep, Some(960));
    }

    #[test]
    fn test_skip_count_bounds_and_tail() {
        // Always "converged": every eligible step skips as far as allowed.
        let config = DDIMDSSSchedulerConfig {
            skip_threshold: f64::MAX,
            max_skip_steps: 3,
            min_steps: 4,
            ..Default::default()
        };
        let mut s = dss(config);
        s.set_inference_timesteps(20).unwrap();
        let len = s.timesteps().len();
        let mut x = latents(1);
        let mut t = s.timesteps()[0];
        let mut visited = vec![t];
        loop {
            let idx = s.current_step_index();
            let out = s.step(t, &x, &latents(2), (visited.len() > 1).then_some(&x)).unwrap();
            assert!((1..=3).contains(&out.skip_count));
            if idx >= len - 4 {
                assert_eq!(out.skip_count, 1, "tail entries are visited one by one");
            }
            assert!(s.current_step_index() <= len);
            x = out.latents;
            match out.next_timestep {
                Some(next) => {
                    t = next;
                    visited.push(t);
                }
                None => break,
            }
        }
        // First step has no previous latent, then jumps of 3 visit 1, 4, ..., 13 and 16..19 singly.
        let tail: Vec<usize> = s.timesteps()[len - 4..].to_vec();
        assert_eq!(visited[visited.len() - 4..], tail[..]);
        assert_eq!(visited.len(), 6 + 4);
        assert!(s.is_finished());
        assert_eq!(s.current_timestep(), None);
    }

    #[test]
    fn test_skip_clamped_before_tail() {
        let config = DDIMDSSSchedulerConfig {
            skip_threshold: f64::MAX,
            max_skip_steps: 10,
            min_steps: 3,
            ..Default::default()
        };
        let mut s = dss(config);
        s.set_inference_timesteps(8).unwrap();
        let x = latents(1);
        let out = s.step(s.timesteps()[0], &x, &latents(2), Some(&x)).unwrap();
        // min(10, 8 - 0 - 3)
        assert_eq!(out.skip_count, 5);
        assert_eq!(s.current_step_index(), 5);
        assert_eq!(out.next_timestep, Some(s.timesteps()[5]));
    }

    #[test]
    fn test_short_plan_never_skips() {
        let config = DDIMDSSSchedulerConfig { skip_threshold: f64::MAX, ..Default::default() };
        let mut s = dss(config);
        s.set_inference_timesteps(4).unwrap();
        let x = latents(1);
        let out = s.step(s.timesteps()[0], &x, &latents(2), Some(&x)).unwrap();
        assert_eq!(out.skip_count, 1);
    }

    #[test]
    fn test_strength_resets_cursor() {
        let mut s = dss(DDIMDSSSchedulerConfig::default());
        s.step(980, &latents(1), &latents(2), None).unwrap();
        assert_eq!(s.current_step_index(), 1);
        s.set_strength(0.5).unwrap();
        assert_eq!(s.current_step_index(), 0);
        assert_eq!(s.current_timestep(), Some(480));
        assert!(s.set_strength(0.).is_err());
        assert_eq!(s.timesteps().len(), 25);
    }

    #[test]
    fn test_step_after_finish_is_rejected() {
        let mut s = dss(DDIMDSSSchedulerConfig::default());
        s.set_inference_timesteps(1).unwrap();
        let out = s.step(0, &latents(1), &latents(2), None).unwrap();
        assert_eq!(out.next_timestep, None);
        let err = s.step(0, &out.latents, &latents(2), None).unwrap_err();
        assert!(matches!(err, SamplerError::Validation(_)));
    }

    #[test]
    fn test_mismatched_previous_latent_leaves_state_untouched() {
        let mut s = dss(DDIMDSSSchedulerConfig { eta: 0.5, ..Default::default() });
        let prev = Tensor::zeros([1, 4, 4, 4], kind::DOUBLE_CPU);
        let err = s.step(980, &latents(1), &latents(2), Some(&prev)).unwrap_err();
        assert!(matches!(err, SamplerError::Validation(_)));
        assert_eq!(s.noise.draws, 0);
        assert_eq!(s.current_step_index(), 0);

        // Also rejected in the tail, where no skip could happen anyway.
        s.set_inference_timesteps(3).unwrap();
        let err = s.step(666, &latents(1), &latents(2), Some(&prev)).unwrap_err();
        assert!(matches!(err, SamplerError::Validation(_)));
        assert_eq!(s.noise.draws, 0);
    }

    #[test]
    fn test_cursor_wins_over_off_plan_timestep() {
        let mut s = dss(DDIMDSSSchedulerConfig::default());
        s.set_inference_timesteps(10).unwrap();
        assert_eq!(s.timesteps()[..3], [900, 800, 700]);
        // 950 is not on the plan; the next timestep still comes from the cursor.
        let out = s.step(950, &latents(1), &latents(2), None).unwrap();
        assert_eq!(out.skip_count, 1);
        assert_eq!(out.next_timestep, Some(800));
        assert_eq!(s.current_step_index(), 1);
    }

    #[test]
    fn test_invalid_policy() {
        for config in [
            DDIMDSSSchedulerConfig { min_steps: 0, ..Default::default() },
            DDIMDSSSchedulerConfig { max_skip_steps: 0, ..Default::default() },
            DDIMDSSSchedulerConfig { skip_threshold: -1., ..Default::default() },
        ] {
            let err = DDIMDSSScheduler::new(config, SeededNoise::new(0)).unwrap_err();
            assert!(matches!(err, SamplerError::Configuration(_)));
        }
    }
}
