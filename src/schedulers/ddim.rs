//! # Denoising Diffusion Implicit Models
//!
//! The Denoising Diffusion Implicit Models (DDIM) scheduler walks the
//! inference plan one entry at a time. With `eta = 0` the trajectory is a
//! deterministic ODE solve; `eta > 0` mixes fresh gaussian noise back in.
//!
//! Denoising Diffusion Implicit Models, J. Song et al, 2020.
//! https://arxiv.org/abs/2010.02502
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tch::Tensor;
use tracing::debug;

use super::{
    plan::TimestepPlan,
    types::{Scheduler, StepOutput},
    BetaSchedule, NoiseSchedule,
};
use crate::{
    error::{Result, SamplerError},
    noise::{NoiseSource, SeededNoise},
};

/// Plan length a freshly built scheduler starts with.
pub const DEFAULT_INFERENCE_STEPS: usize = 50;

/// The configuration for the DDIM scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DDIMSchedulerConfig {
    /// The value of beta at the beginning of training.
    pub beta_start: f64,
    /// The value of beta at the end of training.
    pub beta_end: f64,
    /// How beta evolved during training.
    pub beta_schedule: BetaSchedule,
    /// The amount of noise to be added at each step.
    pub eta: f64,
    /// number of diffusion steps used to train the model
    pub train_timesteps: usize,
}

impl Default for DDIMSchedulerConfig {
    fn default() -> Self {
        Self {
            beta_start: 0.00085f64,
            beta_end: 0.012f64,
            beta_schedule: BetaSchedule::ScaledLinear,
            eta: 0.,
            train_timesteps: 1000,
        }
    }
}

pub(crate) fn check_eta(eta: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&eta) {
        return Err(SamplerError::Configuration(format!("eta must be in [0, 1], got {eta}")));
    }
    Ok(())
}

/// Scalar factors of one DDIM update between two noise levels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DDIMCoefficients {
    sqrt_alpha_t: f64,
    sqrt_beta_t: f64,
    sqrt_alpha_prev: f64,
    direction: f64,
    sigma: f64,
}

impl DDIMCoefficients {
    pub(crate) fn new(alpha_t: f64, alpha_prev: f64, eta: f64, timestep: usize) -> Result<Self> {
        let beta_t = 1. - alpha_t;
        if !(alpha_t > 0.) {
            return Err(SamplerError::anomaly(
                timestep,
                format!("alpha_t = {alpha_t} is not positive"),
            ));
        }
        if !(beta_t > 0.) {
            return Err(SamplerError::anomaly(
                timestep,
                format!("1 - alpha_t = {beta_t} is not positive"),
            ));
        }
        if !(alpha_prev > 0.) {
            return Err(SamplerError::anomaly(
                timestep,
                format!("alpha_prev = {alpha_prev} is not positive"),
            ));
        }
        let variance = (1. - alpha_prev) / beta_t * (1. - alpha_t / alpha_prev);
        if !(variance >= 0.) {
            return Err(SamplerError::anomaly(
                timestep,
                format!(
                    "negative variance {variance} (alpha_t = {alpha_t}, alpha_prev = {alpha_prev})"
                ),
            ));
        }
        let sigma = eta * variance.sqrt();
        let direction = (1. - alpha_prev - sigma * sigma).max(0.).sqrt();
        Ok(Self {
            sqrt_alpha_t: alpha_t.sqrt(),
            sqrt_beta_t: beta_t.sqrt(),
            sqrt_alpha_prev: alpha_prev.sqrt(),
            direction,
            sigma,
        })
    }
}

/// One reverse DDIM update from `timestep` to `timestep - step_ratio`.
///
/// Noise is only drawn when both `timestep > 0` and `eta > 0`; otherwise the
/// generator is left untouched.
pub(crate) fn ddim_step<N: NoiseSource + ?Sized>(
    schedule: &NoiseSchedule,
    step_ratio: usize,
    eta: f64,
    noise: &mut N,
    timestep: usize,
    latents: &Tensor,
    model_output: &Tensor,
) -> Result<Tensor> {
    if latents.size() != model_output.size() {
        return Err(SamplerError::Validation(format!(
            "model output shape {:?} does not match latent shape {:?}",
            model_output.size(),
            latents.size()
        )));
    }
    let alpha_t = schedule.alpha_cumprod(timestep)?;
    // Past the start of the schedule the target is the clean distribution.
    let alpha_prev = match timestep.checked_sub(step_ratio) {
        Some(prev_timestep) => schedule.alpha_cumprod(prev_timestep)?,
        None => 1.0,
    };
    let c = DDIMCoefficients::new(alpha_t, alpha_prev, eta, timestep)?;

    let pred_original_sample = (latents - c.sqrt_beta_t * model_output) / c.sqrt_alpha_t;
    let pred_sample_direction = c.direction * model_output;
    let prev_sample = c.sqrt_alpha_prev * pred_original_sample + pred_sample_direction;
    if timestep > 0 && eta > 0. {
        let variance_noise =
            noise.next_normal_tensor(&latents.size(), (latents.kind(), latents.device()));
        Ok(prev_sample + c.sigma * variance_noise)
    } else {
        Ok(prev_sample)
    }
}

/// The DDIM scheduler.
#[derive(Debug)]
pub struct DDIMScheduler<N = SeededNoise> {
    schedule: Arc<NoiseSchedule>,
    plan: TimestepPlan,
    eta: f64,
    noise: N,
}

impl<N: NoiseSource> DDIMScheduler<N> {
    /// Creates a new DDIM scheduler planned for `DEFAULT_INFERENCE_STEPS`
    /// steps; call `set_inference_timesteps` to change the plan.
    pub fn new(config: DDIMSchedulerConfig, noise: N) -> Result<Self> {
        let schedule = NoiseSchedule::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
        )?;
        Self::with_schedule(Arc::new(schedule), config.eta, noise)
    }

    /// Builds a scheduler over a schedule shared with other runs.
    pub fn with_schedule(schedule: Arc<NoiseSchedule>, eta: f64, noise: N) -> Result<Self> {
        check_eta(eta)?;
        let steps = DEFAULT_INFERENCE_STEPS.min(schedule.num_training_steps());
        let plan = TimestepPlan::new(schedule.num_training_steps(), steps)?;
        Ok(Self { schedule, plan, eta, noise })
    }

    pub fn timesteps(&self) -> &[usize] {
        self.plan.timesteps()
    }

    pub fn plan(&self) -> &TimestepPlan {
        &self.plan
    }

    pub fn schedule(&self) -> &Arc<NoiseSchedule> {
        &self.schedule
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn set_inference_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        self.plan = TimestepPlan::new(self.schedule.num_training_steps(), num_inference_steps)?;
        debug!(num_inference_steps, step_ratio = self.plan.step_ratio(), "ddim plan set");
        Ok(())
    }

    pub fn set_strength(&mut self, strength: f64) -> Result<()> {
        self.plan.set_strength(strength)?;
        debug!(strength, start_step = self.plan.start_step(), "ddim plan truncated");
        Ok(())
    }

    /// Performs a backward step during inference.
    pub fn step(
        &mut self,
        timestep: usize,
        latents: &Tensor,
        model_output: &Tensor,
    ) -> Result<Tensor> {
        ddim_step(
            &self.schedule,
            self.plan.step_ratio(),
            self.eta,
            &mut self.noise,
            timestep,
            latents,
            model_output,
        )
    }
}

impl<N: NoiseSource> Scheduler for DDIMScheduler<N> {
    fn timesteps(&self) -> &[usize] {
        DDIMScheduler::timesteps(self)
    }

    fn set_inference_timesteps(&mut self, num_inference_steps: usize) -> Result<()> {
        DDIMScheduler::set_inference_timesteps(self, num_inference_steps)
    }

    fn set_strength(&mut self, strength: f64) -> Result<()> {
        DDIMScheduler::set_strength(self, strength)
    }

    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        self.schedule.add_noise(original, noise, timestep)
    }

    fn advance(
        &mut self,
        timestep: usize,
        latents: &Tensor,
        model_output: &Tensor,
        _prev_latents: Option<&Tensor>,
    ) -> Result<StepOutput> {
        let latents = self.step(timestep, latents, model_output)?;
        // The plan descends by exactly `step_ratio` and always ends at 0.
        let next_timestep = timestep.checked_sub(self.plan.step_ratio());
        Ok(StepOutput { latents, next_timestep, skip_count: 1 })
    }
}
