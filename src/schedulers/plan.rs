//! The descending subsequence of training timesteps visited at inference.
use crate::error::{Result, SamplerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestepPlan {
    train_timesteps: usize,
    num_inference_steps: usize,
    step_ratio: usize,
    start_step: usize,
    timesteps: Vec<usize>,
}

impl TimestepPlan {
    /// Evenly spaced plan `[(n-1)*r, ..., r, 0]` with `r = train_timesteps / n`.
    pub fn new(train_timesteps: usize, num_inference_steps: usize) -> Result<Self> {
        if num_inference_steps == 0 {
            return Err(SamplerError::Configuration(
                "num_inference_steps must be positive".to_string(),
            ));
        }
        if num_inference_steps > train_timesteps {
            return Err(SamplerError::Configuration(format!(
                "cannot plan {num_inference_steps} steps over {train_timesteps} training steps"
            )));
        }
        let step_ratio = train_timesteps / num_inference_steps;
        let timesteps = Self::spaced(num_inference_steps, step_ratio);
        Ok(Self { train_timesteps, num_inference_steps, step_ratio, start_step: 0, timesteps })
    }

    fn spaced(len: usize, step_ratio: usize) -> Vec<usize> {
        (0..len).rev().map(|i| i * step_ratio).collect()
    }

    /// Drops the head of the full plan so that only `strength` of the
    /// trajectory is run. Always truncates the untouched `n`-step plan, and
    /// leaves `self` unchanged when `strength` is rejected.
    pub fn set_strength(&mut self, strength: f64) -> Result<()> {
        if !(strength > 0.0 && strength <= 1.0) {
            return Err(SamplerError::Validation(format!(
                "strength must be in (0, 1], got {strength}"
            )));
        }
        let n = self.num_inference_steps;
        let start_step = ((n as f64 * (1.0 - strength)).floor() as usize).min(n - 1);
        self.timesteps = Self::spaced(n - start_step, self.step_ratio);
        self.start_step = start_step;
        Ok(())
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    pub fn step_ratio(&self) -> usize {
        self.step_ratio
    }

    /// Number of leading entries dropped by the last `set_strength`.
    pub fn start_step(&self) -> usize {
        self.start_step
    }

    pub fn num_inference_steps(&self) -> usize {
        self.num_inference_steps
    }

    pub fn train_timesteps(&self) -> usize {
        self.train_timesteps
    }
}
