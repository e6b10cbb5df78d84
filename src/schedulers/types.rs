use tch::Tensor;

use crate::error::Result;

/// What one reverse step hands back to the denoising loop.
#[derive(Debug)]
pub struct StepOutput {
    pub latents: Tensor,
    /// Timestep to predict noise at next, `None` once the plan is exhausted.
    pub next_timestep: Option<usize>,
    /// Plan entries consumed by this step, always at least 1.
    pub skip_count: usize,
}

pub trait Scheduler {
    fn timesteps(&self) -> &[usize];
    fn set_inference_timesteps(&mut self, num_inference_steps: usize) -> Result<()>;
    fn set_strength(&mut self, strength: f64) -> Result<()>;
    fn init_noise_sigma(&self) -> f64 {
        1.0
    }
    fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor>;
    fn advance(
        &mut self,
        timestep: usize,
        latents: &Tensor,
        model_output: &Tensor,
        prev_latents: Option<&Tensor>,
    ) -> Result<StepOutput>;
}
