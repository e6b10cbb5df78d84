//! Driving loop around a [`Scheduler`]: one noise prediction per visited
//! timestep, progress reported after every step.
use std::time::{Duration, Instant};

use anyhow::Context;
use tch::Tensor;
use tracing::{debug, info};

use crate::{error::SamplerError, schedulers::types::Scheduler, utils::{count_nan, has_nan}};

pub mod config;

/// Snapshot handed to the progress callback after each step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Noise predictions made so far.
    pub predictions: usize,
    /// Plan entries consumed so far, counting skipped ones.
    pub position: usize,
    /// Length of the plan.
    pub total: usize,
    /// Timestep that was just denoised.
    pub timestep: usize,
    pub elapsed: Duration,
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`.
pub fn apply_guidance(
    noise_pred_uncond: &Tensor,
    noise_pred_text: &Tensor,
    guidance_scale: f64,
) -> Tensor {
    noise_pred_uncond + (noise_pred_text - noise_pred_uncond) * guidance_scale
}

/// Runs `scheduler` over its whole plan starting from `latents`.
///
/// `predict_noise(latents, timestep)` stands in for the conditioned denoising
/// model. Any error it returns, or a scheduler failure, aborts the run.
pub fn denoise<S, P, C>(
    scheduler: &mut S,
    latents: Tensor,
    mut predict_noise: P,
    mut on_progress: C,
) -> anyhow::Result<Tensor>
where
    S: Scheduler + ?Sized,
    P: FnMut(&Tensor, usize) -> anyhow::Result<Tensor>,
    C: FnMut(&Progress),
{
    let total = scheduler.timesteps().len();
    let Some(&first) = scheduler.timesteps().first() else {
        return Ok(latents);
    };
    info!(total, first_timestep = first, "denoising");
    let start = Instant::now();
    let mut latents = latents;
    let mut timestep = first;
    let mut predictions = 0;
    let mut position = 0;
    loop {
        let noise_pred = predict_noise(&latents, timestep)
            .with_context(|| format!("noise prediction failed at timestep {timestep}"))?;
        if has_nan(&noise_pred) {
            let reason = format!("noise prediction contains {} NaN values", count_nan(&noise_pred));
            return Err(SamplerError::anomaly(timestep, reason).into());
        }
        let prev_latents = (predictions > 0).then_some(&latents);
        let out = scheduler
            .advance(timestep, &latents, &noise_pred, prev_latents)
            .with_context(|| format!("scheduler step failed at timestep {timestep}"))?;
        predictions += 1;
        position += out.skip_count;
        latents = out.latents;
        let elapsed = start.elapsed();
        let progress = Progress { predictions, position, total, timestep, elapsed };
        debug!(?progress, "step done");
        on_progress(&progress);
        match out.next_timestep {
            Some(next) => timestep = next,
            None => break,
        }
    }
    info!(predictions, total, elapsed = ?start.elapsed(), "denoising finished");
    Ok(latents)
}
