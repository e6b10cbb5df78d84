//! # Reverse diffusion schedulers
//!
//! The schedule tables are shared by every scheduler; the schedulers only
//! differ in how they walk the inference plan.
use std::{fs, str::FromStr};

use serde::{Deserialize, Serialize};
use tch::{kind, Kind, Tensor};

use self::{
    ddim::{DDIMScheduler, DDIMSchedulerConfig},
    ddim_dss::{DDIMDSSScheduler, DDIMDSSSchedulerConfig},
    types::Scheduler,
};
use crate::{
    error::{Result, SamplerError},
    noise::SeededNoise,
};

pub mod ddim;
pub mod ddim_dss;
pub mod plan;
pub mod types;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    #[default]
    ScaledLinear,
}

/// Per-timestep variance tables for the whole training horizon.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn new(
        train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaSchedule,
    ) -> Result<Self> {
        if train_timesteps == 0 {
            return Err(SamplerError::Configuration(
                "train_timesteps must be positive".to_string(),
            ));
        }
        let in_unit = |b: f64| b > 0.0 && b < 1.0;
        if !in_unit(beta_start) || !in_unit(beta_end) || beta_start >= beta_end {
            return Err(SamplerError::Configuration(format!(
                "beta bounds must satisfy 0 < start < end < 1, got {beta_start}..{beta_end}"
            )));
        }
        let betas = match beta_schedule {
            BetaSchedule::ScaledLinear => Tensor::linspace(
                beta_start.sqrt(),
                beta_end.sqrt(),
                train_timesteps as i64,
                kind::DOUBLE_CPU,
            )
            .square(),
            BetaSchedule::Linear => {
                Tensor::linspace(beta_start, beta_end, train_timesteps as i64, kind::DOUBLE_CPU)
            }
        };
        let alphas: Tensor = 1.0 - &betas;
        let alphas_cumprod = Vec::<f64>::try_from(alphas.cumprod(0, Kind::Double))?;
        let betas = Vec::<f64>::try_from(betas)?;
        let alphas = Vec::<f64>::try_from(alphas)?;

        if alphas_cumprod.iter().any(|&a| !(a > 0.0 && a <= 1.0)) {
            return Err(SamplerError::Configuration(
                "cumulative alphas underflowed outside of (0, 1]".to_string(),
            ));
        }
        if alphas_cumprod.windows(2).any(|w| w[1] >= w[0]) {
            return Err(SamplerError::Configuration(
                "cumulative alphas are not strictly decreasing".to_string(),
            ));
        }
        Ok(Self { betas, alphas, alphas_cumprod })
    }

    /// The linear-in-sqrt schedule Stable Diffusion 1.x was trained with.
    pub fn sd1x() -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear)
    }

    pub fn num_training_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> Result<f64> {
        self.alphas_cumprod.get(timestep).copied().ok_or_else(|| {
            SamplerError::Validation(format!(
                "timestep {timestep} is outside of the {} step training horizon",
                self.alphas_cumprod.len()
            ))
        })
    }

    /// Noises a clean latent forward to `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        if original.size() != noise.size() {
            return Err(SamplerError::Validation(format!(
                "noise shape {:?} does not match latent shape {:?}",
                noise.size(),
                original.size()
            )));
        }
        let alpha_prod = self.alpha_cumprod(timestep)?;
        Ok(alpha_prod.sqrt() * original + (1.0 - alpha_prod).sqrt() * noise)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheduler_name", content = "scheduler_args")]
pub enum SchedulerKind {
    #[serde(rename = "ddim")]
    DDIMScheduler(DDIMSchedulerConfig),
    #[serde(rename = "ddim_dss")]
    DDIMDSSScheduler(DDIMDSSSchedulerConfig),
}

impl SchedulerKind {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: SchedulerKind = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerKind::DDIMScheduler(_) => "ddim",
            SchedulerKind::DDIMDSSScheduler(_) => "ddim_dss",
        }
    }

    /// Builds the schedule this kind would use, without a scheduler around it.
    pub fn schedule(&self) -> Result<NoiseSchedule> {
        match self {
            SchedulerKind::DDIMScheduler(c) => {
                NoiseSchedule::new(c.train_timesteps, c.beta_start, c.beta_end, c.beta_schedule)
            }
            SchedulerKind::DDIMDSSScheduler(c) => {
                NoiseSchedule::new(c.train_timesteps, c.beta_start, c.beta_end, c.beta_schedule)
            }
        }
    }

    pub fn build(&self, seed: u64) -> Result<Box<dyn Scheduler>> {
        let noise = SeededNoise::new(seed);
        Ok(match self {
            SchedulerKind::DDIMScheduler(config) => {
                Box::new(DDIMScheduler::new(config.clone(), noise)?)
            }
            SchedulerKind::DDIMDSSScheduler(config) => {
                Box::new(DDIMDSSScheduler::new(config.clone(), noise)?)
            }
        })
    }
}

impl FromStr for SchedulerKind {
    type Err = SamplerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ddim" => Ok(SchedulerKind::DDIMScheduler(DDIMSchedulerConfig::default())),
            "ddim_dss" | "ddim-dss" | "dss" => {
                Ok(SchedulerKind::DDIMDSSScheduler(DDIMDSSSchedulerConfig::default()))
            }
            other => Err(SamplerError::Validation(format!("unknown scheduler {other:?}"))),
        }
    }
}
