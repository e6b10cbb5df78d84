//! Reverse-diffusion latent samplers: fixed-schedule DDIM and DDIM with
//! dynamic step skipping, plus the loop that drives them.
pub mod aiy_sd;
pub mod error;
pub mod noise;
pub mod schedulers;
pub mod utils;

pub use error::{Result, SamplerError};
