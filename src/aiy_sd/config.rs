use std::fs;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    #[default]
    TextToImage,
    ImageToImage,
    InPainting,
}

/// Knobs of a single generation run that the scheduler and the guidance step consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub strength: f64,
    pub cfg_scale: f64,
    pub inference_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl GenerationMode {
    pub fn defaults(&self) -> GenerationParams {
        let (strength, cfg_scale, inference_steps) = match self {
            GenerationMode::TextToImage => (0.9, 8.0, 50),
            GenerationMode::ImageToImage => (0.4, 9.0, 100),
            GenerationMode::InPainting => (0.5, 7.0, 75),
        };
        GenerationParams { strength, cfg_scale, inference_steps, seed: DEFAULT_SEED }
    }

    /// Whether the run starts from an encoded image rather than pure noise.
    pub fn uses_input_image(&self) -> bool {
        !matches!(self, GenerationMode::TextToImage)
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        GenerationMode::default().defaults()
    }
}

impl GenerationParams {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: GenerationParams = toml::from_str(&file)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::{GenerationMode, GenerationParams, DEFAULT_SEED};

    #[test]
    fn test_mode_defaults() {
        let p = GenerationMode::ImageToImage.defaults();
        assert_eq!((p.strength, p.cfg_scale, p.inference_steps), (0.4, 9.0, 100));
        assert_eq!(GenerationParams::default().inference_steps, 50);
        assert!(!GenerationMode::TextToImage.uses_input_image());
        assert!(GenerationMode::InPainting.uses_input_image());
    }

    #[test]
    fn test_params_from_toml() {
        let p: GenerationParams =
            toml::from_str("strength = 0.75\ncfg_scale = 7.5\ninference_steps = 30\n").unwrap();
        assert_eq!(p.seed, DEFAULT_SEED);
        assert_eq!(p.inference_steps, 30);
    }
}
