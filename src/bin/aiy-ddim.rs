use aiy_ddim::{
    aiy_sd::{
        apply_guidance,
        config::{GenerationMode, GenerationParams},
        denoise,
    },
    noise::{NoiseSource, SeededNoise},
    schedulers::SchedulerKind,
    utils::get_device,
};
use anyhow::Context;
use clap::Parser;
use tch::{Device, Kind, Tensor};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scheduler to run, `ddim` or `ddim_dss`. Ignored when `--config` is given.
    #[arg(long, default_value = "ddim_dss")]
    sampler: String,

    /// TOML scheduler config, see src/schedulers/config.*.default.toml.
    #[arg(long)]
    config: Option<String>,

    /// TOML generation parameters (strength, cfg_scale, inference_steps, seed).
    #[arg(long)]
    params: Option<String>,

    /// Start from a synthetic encoded image instead of pure noise.
    #[arg(long)]
    image_to_image: bool,

    #[arg(long)]
    n_steps: Option<usize>,

    #[arg(long)]
    strength: Option<f64>,

    #[arg(long)]
    cfg_scale: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    eta: Option<f64>,

    /// Latent side length; latents are [1, 4, size, size].
    #[arg(long, default_value = "64")]
    latent_size: i64,

    /// Run on the CPU rather than on the GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn set_eta(kind: &mut SchedulerKind, eta: f64) {
    match kind {
        SchedulerKind::DDIMScheduler(config) => config.eta = eta,
        SchedulerKind::DDIMDSSScheduler(config) => config.eta = eta,
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    };

    let mode = if args.image_to_image {
        GenerationMode::ImageToImage
    } else {
        GenerationMode::TextToImage
    };
    let mut params = match &args.params {
        Some(path) => GenerationParams::from_file(path)
            .with_context(|| format!("loading generation params from {path}"))?,
        None => mode.defaults(),
    };
    params.inference_steps = args.n_steps.unwrap_or(params.inference_steps);
    params.strength = args.strength.unwrap_or(params.strength);
    params.cfg_scale = args.cfg_scale.unwrap_or(params.cfg_scale);
    params.seed = args.seed.unwrap_or(params.seed);

    let mut kind = match &args.config {
        Some(path) => SchedulerKind::from_file(path)
            .with_context(|| format!("loading scheduler config from {path}"))?,
        None => args.sampler.parse()?,
    };
    if let Some(eta) = args.eta {
        set_eta(&mut kind, eta);
    }
    info!(scheduler = kind.name(), ?params, ?mode, "configured");

    let schedule = kind.schedule()?;
    let mut scheduler = kind.build(params.seed)?;
    scheduler.set_inference_timesteps(params.inference_steps)?;
    if mode.uses_input_image() {
        scheduler.set_strength(params.strength)?;
    }

    let shape = [1, 4, args.latent_size, args.latent_size];
    let device = if args.cpu { Device::Cpu } else { get_device() };
    let options = (Kind::Float, device);
    // Separate stream from the scheduler's own noise so both stay reproducible.
    let mut init_noise = SeededNoise::new(params.seed.wrapping_add(1));
    let noise = init_noise.next_normal_tensor(&shape, options);
    let latents = if mode.uses_input_image() {
        let image_latents = Tensor::full(shape, 0.25, options);
        scheduler.add_noise(&image_latents, &noise, scheduler.timesteps()[0])?
    } else {
        noise * scheduler.init_noise_sigma()
    };

    // Stand-in for the UNet: the exact noise estimate towards a fixed clean latent,
    // one target per branch of classifier-free guidance.
    let uncond_target = Tensor::zeros(shape, options);
    let text_target = Tensor::full(shape, 0.5, options);
    let predict_noise = |x: &Tensor, timestep: usize| -> anyhow::Result<Tensor> {
        let alpha = schedule.alpha_cumprod(timestep)?;
        let eps = |target: &Tensor| (x - alpha.sqrt() * target) / (1. - alpha).sqrt();
        Ok(apply_guidance(&eps(&uncond_target), &eps(&text_target), params.cfg_scale))
    };

    let latents = denoise(scheduler.as_mut(), latents, predict_noise, |progress| {
        info!(
            "step {}/{} (t = {}, {} predictions, {:?})",
            progress.position,
            progress.total,
            progress.timestep,
            progress.predictions,
            progress.elapsed
        );
    })?;
    let mean = latents.mean(Kind::Double).double_value(&[]);
    let std = latents.std(true).double_value(&[]);
    info!(mean, std, "final latent");
    println!("final latent mean {mean:.5} std {std:.5}");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    run(args)
}
