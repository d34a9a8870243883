use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use vit_tune_core::{
    checkpoint::{
        adapt_checkpoint, grid_side, load_model, load_pretrained, save_weights, ParamStore,
        POS_EMBED_KEY,
    },
    distributed::{
        init_process_group, Backend, DistributedConfig, Endpoint, LaunchEnv, ProcessGroup,
    },
    measure_throughput, seed_everything, select_device, VisionTransformer, VitConfig,
};

use vit_tune::config::ToolConfig;
use vit_tune::launcher;
use vit_tune::logging;

const DEFAULT_BATCH_SIZE: usize = 32;
const DEFAULT_NUM_BATCHES: usize = 10;
const DEFAULT_SEED: u64 = 0;

#[derive(Parser)]
#[command(name = "vit-tune", about = "Vision Transformer fine-tuning utilities")]
struct Cli {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Target model selection shared by several subcommands.
#[derive(Args, Debug, Clone, Default)]
struct ModelArgs {
    /// JSON file with ViT hyperparameters (defaults to ViT-B/16 at 224px)
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Override the input resolution
    #[arg(long)]
    image_size: Option<usize>,

    /// Override the number of output classes
    #[arg(long)]
    num_classes: Option<usize>,

    /// Parameter dtype (f32, f16, bf16)
    #[arg(long)]
    dtype: Option<String>,
}

impl ModelArgs {
    fn with_file_defaults(mut self, file: &ToolConfig) -> Self {
        self.model_config = self.model_config.or_else(|| file.model_config.clone());
        self.image_size = self.image_size.or(file.image_size);
        self.num_classes = self.num_classes.or(file.num_classes);
        self.dtype = self.dtype.or_else(|| file.dtype.clone());
        self
    }

    fn vit_config(&self) -> anyhow::Result<VitConfig> {
        let mut cfg = match &self.model_config {
            Some(path) => read_vit_config(path)?,
            None => VitConfig::default(),
        };
        if let Some(size) = self.image_size {
            cfg.image_size = size;
        }
        if let Some(classes) = self.num_classes {
            cfg.num_classes = classes;
        }
        Ok(cfg)
    }

    fn dtype(&self) -> anyhow::Result<DType> {
        parse_dtype(self.dtype.as_deref().unwrap_or("f32"))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Adapt pretrained weights to a target model and save them
    Adapt {
        /// Pretrained weights (bare safetensors or a training checkpoint)
        #[arg(long)]
        pretrained: PathBuf,

        /// Where to write the adapted weights
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        model: ModelArgs,
    },

    /// Measure inference throughput, optionally across several GPUs
    Benchmark {
        #[command(flatten)]
        model: ModelArgs,

        /// Weights to load before measuring (random initialisation otherwise)
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Images per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Number of batches to time
        #[arg(long)]
        num_batches: Option<usize>,

        /// Comma-separated GPU ids; more than one spawns one worker per GPU
        #[arg(long)]
        gpus: Option<String>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Process-group backend (tcp, nccl)
        #[arg(long)]
        dist_backend: Option<String>,

        /// Rendezvous endpoint (env:// or tcp://host:port)
        #[arg(long)]
        dist_url: Option<String>,
    },

    /// List tensors in a safetensors file and detect the pos_embed grid
    Inspect {
        /// File to inspect
        path: PathBuf,
    },

    /// Persist defaults to the config file
    Config {
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        num_batches: Option<usize>,

        #[arg(long)]
        gpus: Option<String>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        dist_backend: Option<String>,

        #[arg(long)]
        dist_url: Option<String>,
    },
}

fn read_vit_config(path: &Path) -> anyhow::Result<VitConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading model config {}", path.display()))?;
    VitConfig::from_json_str(&text)
        .with_context(|| format!("parsing model config {}", path.display()))
}

fn parse_dtype(s: &str) -> anyhow::Result<DType> {
    match s.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => anyhow::bail!("unsupported dtype {other:?}"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    let file_config = ToolConfig::load();

    match cli.command {
        Command::Adapt {
            pretrained,
            output,
            model,
        } => run_adapt(&pretrained, &output, model.with_file_defaults(&file_config)),
        Command::Benchmark {
            model,
            weights,
            batch_size,
            num_batches,
            gpus,
            seed,
            dist_backend,
            dist_url,
        } => {
            let settings = BenchmarkSettings {
                model: model.with_file_defaults(&file_config),
                weights,
                batch_size: batch_size
                    .or(file_config.batch_size)
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                num_batches: num_batches
                    .or(file_config.num_batches)
                    .unwrap_or(DEFAULT_NUM_BATCHES),
                gpus: gpus.or(file_config.gpus.clone()),
                seed: seed.or(file_config.seed).unwrap_or(DEFAULT_SEED),
                backend: dist_backend
                    .or(file_config.dist_backend.clone())
                    .map(|b| b.parse::<Backend>())
                    .transpose()?
                    .unwrap_or_default(),
                endpoint: dist_url
                    .or(file_config.dist_url.clone())
                    .map(|u| u.parse::<Endpoint>())
                    .transpose()?
                    .unwrap_or_default(),
            };
            run_benchmark(settings)
        }
        Command::Inspect { path } => run_inspect(&path),
        Command::Config {
            model,
            batch_size,
            num_batches,
            gpus,
            seed,
            dist_backend,
            dist_url,
        } => {
            let update = ToolConfig {
                model_config: model.model_config,
                image_size: model.image_size,
                num_classes: model.num_classes,
                dtype: model.dtype,
                batch_size,
                num_batches,
                gpus,
                seed,
                dist_backend,
                dist_url,
            };
            let mut merged = file_config;
            merged.merge(&update);
            let path = merged.save()?;
            println!("Saved config to {}", path.display());
            print!("{}", toml::to_string_pretty(&merged)?);
            Ok(())
        }
    }
}

fn run_adapt(pretrained: &Path, output: &Path, model: ModelArgs) -> anyhow::Result<()> {
    let cfg = model.vit_config()?;
    let dtype = model.dtype()?;

    let mut weights = load_pretrained(pretrained)
        .with_context(|| format!("loading {}", pretrained.display()))?;
    let target = VisionTransformer::new(&cfg, &Device::Cpu, dtype)?;
    let report = adapt_checkpoint(&mut weights, &target)?;

    save_weights(&target.state_dict()?, output)?;
    tracing::info!(
        layout = ?report.layout,
        orig_grid = report.orig_grid,
        new_grid = report.new_grid,
        removed_head_keys = report.removed_head_keys.len(),
        missing = report.load.missing_keys.len(),
        unexpected = report.load.unexpected_keys.len(),
        output = %output.display(),
        "adapted checkpoint written"
    );
    for key in &report.load.missing_keys {
        tracing::debug!(key = key.as_str(), "kept target initialisation");
    }
    Ok(())
}

struct BenchmarkSettings {
    model: ModelArgs,
    weights: Option<PathBuf>,
    batch_size: usize,
    num_batches: usize,
    gpus: Option<String>,
    seed: u64,
    backend: Backend,
    endpoint: Endpoint,
}

fn run_benchmark(settings: BenchmarkSettings) -> anyhow::Result<()> {
    let dist = DistributedConfig::resolve(&LaunchEnv::from_env(), settings.gpus.as_deref())?
        .with_backend(settings.backend)
        .with_endpoint(settings.endpoint.clone());

    let workers = if dist.needs_spawn() {
        launcher::spawn_workers(&dist)?
    } else {
        launcher::Workers::default()
    };

    let pg = init_process_group(&dist)?;
    let device = select_device(&dist)?;
    let mut rng = seed_everything(settings.seed, &device)?;

    let cfg = settings.model.vit_config()?;
    let dtype = settings.model.dtype()?;
    let model = VisionTransformer::new(&cfg, &device, dtype)?;
    if let Some(path) = &settings.weights {
        load_model(&model, path).with_context(|| format!("loading {}", path.display()))?;
    }

    let shape = (
        settings.batch_size,
        cfg.in_chans,
        cfg.image_size,
        cfg.image_size,
    );
    let numel = settings.batch_size * cfg.in_chans * cfg.image_size * cfg.image_size;
    let pixels: Vec<f32> = (0..numel).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let batch = Tensor::from_vec(pixels, shape, &Device::Cpu)?.to_dtype(dtype)?;

    let batches = std::iter::repeat(batch).take(settings.num_batches);
    let throughput = measure_throughput(&model, &device, batches, settings.num_batches)?;
    tracing::info!(
        rank = pg.rank(),
        images = throughput.images,
        images_per_sec = throughput.images_per_sec,
        "rank finished"
    );

    pg.barrier()?;
    if pg.is_coordinator() {
        println!(
            "throughput: {:.1} images/s ({} images in {:.3}s, world_size {})",
            throughput.images_per_sec,
            throughput.images,
            throughput.elapsed.as_secs_f64(),
            pg.world_size()
        );
    }

    let failed = workers.wait();
    if failed > 0 {
        anyhow::bail!("{failed} worker(s) failed");
    }
    Ok(())
}

fn run_inspect(path: &Path) -> anyhow::Result<()> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut names: Vec<_> = tensors.keys().collect();
    names.sort();
    for name in names {
        let t = &tensors[name];
        println!("{name}\t{:?}\t{:?}", t.dtype(), t.dims());
    }

    let pos_embed = tensors.iter().find(|(name, _)| {
        name.as_str() == POS_EMBED_KEY || name.ends_with(&format!(".{POS_EMBED_KEY}"))
    });
    match pos_embed {
        Some((name, t)) => {
            let tokens = t.dims().get(1).copied().unwrap_or(0);
            let side = grid_side(tokens);
            println!(
                "{name}: {tokens} tokens = {} extra + {side}x{side} grid",
                tokens - side * side
            );
        }
        None => println!("no {POS_EMBED_KEY} found"),
    }
    Ok(())
}
