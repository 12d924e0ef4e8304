use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, Rng, SeedableRng};
use speculator_core::{
    loader::{self, WeightRouting},
    MlpSpeculator, TpContext,
};

use speculator_cli::config::{parse_device, parse_dtype, CliConfig};
use speculator_cli::logging;

#[derive(Parser)]
#[command(name = "speculator", about = "Inspect and exercise MLP speculator checkpoints")]
struct Cli {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a checkpoint's configuration, tying layout and parameter counts
    Inspect {
        /// Checkpoint directory or HuggingFace Hub id
        source: String,

        #[command(flatten)]
        speculation: SpeculationArgs,
    },
    /// Run the speculator on seeded random hidden states
    Run {
        /// Checkpoint directory or HuggingFace Hub id
        source: String,

        /// Number of rows
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Token id fed to the first head for every row
        #[arg(long, default_value_t = 0)]
        token: u32,

        /// Seed for the hidden states
        #[arg(long)]
        seed: Option<u64>,

        /// Weight dtype (f32, f16, bf16)
        #[arg(long)]
        dtype: Option<String>,

        /// Compute device (cpu, cuda, cuda:N, metal)
        #[arg(long)]
        device: Option<String>,

        #[command(flatten)]
        speculation: SpeculationArgs,
    },
    /// Show or update the persisted defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Default)]
struct SpeculationArgs {
    /// Branching factor per head, e.g. `4,3,2,2`
    #[arg(long = "top-k", value_delimiter = ',')]
    top_k: Option<Vec<usize>>,

    /// Heads to run (defaults to the checkpoint's n_predict)
    #[arg(long)]
    num_speculative_tokens: Option<usize>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file location and contents
    Show,
    /// Write the given values (and `--log-level`) into the config file
    Save {
        #[arg(long)]
        dtype: Option<String>,

        #[arg(long)]
        device: Option<String>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        max_batch_for_speculation: Option<usize>,

        #[arg(long)]
        norm_eps: Option<f64>,

        #[command(flatten)]
        speculation: SpeculationArgs,
    },
}

impl SpeculationArgs {
    fn overrides(self) -> CliConfig {
        CliConfig {
            top_k_per_head: self.top_k,
            num_speculative_tokens: self.num_speculative_tokens,
            ..Default::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut config = CliConfig::load();
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    logging::init_with_level(&level)?;
    if let Some(path) = CliConfig::default_path().filter(|p| p.exists()) {
        tracing::debug!(path = %path.display(), "loaded config file");
    }

    match cli.command {
        Command::Inspect {
            source,
            speculation,
        } => {
            config.merge(&speculation.overrides());
            inspect(&source, &config)
        }
        Command::Run {
            source,
            batch,
            token,
            seed,
            dtype,
            device,
            speculation,
        } => {
            let mut flags = speculation.overrides();
            flags.seed = seed;
            flags.dtype = dtype;
            flags.device = device;
            config.merge(&flags);
            run(&source, batch, token, &config)
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                match CliConfig::default_path() {
                    Some(path) => println!("# {}", path.display()),
                    None => println!("# no config directory available"),
                }
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Save {
                dtype,
                device,
                seed,
                max_batch_for_speculation,
                norm_eps,
                speculation,
            } => {
                let mut flags = speculation.overrides();
                flags.dtype = dtype;
                flags.device = device;
                flags.seed = seed;
                flags.max_batch_for_speculation = max_batch_for_speculation;
                flags.norm_eps = norm_eps;
                flags.log_level = cli.log_level;
                config.merge(&flags);
                let path = config.save()?;
                println!("Saved config to {}", path.display());
                Ok(())
            }
        },
    }
}

fn inspect(source: &str, config: &CliConfig) -> anyhow::Result<()> {
    let files = loader::locate_speculator(source)?;
    let routing = WeightRouting::build(&files.weights)?;
    let policy = config.speculation();

    let vb = routing.var_builder(DType::F32, &Device::Cpu)?;
    let model = MlpSpeculator::new(
        &files.config,
        &policy,
        vb.pp("speculator"),
        TpContext::single_device(),
    )?;

    println!("{}", serde_json::to_string_pretty(&files.config)?);
    println!();
    println!(
        "files: {}  tensors: {}  speculator tensors: {}",
        routing.files().len(),
        routing.len(),
        routing.names_with_prefix("speculator.").count()
    );

    let weights = model.mixing_weights();
    println!(
        "heads: {}  top-k: {:?}  state weight: {:.6}  embed weight: {:.6}",
        model.n_predict(),
        model.top_k_per_head(),
        weights.state,
        weights.embed
    );

    println!("head  emb  proj  head  ln");
    for i in 0..model.n_predict() {
        if let Some(slot) = model.head_slot(i) {
            println!(
                "{:>4}  {:>3}  {:>4}  {:>4}  {:>2}",
                i, slot.embedding, slot.state_projection, slot.output_projection, slot.norm
            );
        }
    }

    let counts = model.parameter_counts();
    println!(
        "distinct parameters: {} embeddings, {} state projections, {} output projections, {} norms",
        counts.embeddings, counts.state_projections, counts.output_projections, counts.norms
    );
    Ok(())
}

fn run(source: &str, batch: usize, token: u32, config: &CliConfig) -> anyhow::Result<()> {
    let device = parse_device(config.device.as_deref())?;
    let dtype = parse_dtype(config.dtype.as_deref())?;
    let seed = config.seed.unwrap_or(0);

    let files = loader::locate_speculator(source)?;
    if token as usize >= files.config.vocab_size {
        anyhow::bail!(
            "--token {} is outside the vocabulary (size {})",
            token,
            files.config.vocab_size
        );
    }

    let load_start = Instant::now();
    let model = loader::load_speculator(
        &files,
        &config.speculation(),
        dtype,
        &device,
        TpContext::single_device(),
    )?;
    tracing::info!(
        elapsed_ms = load_start.elapsed().as_millis() as u64,
        ?dtype,
        "loaded speculator"
    );

    let emb_dim = model.emb_dim();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..batch * emb_dim)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();
    let hidden = Tensor::from_vec(data, (batch, emb_dim), &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(&device)?;
    let ids = Tensor::from_vec(vec![token; batch], batch, &device)?;

    let start = Instant::now();
    let trace = model.forward_with_trace(&hidden, &ids)?;
    tracing::info!(
        batch,
        seed,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "speculator forward"
    );

    for (head, step) in trace.steps.iter().enumerate() {
        tracing::debug!(
            head,
            multiplicity = step.multiplicity,
            candidates = step.candidate_ids.dim(0)?,
            "candidate rows"
        );
    }

    let probs: Vec<Vec<Vec<f32>>> = trace.all_probs.to_device(&Device::Cpu)?.to_vec3()?;
    for (row, heads) in probs.iter().enumerate() {
        for (head, dist) in heads.iter().enumerate() {
            let (best, p) = dist
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
            tracing::info!(row, head, token = best, prob = p, "draft");
        }
    }
    Ok(())
}
