//! ctrleval CLI - run and report controlled-generation experiments.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ctrleval::client::HealthStatus;
use ctrleval::domain::{cache_key_fn, default_prompt_formatter, load_system_prompt};
use ctrleval::models::parse_lm_args;
use ctrleval::{
    Config, EngineOptions, Evaluation, EvaluationSettings, ExactMatchEvaluator,
    GrammarPotentialFactory, HttpEngine, Model, RecordStore, ResultAggregator, StrategyRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ctrleval")]
#[command(version)]
#[command(about = "Controlled-generation experiments over an SMC decoding engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model over a dataset and report accuracy
    Run {
        /// Path to input instances JSONL file
        #[arg(short, long)]
        instances: PathBuf,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Aggregate persisted results
    Report {
        /// Directory holding *-results.json files (defaults to evaluation.output_dir)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Bootstrap seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List model types and the parameters they use
    Strategies,

    /// Validate configuration file
    Validate {
        /// Also check that the decoding engine is reachable
        #[arg(long)]
        ping: bool,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Show example configuration
    Example,
}

/// Command-line overrides for configuration fields.
#[derive(Args, Default)]
struct Overrides {
    #[arg(long)]
    model_type: Option<String>,

    #[arg(long)]
    lm_name: Option<String>,

    /// Language model arguments as a JSON object
    #[arg(long)]
    lm_args: Option<String>,

    #[arg(long)]
    n_particles: Option<usize>,

    #[arg(long)]
    ess_threshold: Option<f64>,

    #[arg(long)]
    resampling_method: Option<String>,

    #[arg(long)]
    max_tokens: Option<usize>,

    #[arg(long)]
    n_replicates: Option<usize>,

    #[arg(long)]
    cache_capacity: Option<usize>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    max_instances: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    overwrite_results: bool,

    #[arg(long)]
    overwrite_outputs: bool,

    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(v) = self.model_type {
            config.model.model_type = v;
        }
        if let Some(v) = self.lm_name {
            config.model.lm_name = v;
        }
        if let Some(raw) = self.lm_args {
            config.model.lm_args = parse_lm_args(&raw).context("Invalid --lm-args")?;
        }
        if let Some(v) = self.n_particles {
            config.sampling.n_particles = v;
        }
        if let Some(v) = self.ess_threshold {
            config.sampling.ess_threshold = v;
        }
        if let Some(v) = self.resampling_method {
            config.sampling.resampling_method = Some(v);
        }
        if let Some(v) = self.max_tokens {
            config.sampling.max_tokens = v;
        }
        if let Some(v) = self.n_replicates {
            config.evaluation.n_replicates = v;
        }
        if let Some(v) = self.cache_capacity {
            config.cache.capacity = v;
        }
        if let Some(v) = self.output_dir {
            config.evaluation.output_dir = v;
        }
        if let Some(v) = self.max_instances {
            config.evaluation.max_instances = Some(v);
        }
        if let Some(v) = self.concurrency {
            config.evaluation.concurrency = v;
        }
        if let Some(v) = self.seed {
            config.evaluation.seed = v;
        }
        config.evaluation.overwrite_results |= self.overwrite_results;
        config.evaluation.overwrite_outputs |= self.overwrite_outputs;
        Ok(())
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path:?}")),
        None => Ok(Config::default()),
    }
}

fn load_with_overrides(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
    let mut config = load_config(path)?;
    overrides.apply(&mut config)?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_example_config() {
    let example = r#"# ctrleval configuration file

[engine]
base_url = "http://localhost:8000"
# API key (can also use CTRLEVAL_ENGINE_API_KEY env var)
# api_key = "${ENGINE_TOKEN}"
timeout_secs = 600
max_retries = 3
tokenizer_parallelism = false

[model]
# base | lcd | grammar-only-is | grammar-only-smc | sample-rerank
# full-is | full-smc | critic-is | critic-smc
model_type = "full-smc"
lm_name = "meta-llama/Meta-Llama-3.1-8B-Instruct"
lm_args = { backend = "vllm" }
# eos_tokens = ["<|eot_id|>"]
# system_prompt = "prompts/system.md"

[sampling]
n_particles = 10
ess_threshold = 0.5
max_tokens = 100
# resampling_method = "multinomial"

[cache]
capacity = 1
key = "schema"   # none | schema | constant | instance

[domain]
grammar_dir = "grammars/"
# grammar_path = "grammars/shared.lark"
verifier = "sql_exec"
verifier_timeout_secs = 5.0

[evaluation]
output_dir = "output/full-smc"
n_replicates = 1
# max_instances = 100
overwrite_results = false
overwrite_outputs = false
concurrency = 1
seed = 0
n_bootstrap = 10000
confidence = 0.95
"#;
    println!("{example}");
}

fn print_strategies(registry: &StrategyRegistry) {
    let flag = |b: bool| if b { "yes" } else { "no" };
    println!(
        "{:<18} {:<22} {:<9} {:<5} {:<10}",
        "MODEL TYPE", "STRATEGY", "PARTICLES", "ESS", "RESAMPLING"
    );
    for entry in registry.entries() {
        println!(
            "{:<18} {:<22} {:<9} {:<5} {:<10}",
            entry.name,
            entry.strategy.to_string(),
            flag(entry.capabilities.particles),
            flag(entry.capabilities.ess),
            flag(entry.capabilities.resampling),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    let registry = StrategyRegistry::builtin();

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Strategies => {
            print_strategies(&registry);
            return Ok(());
        }

        Commands::Validate { ping, overrides } => {
            let config = load_with_overrides(cli.config.as_deref(), overrides)?;
            let normalized = registry
                .normalize(&config.model.model_type, config.run_config())
                .context("Invalid model configuration")?;
            normalized.warn_diagnostics();
            GrammarPotentialFactory::from_config(&config.domain)
                .context("Failed to load domain artifacts")?;

            info!("Configuration is valid");
            info!(
                "  Model type: {} ({})",
                normalized.entry.name, normalized.entry.strategy
            );
            info!("  Language model: {}", normalized.config.lm_name);
            info!(
                "  Particles: {}, ESS threshold: {}",
                normalized.config.n_particles, normalized.config.ess_threshold
            );
            info!(
                "  Cache: capacity {} keyed by {:?}",
                config.cache.capacity, config.cache.key
            );
            info!("  Engine: {}", config.engine.base_url);

            if ping {
                let engine = HttpEngine::from_config(&config)?;
                let health = engine.health_check().await;
                match health.status {
                    HealthStatus::Healthy => info!(
                        latency_ms = health.latency_ms.unwrap_or_default(),
                        "Engine is healthy"
                    ),
                    status => warn!(
                        status = %status,
                        error = health.error.as_deref().unwrap_or(""),
                        "Engine check failed"
                    ),
                }
            }
            return Ok(());
        }

        Commands::Report { output_dir, seed } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(seed) = seed {
                config.evaluation.seed = seed;
            }
            let dir = output_dir.unwrap_or_else(|| config.evaluation.output_dir.clone());

            let store = RecordStore::new(&dir)?;
            let results = store.collect_results()?;
            info!(count = results.len(), dir = %dir.display(), "Aggregating results");

            let aggregate = ResultAggregator::from_config(&config.evaluation)
                .aggregate_results(&results)
                .context("Cannot compute confidence interval")?;
            store.save_summary(&aggregate)?;
            println!("{}", aggregate.report());
        }

        Commands::Run {
            instances,
            overrides,
        } => {
            let config = load_with_overrides(cli.config.as_deref(), overrides)?;

            let normalized = registry
                .normalize(&config.model.model_type, config.run_config())
                .context("Invalid model configuration")?;
            normalized.warn_diagnostics();

            let potentials = GrammarPotentialFactory::from_config(&config.domain)
                .context("Failed to load domain artifacts")?;
            let engine = HttpEngine::from_config(&config)?;

            let system_prompt = config
                .model
                .system_prompt
                .as_deref()
                .map(load_system_prompt)
                .transpose()?;

            let model = Model::from_normalized(normalized, Arc::new(potentials), engine)
                .with_prompt_formatter(default_prompt_formatter(system_prompt))
                .with_cache_key_fn(cache_key_fn(config.cache.key))
                .with_engine_options(EngineOptions {
                    tokenizer_parallelism: config.engine.tokenizer_parallelism,
                });
            let model = Arc::new(model);

            let evaluation = Evaluation::new(
                Arc::clone(&model),
                Arc::new(ExactMatchEvaluator),
                EvaluationSettings::from(&config.evaluation),
            )?;
            let instances = Evaluation::<HttpEngine>::load_instances(&instances)?;
            let report = evaluation.run(instances).await?;

            let cache = model.cache().stats();
            println!("\n=== Evaluation Complete ===");
            println!("Model type:  {}", model.model_type());
            println!("Run id:      {}", report.run_id);
            println!("Evaluated:   {}", report.results.len());
            println!("Reused:      {}", report.reused);
            println!("Failed:      {}", report.failures.len());
            println!(
                "Cache:       {} hits, {} misses, {} evictions",
                cache.hits, cache.misses, cache.evictions
            );
            println!("Runtime:     {:.1}s", report.runtime_secs);
            println!("Output:      {:?}", evaluation.store().dir());

            for failure in &report.failures {
                warn!(
                    instance_id = %failure.instance_id,
                    replicate = failure.replicate,
                    error = %failure.error,
                    "Failed instance"
                );
            }

            let aggregate = ResultAggregator::from_config(&config.evaluation)
                .aggregate_results(&report.results)
                .context("Cannot compute confidence interval")?;
            evaluation.store().save_summary(&aggregate)?;
            println!("\n{}", aggregate.report());
        }
    }

    Ok(())
}
