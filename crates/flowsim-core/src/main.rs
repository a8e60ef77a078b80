//! flowsim CLI: simulate max-flow scheduling of pipeline-parallel LLM serving.

use clap::{Parser, Subcommand};
use flowsim_core::config::{FeederKind, SimConfig};
use flowsim_core::metrics;
use flowsim_core::SimulationReport;
use flowsim_scheduler::{SchedulingMethod, SchedulingMode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "flowsim",
    about = "Simulate max-flow scheduling of pipeline-parallel LLM serving",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation with a single scheduling method.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Scheduling method, overriding the config.
        #[arg(short, long)]
        method: Option<SchedulingMethod>,
        /// Scheduling mode (online, offline), overriding the config.
        #[arg(long)]
        mode: Option<SchedulingMode>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compare scheduling methods on the same config.
    Compare {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated list of method names; all when empty.
        #[arg(short = 'M', long, value_delimiter = ',')]
        methods: Vec<SchedulingMethod>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Sweep online arrival rates to find the saturation point.
    Sweep {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// Scheduling method, overriding the config.
        #[arg(short, long)]
        method: Option<SchedulingMethod>,
        /// Comma-separated list of request rates (req/s).
        #[arg(long, value_delimiter = ',', required = true)]
        rates: Vec<f64>,
        /// Output results to JSON file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List available scheduling methods.
    ListMethods,
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            method,
            mode,
            output,
        } => {
            let mut sim_config = load_config(&config);
            if let Some(method) = method {
                sim_config.scheduler.method = method;
            }
            if let Some(mode) = mode {
                sim_config.scheduler.mode = mode;
            }

            let result = flowsim_core::run_simulation(sim_config).unwrap_or_else(|e| {
                eprintln!("Simulation failed: {}", e);
                std::process::exit(1);
            });
            println!("{}", metrics::format_table(&result));

            if let Some(output_path) = output {
                write_json(&output_path, &result);
            }
        }
        Commands::Compare {
            config,
            methods,
            output,
        } => {
            let sim_config = load_config(&config);
            let methods = if methods.is_empty() {
                SchedulingMethod::ALL.to_vec()
            } else {
                methods
            };

            let results =
                flowsim_core::compare_methods(&sim_config, &methods).unwrap_or_else(|e| {
                    eprintln!("Simulation failed: {}", e);
                    std::process::exit(1);
                });
            println!("{}", metrics::format_comparison_table(&results));

            for result in &results {
                println!("{}", metrics::format_table(result));
            }

            if let Some(output_path) = output {
                write_json(&output_path, &results);
            }
        }
        Commands::Sweep {
            config,
            method,
            rates,
            output,
        } => {
            let mut sim_config = load_config(&config);
            if let Some(method) = method {
                sim_config.scheduler.method = method;
            }
            if !sim_config
                .feeder
                .as_ref()
                .is_some_and(|f| f.kind == FeederKind::Online)
            {
                eprintln!("Sweep needs an online [feeder] section in the config.");
                std::process::exit(1);
            }

            let mut all_results: Vec<SimulationReport> = Vec::new();
            for rate in &rates {
                let mut cfg = sim_config.clone();
                if let Some(feeder) = cfg.feeder.as_mut() {
                    feeder.rate = *rate;
                }
                let result = flowsim_core::run_simulation(cfg).unwrap_or_else(|e| {
                    eprintln!("Simulation at rate {} failed: {}", rate, e);
                    std::process::exit(1);
                });
                let s = &result.summary;
                println!(
                    "Rate {:.1} req/s: decode {:.1} tok/s | prompt {:.3}s | decode step {:.4}s | dropped {}",
                    rate,
                    s.decode_throughput,
                    s.avg_prompt_latency,
                    s.avg_decode_latency,
                    s.dropped_requests
                );
                all_results.push(result);
            }

            if let Some(output_path) = output {
                write_json(&output_path, &all_results);
            }
        }
        Commands::ListMethods => {
            println!("Available scheduling methods:");
            for name in flowsim_scheduler::available_methods() {
                println!("  - {}", name);
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowsim_core=info,flowsim_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: &Path) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) {
    let json = serde_json::to_string_pretty(value).unwrap_or_else(|e| {
        eprintln!("Error serializing results: {}", e);
        std::process::exit(1);
    });
    std::fs::write(path, json).unwrap_or_else(|e| {
        eprintln!("Error writing output: {}", e);
        std::process::exit(1);
    });
    println!("Results written to {}", path.display());
}
