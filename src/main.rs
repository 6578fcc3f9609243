use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

use fleet_batcher::config::Config;
use fleet_batcher::context::{Clock, Context, ManualClock, SystemClock};
use fleet_batcher::driver::{run_until_shutdown, TargetRunner};
use fleet_batcher::fleet::{JobKind, JobResult};
use fleet_batcher::shutdown::install_shutdown_handler;
use fleet_batcher::sim::{SimTarget, SimWorld};

#[derive(Parser, Debug)]
#[command(name = "fleet-batcher")]
#[command(version)]
#[command(about = "Batch job planner for a fleet of compute hosts")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the batcher against a simulated fleet
    Simulate {
        #[command(flatten)]
        world: WorldArgs,

        /// Run this many ticks on a simulated clock instead of the wall clock
        #[arg(long)]
        ticks: Option<u64>,

        /// Output format for the final summary
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Print the next cycle the planner would schedule, without running it
    Plan {
        #[command(flatten)]
        world: WorldArgs,
    },
}

// =============================================================================
// Simulated World Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorldArgs {
    /// Name of the target to batch against
    #[arg(long, default_value = "alpha")]
    target: String,

    /// Path to a JSON configuration file (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker hosts in addition to the home host
    #[arg(long, default_value = "4")]
    hosts: u32,

    /// Capacity of each worker host
    #[arg(long, default_value = "512")]
    capacity: f64,

    /// Capacity of the home host
    #[arg(long, default_value = "128")]
    home_capacity: f64,

    /// Initial value ratio of the target
    #[arg(long, default_value = "1.0")]
    value_ratio: f64,

    /// Initial defense of the target above its minimum
    #[arg(long, default_value = "0.0")]
    defense: f64,

    /// Suppress duration at minimum defense, e.g. "20s"
    #[arg(long, default_value = "20s")]
    suppress_time: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct KindTotals {
    jobs: u64,
    threads: u64,
    impact: f64,
}

#[derive(Serialize)]
struct SimulationSummary {
    target: String,
    elapsed_ms: f64,
    planner_state: String,
    value_ratio: f64,
    defense: f64,
    min_defense: f64,
    results: HashMap<JobKind, KindTotals>,
    killed_on_shutdown: u32,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn load_config(path: &Option<PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    match Config::load(path)? {
        Some(config) => Ok(config),
        None => {
            tracing::warn!(path = %path.display(), "No usable configuration in file, using defaults");
            Ok(Config::default())
        }
    }
}

fn build_world(args: &WorldArgs, config: &Config, clock: Arc<dyn Clock>) -> Arc<SimWorld> {
    let target = SimTarget {
        value_ratio: args.value_ratio.clamp(0.0, 1.0),
        defense: SimTarget::default().min_defense + args.defense.max(0.0),
        suppress_time: fleet_batcher::config::parse_time(&args.suppress_time),
        ..SimTarget::default()
    };
    let mut world = SimWorld::new(clock, config)
        .with_host(&config.home_host, args.home_capacity)
        .with_target(&args.target, target);
    for i in 1..=args.hosts {
        world = world.with_host(&format!("node-{i}"), args.capacity);
    }
    Arc::new(world)
}

fn tally(totals: &mut HashMap<JobKind, KindTotals>, result: JobResult) {
    let entry = totals.entry(result.kind).or_insert(KindTotals {
        jobs: 0,
        threads: 0,
        impact: 0.0,
    });
    entry.jobs += 1;
    entry.threads += u64::from(result.threads);
    entry.impact += result.impact;
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_simulate(
    world_args: WorldArgs,
    ticks: Option<u64>,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&world_args.config)?;
    let manual = ticks.map(|_| Arc::new(ManualClock::new(0.0)));
    let clock: Arc<dyn Clock> = match &manual {
        Some(clock) => clock.clone() as Arc<dyn Clock>,
        None => Arc::new(SystemClock),
    };
    let world = build_world(&world_args, &config, clock.clone());
    let ctx = Arc::new(Context::new(config, clock, world.clone(), world.clone()));

    tracing::info!(
        target_id = %world_args.target,
        hosts = world_args.hosts,
        capacity = world_args.capacity,
        ticks = ?ticks,
        "Starting simulation"
    );

    let (tx, mut rx) = mpsc::channel(4096);
    let mut runner = TargetRunner::new(ctx.clone(), world_args.target.clone()).with_results(tx);
    if let Some(path) = &world_args.config {
        runner = runner.with_config_path(path.clone());
    }

    let started = ctx.now();
    let totals = Arc::new(Mutex::new(HashMap::new()));
    let collector = {
        let totals = totals.clone();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                tally(&mut *totals.lock().await, result);
            }
        })
    };

    let killed = match (ticks, manual) {
        (Some(ticks), Some(clock)) => {
            let ticker = runner.start();
            let end = started + ticks as f64 * ctx.tick_length();
            while ctx.now() < end {
                let wait = runner.step().await?;
                clock.advance(wait.max(1.0));
                tokio::task::yield_now().await;
            }
            ticker.cancel();
            runner.shutdown().await
        }
        _ => {
            let shutdown = install_shutdown_handler()?;
            run_until_shutdown(&runner, shutdown).await?
        }
    };
    let planner_state = runner.planner_state().await;
    // The runner holds the last sender, so the collector finishes once it is gone.
    drop(runner);
    collector.await?;
    let totals = std::mem::take(&mut *totals.lock().await);

    let state = world.target(&world_args.target).unwrap_or_default();
    let summary = SimulationSummary {
        target: world_args.target,
        elapsed_ms: ctx.now() - started,
        planner_state: format!("{planner_state:?}"),
        value_ratio: state.value_ratio,
        defense: state.defense,
        min_defense: state.min_defense,
        results: totals,
        killed_on_shutdown: killed,
    };

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!("Target:       {}", summary.target);
            println!("Elapsed:      {:.1}s", summary.elapsed_ms / 1000.0);
            println!("Value ratio:  {:.4}", summary.value_ratio);
            println!(
                "Defense:      {:.3} (min {:.3})",
                summary.defense, summary.min_defense
            );
            println!("{:<12} {:>8} {:>10} {:>16}", "KIND", "JOBS", "THREADS", "IMPACT");
            println!("{}", "-".repeat(49));
            for kind in JobKind::ALL {
                if let Some(t) = summary.results.get(&kind) {
                    println!("{:<12} {:>8} {:>10} {:>16.2}", kind.to_string(), t.jobs, t.threads, t.impact);
                }
            }
        }
    }
    Ok(())
}

async fn handle_plan(world_args: WorldArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&world_args.config)?;
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0.0));
    let world = build_world(&world_args, &config, clock.clone());
    let ctx = Arc::new(Context::new(config, clock, world.clone(), world));
    let runner = TargetRunner::new(ctx, world_args.target);
    let plan = runner.plan_cycle().await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Simulate {
            world,
            ticks,
            output,
        } => {
            handle_simulate(world, ticks, output).await?;
        }
        Commands::Plan { world } => {
            handle_plan(world).await?;
        }
    }

    Ok(())
}
