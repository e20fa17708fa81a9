//! Benchmark driver for the sift benchmark engine.
//!
//! This binary stands up an in-process cluster (one coordinator plus N
//! executor nodes over the in-memory store/transport and a simulated
//! search backend), submits a benchmark, optionally pauses/resumes or
//! aborts it mid-run, and writes the merged response as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sift_bench::{
    BenchError, BenchmarkDefinition, BenchmarkSettings, BenchmarkStartResponse, Competition,
    CoordinatorService, ExecutorService, LivenessTracker, MemCluster, MemStateStore, SearchRequest,
    SimulatedSearchBackend,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "sift-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running one benchmark.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Benchmark id.
    #[arg(long, default_value = "bench-local")]
    benchmark_id: String,

    /// Executor nodes to stand up; the benchmark uses all of them.
    #[arg(long, default_value_t = 3)]
    executors: usize,

    /// Competitions to generate.
    #[arg(long, default_value_t = 1)]
    competitions: usize,

    /// Distinct queries per competition.
    #[arg(long, default_value_t = 5)]
    queries: usize,

    /// Timed iterations per competition per node.
    #[arg(long, default_value_t = 5)]
    iterations: usize,

    /// Requests in flight per iteration on a node.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    /// Repetitions of the query set per iteration.
    #[arg(long, default_value_t = 1)]
    multiplier: usize,

    /// Run an untimed warm-up pass per competition.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    warmup: bool,

    /// Random seed for query generation (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Base simulated per-query service time (ms).
    #[arg(long, default_value_t = 5)]
    latency_base_ms: u64,

    /// Spread added on top of the base service time (ms).
    #[arg(long, default_value_t = 20)]
    latency_spread_ms: u64,

    /// Real wall-clock delay per query; gives pause/abort time to land.
    #[arg(long, default_value = "0ms")]
    pace: humantime::Duration,

    /// Pause the benchmark for this long mid-run, then resume it.
    #[arg(long)]
    pause_for: Option<humantime::Duration>,

    /// Abort the benchmark after this long instead of letting it finish.
    #[arg(long)]
    abort_after: Option<humantime::Duration>,

    /// Client-side deadline for the whole run.
    #[arg(long, default_value = "60s")]
    deadline: humantime::Duration,

    /// Submit this JSON benchmark definition instead of generating one.
    #[arg(long)]
    definition: Option<PathBuf>,

    /// Where to write the merged response JSON ("-" for stdout).
    #[arg(long, default_value = "-")]
    out: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let result = match args.cmd {
        Command::Run(run_args) => run(run_args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}

/// User errors exit 2, cluster/engine errors exit 3.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<BenchError>() {
        Some(
            BenchError::InvalidDefinition(_)
            | BenchError::InsufficientExecutors { .. }
            | BenchError::AlreadyExists(_)
            | BenchError::UnknownBenchmark(_),
        ) => ExitCode::from(2),
        _ => ExitCode::from(3),
    }
}

/// Bad CLI input is a user error (exit 2), not a cluster failure.
fn user_error(message: impl Into<String>) -> anyhow::Error {
    BenchError::InvalidDefinition(message.into()).into()
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    if args.executors == 0 {
        return Err(user_error("--executors must be > 0"));
    }
    if args.competitions == 0 {
        return Err(user_error("--competitions must be > 0"));
    }
    if args.queries == 0 {
        return Err(user_error("--queries must be > 0"));
    }

    let definition = match &args.definition {
        Some(path) => {
            let data = std::fs::read(path)
                .map_err(|err| user_error(format!("read {}: {err}", path.display())))?;
            serde_json::from_slice::<BenchmarkDefinition>(&data)
                .map_err(|err| user_error(format!("parse benchmark definition: {err}")))?
        }
        None => generate_definition(&args),
    };
    definition.validate()?;

    let cluster = LocalCluster::start(&args);
    let deadline: Duration = args.deadline.into();

    tracing::info!(
        benchmark = %definition.benchmark_id,
        competitions = definition.competitions.len(),
        executors = definition.num_executor_nodes,
        iterations = definition.settings.iterations,
        "submitting benchmark"
    );
    let pending = cluster.coordinator.start_benchmark(definition).await?;
    let benchmark_id = pending.benchmark_id.clone();

    if let Some(pause_for) = args.pause_for {
        drive_pause_resume(&cluster.coordinator, &benchmark_id, pause_for.into(), deadline).await?;
    }
    if let Some(abort_after) = args.abort_after {
        tokio::time::sleep(abort_after.into()).await;
        match cluster
            .coordinator
            .abort_benchmark(&[benchmark_id.clone()], Some(deadline))
            .await
        {
            Ok(_) => tracing::info!(benchmark = %benchmark_id, "benchmark aborted"),
            // The run can beat the timer; that is not an error.
            Err(BenchError::UnknownBenchmark(_)) => {
                tracing::info!(benchmark = %benchmark_id, "benchmark finished before the abort")
            }
            Err(err) => return Err(err.into()),
        }
    }

    let response = pending.wait_for(deadline).await?;
    report(&response);
    write_response(&args.out, &response)?;

    if response.state == sift_bench::BenchmarkState::Failed {
        anyhow::bail!("benchmark failed: {}", response.errors.join("; "));
    }
    Ok(())
}

/// Wait until the benchmark is pauseable, hold it for `pause_for`, resume.
async fn drive_pause_resume(
    coordinator: &Arc<CoordinatorService>,
    benchmark_id: &str,
    pause_for: Duration,
    deadline: Duration,
) -> anyhow::Result<()> {
    let patterns = vec![benchmark_id.to_string()];
    let mut attempts = 0usize;
    loop {
        match coordinator.pause_benchmark(&patterns, Some(deadline)).await {
            Ok(_) => break,
            // Not running yet: give the executors a moment to come up.
            Err(BenchError::UnknownBenchmark(_)) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            // Already finished; skip the demo pause.
            Err(BenchError::UnknownBenchmark(_)) => {
                tracing::info!(benchmark = %benchmark_id, "benchmark not pauseable, skipping pause");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
    }
    tracing::info!(benchmark = %benchmark_id, pause_for = ?pause_for, "benchmark paused");
    tokio::time::sleep(pause_for).await;
    coordinator
        .resume_benchmark(&patterns, Some(deadline))
        .await?;
    tracing::info!(benchmark = %benchmark_id, "benchmark resumed");
    Ok(())
}

/// One coordinator plus N executor nodes over the in-memory adapters.
struct LocalCluster {
    coordinator: Arc<CoordinatorService>,
    _hub: Arc<MemCluster>,
}

impl LocalCluster {
    fn start(args: &RunArgs) -> Self {
        let hub = MemCluster::new();
        let store = Arc::new(MemStateStore::new());
        let liveness = Arc::new(LivenessTracker::new());

        let master_transport = hub.add_node(1, false);
        let coordinator = Arc::new(CoordinatorService::new(
            store.clone(),
            master_transport,
            liveness,
        ));
        hub.register_definition_handler(1, coordinator.clone());
        coordinator.spawn();

        let pace: Duration = args.pace.into();
        let backend = Arc::new(if pace.is_zero() {
            SimulatedSearchBackend::new(args.latency_base_ms, args.latency_spread_ms)
        } else {
            SimulatedSearchBackend::paced(args.latency_base_ms, args.latency_spread_ms, pace)
        });

        for offset in 0..args.executors {
            let node_id = 2 + offset as u64;
            let transport = hub.add_node(node_id, true);
            let service = Arc::new(ExecutorService::new(
                store.clone(),
                transport,
                backend.clone(),
            ));
            hub.register_executor_handler(node_id, service.clone());
            service.spawn();
        }

        Self {
            coordinator,
            _hub: hub,
        }
    }
}

fn generate_definition(args: &RunArgs) -> BenchmarkDefinition {
    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let settings = BenchmarkSettings {
        iterations: args.iterations,
        concurrency: args.concurrency,
        multiplier: args.multiplier,
        warmup: args.warmup,
        allow_cache_clearing: false,
    };

    let mut definition = BenchmarkDefinition::new(&args.benchmark_id)
        .with_executors(args.executors)
        .with_settings(settings);
    for index in 0..args.competitions {
        let requests = (0..args.queries)
            .map(|_| SearchRequest::new("docs", format!("term:{:08x}", rng.gen::<u32>())))
            .collect();
        definition = definition.add_competition(Competition::new(format!("c{index}"), requests));
    }
    definition
}

fn report(response: &BenchmarkStartResponse) {
    tracing::info!(
        benchmark = %response.benchmark_id,
        state = ?response.state,
        errors = response.errors.len(),
        "benchmark finished"
    );
    for (name, result) in &response.competition_results {
        tracing::info!(
            competition = %name,
            nodes = result.node_results.len(),
            total_queries = result.summary.total_queries,
            completed_iterations = result.summary.total_completed_iterations,
            qps = %format!("{:.1}", result.summary.queries_per_second),
            mean_ms = %format!("{:.2}", result.summary.mean_ms),
            "competition summary"
        );
    }
}

/// Serialize the response to `--out` ("-" writes to stdout).
fn write_response(out: &str, response: &BenchmarkStartResponse) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(response).context("serialize response")?;
    if out == "-" {
        let mut text = String::from_utf8(data).context("utf8 response")?;
        text.push('\n');
        print!("{text}");
        return Ok(());
    }

    let path = PathBuf::from(out);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    std::fs::write(&path, data).with_context(|| format!("write {}", path.display()))?;
    eprintln!("wrote response: {}", path.display());
    Ok(())
}
