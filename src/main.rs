use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use taskpile::config::{Config, default_max_parallel};
use taskpile::job::{Job, OutputSinks};
use taskpile::pile::Taskpile;
use taskpile::spec::{TaskGroupSpec, TaskInstance};

#[derive(Parser)]
#[command(name = "taskpile", version, about = "Run piles of shell jobs with bounded parallelism")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Expand a task-group spec and run every job it describes.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to a JSON task-group spec.
    spec: PathBuf,

    /// Maximum number of jobs running at once [default: cores minus one].
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Niceness applied to every job process (-20 to 19).
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    niceness: i32,

    /// Total number of repeats of the whole expansion.
    #[arg(long, default_value_t = 1)]
    repeats: usize,

    /// First repeat index, for resuming an interrupted batch.
    #[arg(long, default_value_t = 0)]
    start_repeat: usize,

    /// Directory for job output and instance files [default: fresh temp dir].
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Seconds between scheduling passes.
    #[arg(long, default_value_t = 1)]
    interval: u64,

    /// List the expanded jobs without running anything.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    if !(-20..=19).contains(&args.niceness) {
        eprintln!("Error: niceness must be between -20 and 19");
        std::process::exit(1);
    }
    if args.interval == 0 {
        eprintln!("Error: interval must be at least one second");
        std::process::exit(1);
    }

    let config = Config {
        max_parallel: args.max_parallel.unwrap_or_else(default_max_parallel),
        niceness: args.niceness,
        interval_secs: args.interval,
    };

    // ── Spec ─────────────────────────────────────────────────────────────
    let raw = std::fs::read_to_string(&args.spec).unwrap_or_else(|e| {
        eprintln!("Error: failed to read {}: {}", args.spec.display(), e);
        std::process::exit(1);
    });
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap_or_else(|e| {
        eprintln!("Error: {} is not valid JSON: {}", args.spec.display(), e);
        std::process::exit(1);
    });
    let group_spec = TaskGroupSpec::from_json(&value).unwrap_or_else(|e| {
        eprintln!("Error: {}: {}", args.spec.display(), e);
        std::process::exit(1);
    });

    let expansion = group_spec
        .expand_repeats(args.start_repeat, args.repeats)
        .unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        });

    let mut instances: Vec<TaskInstance> = Vec::new();
    let mut skipped = 0usize;
    for result in expansion {
        match result {
            Ok(instance) => instances.push(instance),
            Err(e) => {
                warn!(error = %e, "skipping task instance");
                skipped += 1;
            }
        }
    }

    if args.dry_run {
        for instance in &instances {
            if instance.name == instance.command {
                println!("{}", instance.command);
            } else {
                println!("{}: {}", instance.name, instance.command);
            }
        }
        if skipped > 0 {
            eprintln!("{} instance(s) skipped", skipped);
            std::process::exit(1);
        }
        return Ok(());
    }

    // ── Output directory ─────────────────────────────────────────────────
    let output_dir = match &args.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).unwrap_or_else(|e| {
                eprintln!("Error: failed to create {}: {}", dir.display(), e);
                std::process::exit(1);
            });
            dir.clone()
        }
        None => tempfile::Builder::new()
            .prefix("taskpile.")
            .tempdir()
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to create output directory: {}", e);
                std::process::exit(1);
            })
            .keep(),
    };

    eprintln!("taskpile v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Spec: {}", args.spec.display());
    eprintln!("   Jobs: {}", instances.len());
    eprintln!("   Max parallel: {}", config.max_parallel);
    if config.niceness != 0 {
        eprintln!("   Niceness: {}", config.niceness);
    }
    eprintln!("   Output dir: {}\n", output_dir.display());

    // ── Jobs ─────────────────────────────────────────────────────────────
    let mut pile = Taskpile::new(config.max_parallel);
    for (i, instance) in instances.iter().enumerate() {
        let stdout = File::create(output_dir.join(format!("job{i}.out"))).unwrap_or_else(|e| {
            eprintln!("Error: failed to create output file in {}: {}", output_dir.display(), e);
            std::process::exit(1);
        });
        let stderr = File::create(output_dir.join(format!("job{i}.err"))).unwrap_or_else(|e| {
            eprintln!("Error: failed to create output file in {}: {}", output_dir.display(), e);
            std::process::exit(1);
        });
        let sinks = OutputSinks { stdout, stderr };
        match Job::from_instance_in(instance, config.niceness, sinks, &output_dir) {
            Ok(job) => pile.enqueue(Arc::new(job)),
            Err(e) => {
                warn!(job = %instance.name, error = %e, "skipping job");
                skipped += 1;
            }
        }
    }

    // ── Scheduling loop ──────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pile.reconcile().await {
                    warn!(error = %e, "scheduling pass failed, shutting down");
                    pile.terminate_all().await;
                    break;
                }
                if pile.is_idle() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, terminating all jobs");
                pile.terminate_all().await;
                break;
            }
        }
    }

    // ── Report ───────────────────────────────────────────────────────────
    let mut failed = 0usize;
    for job in pile.finished() {
        let outcome = job.describe_outcome().unwrap_or_else(|| "[?]".to_string());
        if job.succeeded() != Some(true) {
            failed += 1;
        }
        println!("{outcome:>10} {}", job.name());
        job.remove_instance_files();
    }
    eprintln!(
        "\n{} finished, {} failed, {} skipped",
        pile.finished().len(),
        failed,
        skipped
    );

    if failed > 0 || skipped > 0 {
        std::process::exit(1);
    }
    Ok(())
}
