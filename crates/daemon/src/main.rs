//! Adaptest Daemon
//!
//! Runs adaptive browser tests in an exclusive pool of sandbox containers.

use adaptest_common::{Database, RunStore, TestCase};
use adaptest_daemon::capability::advisor_from_config;
use adaptest_daemon::config::RunOverrides;
use adaptest_daemon::{
    AdaptiveEngine, DaemonConfig, Dispatcher, DockerRuntime, EngineParts, HealthMonitor,
    JobRequest, JobResponse, PoolManager, ReliabilityAggregator,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "adaptestd")]
#[command(about = "Adaptest daemon - adaptive browser tests in isolated sandboxes")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "ADAPTEST_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, env = "ADAPTEST_STORE")]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one test case and print the result as JSON
    Run {
        /// Test case YAML file
        #[arg(long)]
        case: PathBuf,

        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Override the adaptation budget
        #[arg(long)]
        max_adaptations: Option<u32>,
    },

    /// Read JSON-lines jobs on stdin, write JSON-lines results on stdout
    Serve,

    /// Recompute and print a test case's reliability
    Reliability {
        /// Test case id
        test_case_id: String,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(debug: bool, json: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries results; logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| adaptest_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

/// Everything a running daemon holds on to
struct Daemon {
    config: DaemonConfig,
    db: Database,
    pool: Arc<PoolManager>,
    engine: Arc<AdaptiveEngine>,
}

impl Daemon {
    async fn start(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.store_path).await?;
        let db = Database::open(config.db_path())?;
        let store: Arc<dyn RunStore> = Arc::new(db.clone());

        let runtime = Arc::new(DockerRuntime::new(config.runtime.clone())?);
        let pool = Arc::new(
            PoolManager::new(config.pool.clone(), runtime.clone()).with_store(store.clone()),
        );
        let aggregator =
            ReliabilityAggregator::new(store.clone(), config.reliability.adaptation_penalty);

        let engine = Arc::new(AdaptiveEngine::new(
            config.engine.clone(),
            EngineParts {
                pool: pool.clone(),
                runtime: runtime.clone(),
                capturer: runtime,
                advisor: advisor_from_config(&config.advisor)?,
                store,
                aggregator,
            },
        ));

        Ok(Self {
            config,
            db,
            pool,
            engine,
        })
    }
}

async fn run_once(
    config: DaemonConfig,
    case_path: PathBuf,
    run_id: Option<String>,
    max_adaptations: Option<u32>,
) -> anyhow::Result<()> {
    let case = TestCase::from_file(&case_path)
        .with_context(|| format!("loading test case {}", case_path.display()))?;
    let daemon = Daemon::start(config).await?;
    daemon.db.save_test_case(&case)?;

    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let overrides = RunOverrides {
        max_adaptations,
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                cancel.cancel();
            }
        })
    };

    let result = daemon
        .engine
        .execute(&case, &run_id, &overrides, cancel)
        .await?;
    watcher.abort();
    daemon.pool.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    let daemon = Daemon::start(config).await?;

    for case in TestCase::load_all(&daemon.config.specs_dir).unwrap_or_else(|e| {
        warn!(
            "No test cases loaded from {}: {}",
            daemon.config.specs_dir.display(),
            e
        );
        Vec::new()
    }) {
        daemon.db.save_test_case(&case)?;
    }

    if daemon.config.pool.min_idle > 0 {
        if let Err(e) = daemon.pool.warm_up(daemon.config.pool.min_idle).await {
            warn!("Initial warm-up failed: {}", e);
        }
    }

    let shutdown = CancellationToken::new();
    let monitor = HealthMonitor::new(daemon.pool.clone());
    let monitor_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { monitor.run(shutdown).await }
    });

    let dispatcher = Dispatcher::new(daemon.engine.clone());
    let (tx, mut rx) = mpsc::unbounded_channel::<JobResponse>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            match serde_json::to_string(&response) {
                Ok(line) => {
                    if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(e) => error!("Failed to encode response: {}", e),
            }
        }
    });

    info!("Daemon ready; reading jobs from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut jobs = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                dispatcher.cancel_all();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JobRequest>(&line) {
                    Ok(job) => {
                        let handle = dispatcher.submit(job);
                        let tx = tx.clone();
                        jobs.push(tokio::spawn(async move {
                            match handle.await {
                                Ok(response) => {
                                    let _ = tx.send(response);
                                }
                                Err(e) => error!("Job task failed: {}", e),
                            }
                        }));
                    }
                    Err(e) => warn!("Ignoring malformed job: {}", e),
                }
            }
        }
    }

    // stdin closed or shutdown requested: let active runs settle
    for job in jobs {
        let _ = job.await;
    }
    drop(tx);
    let _ = writer.await;

    shutdown.cancel();
    let _ = monitor_handle.await;
    daemon.pool.shutdown().await;

    info!("Daemon shutdown complete");
    Ok(())
}

fn reliability(config: DaemonConfig, test_case_id: &str) -> anyhow::Result<()> {
    let db = Database::open(config.db_path())?;
    let aggregator = ReliabilityAggregator::new(
        Arc::new(db),
        config.reliability.adaptation_penalty,
    );
    let report = aggregator.on_terminal(test_case_id)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);
    info!("Adaptest daemon v{}", adaptest_common::VERSION);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            case,
            run_id,
            max_adaptations,
        } => run_once(config, case, run_id, max_adaptations).await,
        Commands::Serve => serve(config).await,
        Commands::Reliability { test_case_id } => reliability(config, &test_case_id),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
