use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use rand::Rng;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use breakwater::circuitbreaker::{CircuitBreaker, ConsecutiveFailures, Settings, State};
use breakwater::clock::{SharedClock, SystemClock};
use breakwater::config::{Algorithm, BreakwaterConfig, LimiterConfig};
use breakwater::error::{BreakwaterError, CallError};
use breakwater::ratelimit::WaitContext;

#[derive(Parser, Debug)]
#[command(name = "breakwater", version, about = "Circuit breaker and rate limiter playground")]
struct Cli {
    /// YAML file declaring breakers and limiters by name
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a circuit breaker with randomly failing calls
    Breaker {
        /// Breaker name; looked up in the config file when one is given
        #[arg(long, default_value = "demo")]
        name: String,

        /// Number of calls to make
        #[arg(long, default_value_t = 50)]
        calls: u32,

        /// Probability that a call fails
        #[arg(long, default_value_t = 0.5)]
        failure_rate: f64,

        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 100)]
        pause_ms: u64,

        /// Open-state duration in milliseconds when no config is given
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,

        /// Trip threshold when no config is given
        #[arg(long, default_value_t = 3)]
        failure_threshold: u64,
    },

    /// Fire a burst of concurrent requests at a rate limiter
    Limit {
        /// Limiter name; looked up in the config file when one is given
        #[arg(long, default_value = "demo")]
        name: String,

        #[arg(long, value_enum, default_value_t = AlgorithmArg::TokenBucket)]
        algorithm: AlgorithmArg,

        #[arg(long, default_value_t = 5.0)]
        rate: f64,

        #[arg(long, default_value_t = 5)]
        burst: i64,

        /// Redis server for the distributed algorithm
        #[arg(long)]
        redis_url: Option<String>,

        /// Limiter key the requests share
        #[arg(long, default_value = "client")]
        key: String,

        /// Number of concurrent requests
        #[arg(long, default_value_t = 20)]
        requests: usize,

        /// Wait for quota instead of failing fast
        #[arg(long)]
        wait: bool,

        /// Deadline for waiting requests in milliseconds
        #[arg(long, default_value_t = 2000)]
        deadline_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    TokenBucket,
    SlidingWindow,
    Distributed,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::TokenBucket => Algorithm::TokenBucket,
            AlgorithmArg::SlidingWindow => Algorithm::SlidingWindow,
            AlgorithmArg::Distributed => Algorithm::Distributed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    info!("Starting breakwater");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => BreakwaterConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BreakwaterConfig::default(),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    match cli.command {
        Command::Breaker {
            name,
            calls,
            failure_rate,
            pause_ms,
            timeout_ms,
            failure_threshold,
        } => {
            let settings = config.breaker(&name).unwrap_or_else(|| {
                Settings::new(name.as_str())
                    .with_timeout(Duration::from_millis(timeout_ms))
                    .with_trip_policy(ConsecutiveFailures(failure_threshold))
            });
            run_breaker(
                settings,
                calls,
                failure_rate,
                Duration::from_millis(pause_ms),
                shutdown,
            )
            .await?;
        }
        Command::Limit {
            name,
            algorithm,
            rate,
            burst,
            redis_url,
            key,
            requests,
            wait,
            deadline_ms,
        } => {
            let limiter_config = match config.limiter(&name) {
                Some(limiter) => limiter.clone(),
                None => {
                    let mut limiter = LimiterConfig::new(algorithm.into());
                    limiter.rate = rate;
                    limiter.burst = burst;
                    limiter.redis_url = redis_url;
                    limiter
                }
            };
            let mut ctx = WaitContext::from_token(shutdown.child_token());
            if wait {
                ctx = ctx.deadline_in(Duration::from_millis(deadline_ms));
            }
            run_limiter(&limiter_config, &key, requests, wait, ctx).await?;
        }
    }

    info!("breakwater stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_breaker(
    settings: Settings,
    calls: u32,
    failure_rate: f64,
    pause: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&failure_rate) {
        anyhow::bail!("failure rate must be between 0 and 1, got {}", failure_rate);
    }

    let breaker = CircuitBreaker::new(settings.with_observer(|name: &str, from: State, to: State| {
        info!(breaker = %name, %from, %to, "Breaker changed state");
    }));

    let (mut succeeded, mut failed, mut rejected) = (0u32, 0u32, 0u32);
    for call in 0..calls {
        if shutdown.is_cancelled() {
            warn!(call, "Interrupted");
            break;
        }

        let result = breaker
            .execute_async(async {
                if rand::thread_rng().gen_bool(failure_rate) {
                    Err("simulated failure")
                } else {
                    Ok(())
                }
            })
            .await;

        match result {
            Ok(()) => succeeded += 1,
            Err(CallError::Inner(_)) => failed += 1,
            Err(CallError::Rejected(e)) => {
                rejected += 1;
                info!(call, reason = %e, "Call short-circuited");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(pause) => {}
        }
    }

    let counts = breaker.counts();
    info!(
        breaker = %breaker.name(),
        state = %breaker.state(),
        succeeded,
        failed,
        rejected,
        generation_requests = counts.requests,
        "Breaker run finished"
    );
    Ok(())
}

async fn run_limiter(
    limiter_config: &LimiterConfig,
    key: &str,
    requests: usize,
    wait: bool,
    ctx: WaitContext,
) -> anyhow::Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let limiter = limiter_config
        .build(clock)
        .await
        .context("failed to build rate limiter")?;

    let started = std::time::Instant::now();
    let attempts = (0..requests).map(|i| {
        let limiter = limiter.clone();
        let ctx = ctx.clone();
        async move {
            let result = if wait {
                limiter.wait(&ctx, key, 1).await.map(|_| true)
            } else {
                limiter.allow(key, 1).await
            };
            (i, result)
        }
    });

    let (mut allowed, mut limited, mut failed) = (0usize, 0usize, 0usize);
    for (i, result) in join_all(attempts).await {
        match result {
            Ok(true) => allowed += 1,
            Ok(false) => limited += 1,
            Err(e) if e.is_rejection() || matches!(e, BreakwaterError::DeadlineExceeded) => {
                limited += 1;
                info!(request = i, error = %e, "Request limited");
            }
            Err(e) => {
                failed += 1;
                warn!(request = i, error = %e, "Request failed");
            }
        }
    }

    info!(
        limiter = limiter.name(),
        key = %key,
        allowed,
        limited,
        failed,
        elapsed = ?started.elapsed(),
        "Limiter run finished"
    );
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
    token.cancel();
}
