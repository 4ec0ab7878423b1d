use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use rime_client::UpstreamClientBuilder;
use rime_proxy::{serve, Prefetcher, ProxyContext};
use rime_stats::Stats;
use rime_store::Store;
use rime_sync::{SeqCursor, SyncOptions, Synchronizer};

mod logging;

/// How long background writes may keep running after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about = "A trimming cache proxy for package-registry metadata")]
struct Cli {
    /// Port to listen on.
    #[arg(long, short, env = "RIME_PORT", default_value_t = 4873)]
    port: u16,

    /// Address to bind.
    #[arg(long, env = "RIME_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// URL of the upstream registry.
    #[arg(
        long,
        env = "RIME_UPSTREAM_URL",
        default_value = "https://registry.npmjs.org"
    )]
    upstream_url: Url,

    /// URL of the upstream changes feed.
    #[arg(
        long,
        env = "RIME_CHANGES_URL",
        default_value = "https://replicate.npmjs.com/_changes"
    )]
    changes_url: Url,

    /// Directory holding the trimmed metadata cache.
    #[arg(long, env = "RIME_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,

    /// Directory holding the sync cursor and the event log.
    #[arg(long, env = "RIME_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Concurrent upstream fetches for prefetch walks and sync batches.
    #[arg(long, env = "RIME_FETCH_CONCURRENCY", default_value_t = 5)]
    fetch_concurrency: usize,

    /// Most packages fetched per dependency-prefetch walk.
    #[arg(long, env = "RIME_PREFETCH_LIMIT", default_value_t = 200)]
    prefetch_limit: usize,

    /// Do not prefetch the dependency closure of fresh misses.
    #[arg(long, env = "RIME_NO_PREFETCH")]
    no_prefetch: bool,

    /// Seconds between changes-feed polls.
    #[arg(long, env = "RIME_POLL_INTERVAL", default_value_t = 10)]
    poll_interval: u64,

    /// Use verbose output.
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Copy, Clone)]
enum ExitStatus {
    /// The proxy shut down cleanly on a signal.
    Success,

    /// Startup failed: port taken, directories not writable, and the like.
    Failure,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Success => ExitCode::from(0),
            ExitStatus::Failure => ExitCode::from(1),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => status.into(),
        Err(err) => {
            #[allow(clippy::print_stderr)]
            {
                eprintln!("rime: {err:#}");
            }
            ExitStatus::Failure.into()
        }
    }
}

async fn run(cli: Cli) -> Result<ExitStatus> {
    logging::setup_logging(cli.verbose)?;

    let store = Arc::new(Store::init(&cli.cache_dir).with_context(|| {
        format!(
            "failed to create the cache directory `{}`",
            cli.cache_dir.display()
        )
    })?);
    let stats = Arc::new(
        Stats::open(cli.data_dir.join("events.log"))
            .await
            .context("failed to open the event log")?,
    );

    let client = UpstreamClientBuilder::new()
        .registry(cli.upstream_url.clone())
        .changes(cli.changes_url.clone())
        .build();

    let prefetcher = (!cli.no_prefetch).then(|| {
        Arc::new(Prefetcher::new(
            client.clone(),
            Arc::clone(&store),
            Arc::clone(&stats),
            cli.fetch_concurrency,
            cli.prefetch_limit,
        ))
    });
    let context = Arc::new(ProxyContext::new(
        Arc::clone(&store),
        Arc::clone(&stats),
        client.clone(),
        prefetcher,
    ));

    let listener = TcpListener::bind(SocketAddr::new(cli.host, cli.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;
    info!(
        "Serving {} from {}",
        cli.upstream_url,
        listener.local_addr().context("no local address")?
    );

    let shutdown = CancellationToken::new();
    let synchronizer = Synchronizer::new(
        client,
        Arc::clone(&store),
        Arc::clone(&stats),
        SeqCursor::new(cli.data_dir.join(".sync-seq")),
        SyncOptions {
            poll_interval: Duration::from_secs(cli.poll_interval),
            concurrency: cli.fetch_concurrency,
            ..SyncOptions::default()
        },
    );
    let sync_task = tokio::spawn(synchronizer.run(shutdown.clone()));
    let server_task = tokio::spawn(serve(listener, Arc::clone(&context), shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    info!("Shutting down");
    shutdown.cancel();

    // Let the synchronizer finish its batch and in-flight strip tasks land
    // their writes before the process exits.
    context.tasks.close();
    let drain = async {
        let _ = sync_task.await;
        let _ = server_task.await;
        context.tasks.wait().await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Shutdown grace period expired with background work still running");
    }

    let totals = stats.totals();
    info!(
        "Served {} hits and {} misses this run",
        totals.hits, totals.misses
    );
    Ok(ExitStatus::Success)
}
