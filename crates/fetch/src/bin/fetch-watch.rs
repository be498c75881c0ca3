// fetch-watch: poll one URL through the request coordination core
//
// Design Decision: Use clap derive with env fallbacks, like the everruns CLI.
// Design Decision: Persist the poll interval in a JSON preferences file so the
// last chosen interval survives restarts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use everruns_fetch::polling::{IntervalStore, JsonFilePreferences};
use everruns_fetch::telemetry::init_tracing;
use everruns_fetch::{
    FetchClient, FetchConfig, FetchOptions, FetchPayload, Poller, PollerOptions, Priority,
    StartOptions,
};

#[derive(Parser)]
#[command(name = "fetch-watch")]
#[command(about = "Poll a URL with deduplication, backoff and timeouts")]
#[command(version)]
struct Cli {
    /// URL (absolute, or relative to --base-url)
    url: String,

    /// Base URL for relative request URLs
    #[arg(long, env = "FETCH_BASE_URL")]
    base_url: Option<String>,

    /// Poll interval in milliseconds (persisted for future runs)
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Per-attempt timeout in milliseconds
    #[arg(long, env = "FETCH_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Submit polls with high priority
    #[arg(long)]
    high_priority: bool,

    /// Preferences file
    #[arg(long, env = "FETCH_WATCH_PREFS", default_value = ".fetch-watch.json")]
    prefs: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("everruns_fetch=info,fetch_watch=info")?;

    let cli = Cli::parse();

    let mut config = FetchConfig::from_env();
    if let Some(base_url) = cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(ms) = cli.timeout_ms {
        config = config.with_default_timeout(Duration::from_millis(ms));
    }
    let client = FetchClient::new(config).context("Failed to create fetch client")?;

    let store = Arc::new(IntervalStore::new(Arc::new(JsonFilePreferences::new(
        &cli.prefs,
    ))));
    if let Some(ms) = cli.interval_ms {
        store
            .set_interval(Duration::from_millis(ms))
            .context("Invalid poll interval")?;
    }

    let priority = if cli.high_priority {
        Priority::High
    } else {
        Priority::Normal
    };
    let url = cli.url;

    let poller = Poller::new(
        {
            let client = client.clone();
            let url = url.clone();
            move || {
                let client = client.clone();
                let url = url.clone();
                async move {
                    let payload = client
                        .fetch(&url, FetchOptions::new().with_priority(priority))
                        .await?;
                    print_payload(&payload)?;
                    Ok::<(), anyhow::Error>(())
                }
            }
        },
        PollerOptions::new("fetch-watch").with_interval_store(store.clone()),
    );

    let interval = poller
        .start(StartOptions::default())
        .context("Failed to start poller")?;
    tracing::info!(%url, interval_ms = interval.as_millis() as u64, "Watching");

    tokio::signal::ctrl_c().await?;

    poller.cleanup();
    tracing::info!(
        failures = poller.failure_count(),
        last_success = ?poller.last_success(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_payload(payload: &FetchPayload) -> Result<()> {
    match payload {
        FetchPayload::Json(value) => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        FetchPayload::Raw(response) => {
            println!("{} {}", response.status, response.status_text);
            println!("{}", response.text());
        }
    }
    Ok(())
}
