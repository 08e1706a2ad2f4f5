use circles_friends::batch::{BatchOrchestrator, BatchSummary};
use circles_friends::cache::{ResultCache, SystemClock};
use circles_friends::circles::{CandidateAddress, CirclesApi, CirclesClient};
use circles_friends::config::Config;
use circles_friends::resolver::AddressResolver;
use circles_friends::social::NeynarClient;
use circles_friends::trust::TrustListFetcher;

use anyhow::{bail, Context};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONFIG_FILE: &str = "circles-friends.toml";

const USAGE: &str = "\
Usage:
  circles-friends resolve <address>...
  circles-friends follows <fid> [viewer-address]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config = if Path::new(CONFIG_FILE).exists() {
        Config::load(Path::new(CONFIG_FILE))?
    } else {
        Config::from_env()
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Logs go to stderr so stdout stays clean JSON
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let api: Arc<dyn CirclesApi> = Arc::new(CirclesClient::new(&config.circles)?);
    let cache = Arc::new(ResultCache::new(config.cache.clone(), Arc::new(SystemClock)));
    let resolver = Arc::new(AddressResolver::new(
        api.clone(),
        cache.clone(),
        config.activity.clone(),
    ));

    match command.as_str() {
        "resolve" => resolve(&resolver, &args[1..]).await,
        "follows" => {
            let trust = Arc::new(TrustListFetcher::new(api, cache));
            follows(&config, resolver, trust, &args[1..]).await
        }
        other => {
            eprintln!("unknown command: {other}\n{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn resolve(resolver: &AddressResolver, inputs: &[String]) -> anyhow::Result<()> {
    if inputs.is_empty() {
        bail!("resolve needs at least one address");
    }

    for input in inputs {
        let address = CandidateAddress::parse(input)?;
        let identity = resolver.resolve(&address).await;
        println!("{}", serde_json::to_string(&identity)?);
    }
    Ok(())
}

async fn follows(
    config: &Config,
    resolver: Arc<AddressResolver>,
    trust: Arc<TrustListFetcher>,
    args: &[String],
) -> anyhow::Result<()> {
    let fid: u64 = args
        .first()
        .context("follows needs a fid")?
        .parse()
        .context("fid must be a number")?;
    let viewer = args
        .get(1)
        .map(|a| CandidateAddress::parse(a))
        .transpose()?;

    let neynar = NeynarClient::new(&config.neynar, config.neynar_api_key()?)?;
    let identities = neynar.fetch_all(fid, config.neynar.max_pages).await?;
    info!(fid = fid, follows = identities.len(), "resolving follow list");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down...");
            on_signal.cancel();
        }
    });

    let orchestrator = BatchOrchestrator::new(resolver.clone(), trust, config.batch.clone());
    let mut stream = orchestrator.stream(identities, viewer, cancel);
    let total = stream.total();

    let mut items = Vec::with_capacity(total);
    while let Some(item) = stream.next().await {
        println!("{}", serde_json::to_string(&item)?);
        items.push(item);
    }

    let summary = BatchSummary::from_items(&items, total);
    if summary.cancelled {
        warn!(yielded = summary.yielded, total = summary.total, "stopped before the end");
    }
    info!(
        members = summary.members,
        organizations = summary.excluded_organizations,
        trusted = summary.trusted,
        cache = ?resolver.cache().stats(),
        "done"
    );
    eprintln!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
