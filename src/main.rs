use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use feedsync::config::Config;
use feedsync::refresh::{
    run_consumer, run_scheduler, BatchHandler, Dispatcher, MemoryQueue, Notifier, QueueTransport,
    RefreshWorker,
};
use feedsync::storage::{Database, DatabaseError};
use feedsync::stream::{HttpMetrics, MergeEngine, MetricsSource, NoMetrics, ReadCache};
use feedsync::util::validate_url;
use feedsync::web::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "feedsync", about = "Feed sync and merged activity stream service")]
struct Args {
    /// TOML config file (FEEDSYNC_* environment variables override it)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API, queue consumers and optional scheduler
    Serve,
    /// Refresh every stale feed once and print a summary
    Refresh,
    /// Register a feed
    Subscribe {
        url: String,
        title: String,
        #[arg(long)]
        media_type: Option<String>,
    },
}

struct Services {
    db: Database,
    cache: Arc<ReadCache>,
    dispatcher: Arc<Dispatcher>,
    engine: MergeEngine,
}

async fn open_database(config: &Config) -> Result<Database> {
    match Database::open(&config.database_path).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!(
                "Database '{}' is locked by another process",
                config.database_path
            )
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")
}

async fn build_services(config: &Config) -> Result<Services> {
    let db = open_database(config).await?;
    let client = http_client()?;
    let cache = Arc::new(ReadCache::new(config.cache_capacity, config.cache_ttl()));

    let worker = RefreshWorker::new(db.clone(), client.clone(), config.refresh_settings());
    let notifier = config
        .notify_url
        .as_ref()
        .map(|url| Notifier::new(client.clone(), url.clone()));
    let dispatcher = Arc::new(
        Dispatcher::new(db.clone(), worker, cache.clone())
            .with_notifier(notifier)
            .allow_private_networks(config.allow_private_networks),
    );

    let metrics: Arc<dyn MetricsSource> = match &config.metrics_url {
        Some(url) => Arc::new(HttpMetrics::new(client, url.clone(), config.metrics_token())),
        None => Arc::new(NoMetrics),
    };
    let engine = MergeEngine::new(db.clone(), metrics);

    Ok(Services {
        db,
        cache,
        dispatcher,
        engine,
    })
}

async fn serve(config: Config) -> Result<()> {
    let services = build_services(&config).await?;
    let queue = Arc::new(MemoryQueue::new(
        config.queue_capacity,
        config.max_deliveries,
        config.redelivery_delay(),
    ));
    let transport: Arc<dyn QueueTransport> = queue.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    let handler: Arc<dyn BatchHandler> = services.dispatcher.clone();
    for _ in 0..config.queue_workers.max(1) {
        tasks.push(tokio::spawn(run_consumer(
            transport.clone(),
            handler.clone(),
            shutdown_rx.clone(),
        )));
    }
    if let Some(interval) = config.schedule_interval() {
        tasks.push(tokio::spawn(run_scheduler(
            services.db.clone(),
            transport.clone(),
            interval,
            Duration::from_secs(config.freshness_window_secs),
            shutdown_rx.clone(),
        )));
    }

    let state = Arc::new(AppState::new(
        services.db,
        services.engine,
        services.cache,
        services.dispatcher,
        transport,
    ));
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!(
        addr = %config.bind_addr,
        workers = config.queue_workers.max(1),
        "Serving"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    queue.close();
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task panicked");
        }
    }
    Ok(())
}

async fn refresh_once(config: Config) -> Result<()> {
    let services = build_services(&config).await?;
    let report = services
        .dispatcher
        .refresh_stale()
        .await
        .context("Refresh failed")?;

    for feed in &report.feeds {
        match &feed.result {
            Ok(outcome) if outcome.refreshed() => {
                println!("  {} ({}): {} new", feed.title, feed.feed_id, outcome.new_entries())
            }
            Ok(_) => {}
            Err(e) => println!("  {} ({}): failed: {}", feed.title, feed.feed_id, e),
        }
    }
    println!(
        "Refreshed {} feeds: {} new entries, {} failures",
        report.refreshed_feed_ids().len(),
        report.new_entries(),
        report.failures()
    );
    Ok(())
}

async fn subscribe(config: Config, url: &str, title: &str, media_type: Option<&str>) -> Result<()> {
    let url = validate_url(url, config.allow_private_networks)
        .with_context(|| format!("Invalid feed URL: {url}"))?;
    let title = title.trim();
    if title.is_empty() {
        anyhow::bail!("Feed title must not be empty");
    }

    let db = open_database(&config).await?;
    let id = db
        .register_feed(url.as_str(), title, media_type)
        .await
        .context("Failed to register feed")?;
    println!("Subscribed {} as feed {}", url, id);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load_with_env(args.config.as_deref()).context("Failed to load config")?;
    tracing::debug!(?config, "Configuration");

    match args.command {
        Command::Serve => serve(config).await,
        Command::Refresh => refresh_once(config).await,
        Command::Subscribe {
            url,
            title,
            media_type,
        } => subscribe(config, &url, &title, media_type.as_deref()).await,
    }
}
