//! sitecache - operator front end for the scoped site cache.
//!
//! Runs the startup repair pass, inspects persisted snapshots, performs a
//! one-off refresh, or keeps the refresh loop running until interrupted.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sitecache_core::{
    ApiClient, Collection, Config, CurrentUser, FileBackend, LocalStore, ScopeId, SiteCache,
    SiteCacheOptions,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

const ENV_API_URL: &str = "SITECACHE_API_URL";
const ENV_TOKEN: &str = "SITECACHE_TOKEN";
const ENV_USER: &str = "SITECACHE_USER";
const ENV_COMPANY: &str = "SITECACHE_COMPANY";
const ENV_SITE: &str = "SITECACHE_SITE";
const ENV_LOG_DIR: &str = "SITECACHE_LOG_DIR";

/// Log file name inside `SITECACHE_LOG_DIR` (rotated daily)
const LOG_FILE: &str = "sitecache.log";

const USAGE: &str = "Usage: sitecache <repair|status|sync|watch>";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=sitecache_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let command = std::env::args().nth(1);
    let mut config = Config::load().context("Failed to load config")?;
    if let Some(url) = env_opt(ENV_API_URL) {
        config.api_base_url = url;
    }
    if let Some(company) = env_opt(ENV_COMPANY) {
        config.last_company_id = Some(company);
    }
    if let Some(site) = env_opt(ENV_SITE) {
        config.last_site_id = Some(site);
    }

    let data_dir = config.data_dir()?;
    let backend = FileBackend::new(data_dir.clone())?;
    let local = LocalStore::new(Arc::new(backend));
    info!(data_dir = %data_dir.display(), "sitecache starting");

    match command.as_deref() {
        Some("repair") => repair(&local),
        Some("status") => status(&config, local).await,
        Some("sync") => sync(&config, local).await,
        Some("watch") => watch(&config, local).await,
        _ => bail!(USAGE),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn repair(local: &LocalStore) -> Result<()> {
    let report = sitecache_core::repair::run(local);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn status(config: &Config, local: LocalStore) -> Result<()> {
    let cache = open(config, local, false).await?;
    let scope = cache.scope();
    println!(
        "company: {}  site: {}",
        display_id(scope.company_id.as_ref()),
        display_id(scope.site_id.as_ref())
    );
    for collection in Collection::ALL {
        let state = cache.collection_state(collection).await;
        println!(
            "{:<20} {:>6}  {}",
            collection.name(),
            state.records.len(),
            state.age_display()
        );
    }
    Ok(())
}

async fn sync(config: &Config, local: LocalStore) -> Result<()> {
    let cache = open(config, local, true).await?;
    let summary = cache.refresh_all().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    config.save()?;
    Ok(())
}

async fn watch(config: &Config, local: LocalStore) -> Result<()> {
    let cache = open(config, local, true).await?;
    cache.start();
    eprintln!("Refreshing every {}s, Ctrl-C to stop", config.refresh_interval().as_secs());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    cache.shutdown();
    config.save()?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Build the cache for the configured scope, signing in from the environment
/// when `needs_session` is set.
async fn open(config: &Config, local: LocalStore, needs_session: bool) -> Result<SiteCache> {
    let remote = ApiClient::new(config.api_base_url.clone())?;
    let cache = SiteCache::new(Arc::new(remote), local, SiteCacheOptions::from(config));

    if needs_session {
        let Some(token) = env_opt(ENV_TOKEN) else {
            bail!("{} is not set", ENV_TOKEN);
        };
        cache
            .begin_session(CurrentUser {
                user_id: env_opt(ENV_USER).unwrap_or_default(),
                role: String::new(),
                bearer_token: token,
            })
            .await;
    }

    if let Some(company) = config.last_company_id.as_deref() {
        cache.set_company(Some(ScopeId::new(company))).await;
    }
    if let Some(site) = config.last_site_id.as_deref() {
        cache.set_site(Some(ScopeId::new(site))).await;
    }
    Ok(cache)
}

fn display_id(id: Option<&ScopeId>) -> String {
    match id {
        Some(id) if id.is_remote_valid() => id.to_string(),
        Some(id) => format!("{} (local only)", id),
        None => "-".to_string(),
    }
}
