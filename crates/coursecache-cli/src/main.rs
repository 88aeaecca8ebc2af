//! coursecache - command-line front end for an offline-capable Moodle client.
//!
//! Logs in, runs cached web service reads, sends messages (queueing them when
//! offline) and drains the offline queue on demand.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coursecache_core::api::{HttpTransport, TypeExpected};
use coursecache_core::auth::CredentialStore;
use coursecache_core::config::{Config, SiteEntry};
use coursecache_core::modules::{assign, messages};
use coursecache_core::sync::{spawn_cron, spawn_reconnect_sync};
use coursecache_core::{
    ConnectionType, EventBus, NetworkMonitor, NetworkState, ReadOptions, SendOutcome, SiteSession, SitesManager,
    SyncState, SyncTrigger,
};

// ============================================================================
// Constants
// ============================================================================

/// Log file prefix; one file per day under the cache dir.
const LOG_FILE_NAME: &str = "coursecache.log";

const USAGE: &str = "Usage: coursecache [--offline] <command>

Commands:
  login <site-url> [username]     Log in and remember the site
  logout                          Forget the current site's credentials
  call <function> [json] [--refresh]
                                  Cached web service read, printed as JSON
  send-message <user-id> <text>   Send a message, queued when offline
  pending                         List actions waiting to sync
  sync                            Replay pending actions now
  watch                           Keep syncing on the configured interval
                                  and whenever the connection returns";

/// Initialize the tracing subscriber for logging
///
/// Logs go to stderr and to a daily file. Use RUST_LOG to control the level
/// (e.g., RUST_LOG=coursecache_core=debug).
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match Config::cache_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), LOG_FILE_NAME);
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

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let offline_flag = take_flag(&mut args, "--offline");
    let Some(command) = args.first().cloned() else {
        println!("{}", USAGE);
        return Ok(());
    };
    let rest = &args[1..];

    let mut config = Config::load().context("Failed to load config")?;
    let offline = offline_flag || config.offline_mode;
    let network = NetworkMonitor::new(if offline {
        NetworkState::offline()
    } else {
        NetworkState::online(ConnectionType::Unknown)
    });
    let manager = SitesManager::new(
        Arc::new(HttpTransport::new()?),
        network,
        EventBus::new(),
        Arc::new(CredentialStore),
        Some(Config::sites_dir()?),
    );
    info!(command = %command, offline, "coursecache starting");

    match command.as_str() {
        "login" => login(&manager, &mut config, rest).await,
        "logout" => logout(&manager, &mut config),
        "call" => {
            let site = current_site(&manager, &config)?;
            call(&site, rest).await
        }
        "send-message" => {
            let site = current_site(&manager, &config)?;
            send_message(&site, rest).await
        }
        "pending" => {
            let site = current_site(&manager, &config)?;
            pending(&site)
        }
        "sync" => {
            let site = current_site(&manager, &config)?;
            sync(&site).await
        }
        "watch" => {
            let site = current_site(&manager, &config)?;
            watch(site, config.sync_interval()).await
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn current_site(manager: &SitesManager, config: &Config) -> Result<Arc<SiteSession>> {
    let entry = config
        .current()
        .ok_or_else(|| anyhow!("Not logged in. Run `coursecache login <site-url>` first."))?;
    manager
        .restore(&entry.site_id)
        .with_context(|| format!("Failed to restore session for {}", entry.site_url))
}

async fn login(manager: &SitesManager, config: &mut Config, args: &[String]) -> Result<()> {
    let site_url = args
        .first()
        .ok_or_else(|| anyhow!("login needs a site URL"))?;
    let username = match args.get(1) {
        Some(name) => name.clone(),
        None => match config.last_username.clone() {
            Some(last) => {
                let entered = prompt(&format!("Username [{}]: ", last))?;
                if entered.is_empty() {
                    last
                } else {
                    entered
                }
            }
            None => prompt("Username: ")?,
        },
    };
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;

    let site = manager.login(site_url, &username, &password).await?;
    config.remember_site(SiteEntry {
        site_id: site.site_id().to_string(),
        site_url: site.data().site_url.clone(),
        username: username.clone(),
    });
    config.save().context("Failed to save config")?;

    println!(
        "Logged in to {} as {}",
        site.data().site_name.as_deref().unwrap_or(site_url),
        site.data().full_name.as_deref().unwrap_or(&username)
    );
    Ok(())
}

fn logout(manager: &SitesManager, config: &mut Config) -> Result<()> {
    let entry = config
        .current()
        .cloned()
        .ok_or_else(|| anyhow!("Not logged in"))?;
    manager.logout(&entry.site_id)?;
    config.forget_site(&entry.site_id);
    config.save().context("Failed to save config")?;
    println!("Logged out of {}", entry.site_url);
    Ok(())
}

async fn call(site: &SiteSession, args: &[String]) -> Result<()> {
    let mut args = args.to_vec();
    let refresh = take_flag(&mut args, "--refresh");
    let function = args
        .first()
        .ok_or_else(|| anyhow!("call needs a function name"))?;
    let params: Value = match args.get(1) {
        Some(raw) => serde_json::from_str(raw).context("Parameters must be a JSON object")?,
        None => Value::Object(Default::default()),
    };

    let options = if refresh {
        ReadOptions::refresh()
    } else {
        ReadOptions::default()
    };
    let data = site
        .read_with(function, params, &options, site.presets_expecting(TypeExpected::Any))
        .await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn send_message(site: &SiteSession, args: &[String]) -> Result<()> {
    let user_id: i64 = args
        .first()
        .ok_or_else(|| anyhow!("send-message needs a user id"))?
        .parse()
        .context("User id must be a number")?;
    let text = args[1..].join(" ");
    if text.is_empty() {
        bail!("send-message needs some text");
    }

    match messages::send_message(site, user_id, &text).await? {
        SendOutcome::Sent(_) => println!("Sent"),
        SendOutcome::Queued(action) => println!("Queued for sync ({})", action.id),
    }
    Ok(())
}

fn pending(site: &SiteSession) -> Result<()> {
    let mut total = 0;
    for component in [messages::COMPONENT, assign::COMPONENT] {
        for action in site.offline().pending(component) {
            total += 1;
            println!(
                "{:<16} {:<12} {:<8} {}  {}",
                action.id,
                action.component,
                action.entity_id,
                action.created_at.format("%Y-%m-%d %H:%M"),
                action.payload
            );
        }
    }
    if total == 0 {
        println!("Nothing pending");
    }
    Ok(())
}

async fn sync(site: &SiteSession) -> Result<()> {
    if !site.network().is_online() {
        bail!("Cannot sync while offline");
    }
    for report in site.sync_all(SyncTrigger::UserRefresh).await {
        let state = match report.state {
            SyncState::Success => "ok",
            SyncState::PartialFailure => "partial",
            SyncState::Idle | SyncState::Syncing => "skipped",
        };
        println!(
            "{}: {} synced, {} remaining ({})",
            report.kind, report.synced, report.remaining, state
        );
        for warning in &report.warnings {
            println!("  dropped {} for {}: {}", warning.action_id, warning.entity, warning.error);
        }
    }
    Ok(())
}

async fn watch(site: Arc<SiteSession>, every: Duration) -> Result<()> {
    println!(
        "Syncing every {} min and on reconnect; Ctrl-C to stop",
        every.as_secs() / 60
    );
    // Both tasks hold the session weakly; `site` keeps it alive until the cron ends.
    let reconnect = spawn_reconnect_sync(site.clone());
    let cron = spawn_cron(site.clone(), every);
    let result = cron.await;
    reconnect.abort();
    drop(site);
    result.context("Scheduled sync task failed")
}
