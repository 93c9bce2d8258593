//! # tether
//!
//! Command-line client for the connection layer: opens a pooled WebSocket
//! connection, sends one correlated request and prints the response.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tether_core::{EndpointKey, Envelope, RequestId};
use tether_pool::{
    CloseReason, ConnectionPool, ConnectionState, ConnectionStatus, PoolConfig, WsConnector,
};
use tether_rpc::{ListenerOptions, PoolChannel, RequestCorrelator};
use tether_settings::TetherSettings;
use tokio::sync::watch;
use tracing::info;

/// Tether command-line client.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Talk to an endpoint through the tether connection layer")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one request and print the response.
    Request {
        /// Endpoint URL, e.g. `ws://localhost:8765`.
        endpoint: String,

        /// Message kind to send.
        #[arg(long, default_value = "ping")]
        status: String,

        /// JSON object merged into the request body.
        #[arg(long)]
        body: Option<String>,

        /// Prefix for the generated request id.
        #[arg(long, default_value = "cli")]
        prefix: String,

        /// Response timeout (overrides settings).
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Connect and print a pool stats snapshot.
    Stats {
        /// Endpoint URL.
        endpoint: String,
    },
}

fn load_settings(cli: &Cli) -> Result<TetherSettings> {
    let path = cli
        .settings
        .clone()
        .unwrap_or_else(tether_settings::settings_path);
    let mut settings = tether_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    if let Some(level) = &cli.log_level {
        settings.logging.level.clone_from(level);
    }
    Ok(settings)
}

/// Envelope keys owned by `--status` and `--prefix`, not by `--body`.
const RESERVED_BODY_KEYS: [(&str, &str); 2] = [("status", "--status"), ("requestId", "--prefix")];

/// Build the request envelope from the command-line pieces.
fn build_request(status: &str, body: Option<&str>, prefix: &str) -> Result<Envelope> {
    let mut envelope = Envelope::new(status).with_request_id(RequestId::with_prefix(prefix));
    if let Some(body) = body {
        let fields: Map<String, Value> =
            serde_json::from_str(body).context("--body must be a JSON object")?;
        for (key, flag) in RESERVED_BODY_KEYS {
            if fields.contains_key(key) {
                bail!("--body may not set `{key}`; use {flag}");
            }
        }
        envelope.body.extend(fields);
    }
    Ok(envelope)
}

fn is_terminal(status: &ConnectionStatus) -> bool {
    matches!(
        status.state,
        ConnectionState::Closed(CloseReason::Exhausted | CloseReason::LimitReached)
    )
}

/// Wait until `key` is open, failing on timeout or a terminal status.
async fn wait_for_open(pool: &ConnectionPool, key: &EndpointKey, timeout: Duration) -> Result<()> {
    let (tx, mut rx) = watch::channel(pool.status(key));
    let _watch = pool.subscribe_to_status(key, move |status| {
        let _ = tx.send_replace(status.clone());
    });

    let waited = tokio::time::timeout(
        timeout,
        rx.wait_for(|status| status.connected || is_terminal(status)),
    )
    .await;
    match waited {
        Ok(Ok(status)) if status.connected => {
            info!(key = %key, "connected");
            Ok(())
        }
        Ok(Ok(status)) => bail!("{key}: {}", status.label()),
        Ok(Err(_)) => bail!("{key}: status stream closed"),
        Err(_) => bail!(
            "{key}: not connected after {}ms ({})",
            timeout.as_millis(),
            pool.status(key).label()
        ),
    }
}

async fn send_request(
    settings: &TetherSettings,
    endpoint: &str,
    request: Envelope,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let key = EndpointKey::new(endpoint);
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(settings.correlator.request_timeout_ms));
    let pool = ConnectionPool::new(WsConnector::new(), PoolConfig::from_settings(&settings.pool));
    let correlator = RequestCorrelator::from_settings(&settings.correlator);
    let route = correlator.attach(&pool, &key);

    wait_for_open(&pool, &key, timeout).await?;
    let channel = PoolChannel::new(pool.clone(), key.clone());
    let response = correlator
        .request(&channel, request, ListenerOptions::new().timeout(timeout))
        .await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    route.unsubscribe();
    pool.shutdown();

    if let Some(reason) = response.error_message() {
        bail!("request failed: {reason}");
    }
    Ok(())
}

async fn stats(settings: &TetherSettings, endpoint: &str) -> Result<()> {
    let key = EndpointKey::new(endpoint);
    let pool = ConnectionPool::new(WsConnector::new(), PoolConfig::from_settings(&settings.pool));
    let sub = pool.subscribe(&key, |_| {});
    let timeout = Duration::from_millis(settings.correlator.request_timeout_ms);
    let connected = wait_for_open(&pool, &key, timeout).await;

    println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    sub.unsubscribe();
    pool.shutdown();
    connected
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    tether_logging::init_from_settings(&settings.logging);

    match cli.command {
        Command::Request {
            endpoint,
            status,
            body,
            prefix,
            timeout_ms,
        } => {
            let request = build_request(&status, body.as_deref(), &prefix)?;
            send_request(&settings, &endpoint, request, timeout_ms).await
        }
        Command::Stats { endpoint } => stats(&settings, &endpoint).await,
    }
}
