//! # uamaskd
//!
//! Transparent TCP interception proxy. Sits behind a firewall REDIRECT rule,
//! recovers each connection's original destination, and rewrites the
//! `User-Agent` header of plaintext HTTP requests that pass through it while
//! relaying every other byte stream untouched.
//!
//! ## Architecture
//!
//! - [`dispatch`]: accepts redirected connections and runs each flow's two
//!   forwarding directions.
//! - [`rewrite`]: per-flow HTTP classification, parsing, and header rewrite.
//! - [`policy`]: the configured replace/keep decision function.
//! - [`cache`]: bounded LRU memoizing that decision per observed UA string.
//! - [`profile`]: scores non-HTTP endpoints and debounces firewall bypass
//!   decisions, vetoed by HTTP traffic to the same endpoint.
//! - [`firewall`]: batches and applies those decisions via `nft`/`ipset`.
//! - [`stats`]: atomic counters snapshotted to a text file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

mod cache;
mod config;
mod dispatch;
mod error;
mod firewall;
mod original_dst;
mod policy;
mod profile;
mod rewrite;
mod stats;

use config::RawArgs;

fn init_logging(level: &str) {
    let filter = match level.to_ascii_lowercase().as_str() {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = RawArgs::parse();
    init_logging(&args.log_level);

    let pool_size = args.pool_size;
    let bind_port = args.port;
    let stats_interval = Duration::from_secs(5);

    let cfg = args
        .into_runtime_config()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    cfg.log_summary();

    let stats = stats::Stats::new();
    stats::spawn_writer(Arc::clone(&stats), cfg.stats_path.clone(), stats_interval);

    let mut firewall_join = None;
    let mut profile_join = None;

    let firewall = if cfg.fw_bypass {
        let (handle, join) = firewall::spawn(firewall::NftDriver::default(), firewall::IpsetDriver);
        firewall_join = Some(join);
        Some(handle)
    } else {
        None
    };

    let profile = if cfg.fw_bypass {
        firewall.clone().map(|fw_handle| {
            let (handle, join) = profile::spawn(
                profile::ProfileEngineConfig {
                    threshold: cfg.fw_nonhttp_threshold,
                    decision_delay: Duration::from_secs(cfg.fw_decision_delay_secs),
                    http_cooldown: Duration::from_secs(cfg.fw_http_cooldown_secs),
                    firewall_timeout_secs: cfg.fw_timeout_secs,
                    fw_set_name: cfg.fw_set_name.clone(),
                    fw_kind: cfg.fw_type,
                },
                fw_handle,
            );
            profile_join = Some(join);
            handle
        })
    } else {
        None
    };

    let shared = dispatch::Shared::from_config(&cfg, Arc::clone(&stats), firewall, profile);

    let listener = TcpListener::bind(("0.0.0.0", bind_port)).await?;
    log::info!("listening on 0.0.0.0:{bind_port}");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            log::info!("SIGINT received, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    dispatch::run(listener, pool_size, shared, shutdown).await;

    // The accept loop has stopped; in-flight connections still hold their
    // own handle clones and keep the firewall driver and profile engine fed
    // until they finish, at which point each consumer's channel closes and
    // it flushes before returning. Give that drain a bounded window rather
    // than hanging shutdown on a stuck flow.
    let drain_window = Duration::from_secs(10);
    if let Some(join) = firewall_join {
        if tokio::time::timeout(drain_window, join).await.is_err() {
            log::warn!("firewall driver did not drain within {drain_window:?}");
        }
    }
    if let Some(join) = profile_join {
        if tokio::time::timeout(drain_window, join).await.is_err() {
            log::warn!("endpoint profile engine did not drain within {drain_window:?}");
        }
    }

    Ok(())
}
