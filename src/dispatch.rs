//! Connection Dispatcher: accepts redirected connections, resolves their
//! original destination, dials it, and runs the two forwarding directions
//! to completion.
//!
//! The accept loop's retry-on-transient-error and worker-pool backpressure
//! shape follow the original tool's `Server.Run`; the per-flow lifecycle
//! (keepalive, dial timeout, half-close, dual-completion wait) follows its
//! `handleConnection`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::cache::DecisionCache;
use crate::config::{FirewallKind, RuntimeConfig};
use crate::firewall::FirewallHandle;
use crate::original_dst;
use crate::policy::MatchPolicy;
use crate::profile::ProfileHandle;
use crate::rewrite::{self, FlowContext};
use crate::stats::Stats;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

#[derive(Clone)]
pub struct Shared {
    pub cache: Arc<DecisionCache>,
    pub policy: Arc<MatchPolicy>,
    pub stats: Arc<Stats>,
    pub firewall: Option<FirewallHandle>,
    pub profile: Option<ProfileHandle>,
    pub fw_set_name: String,
    pub fw_kind: FirewallKind,
    pub buffer_size: usize,
}

impl Shared {
    pub fn from_config(cfg: &RuntimeConfig, stats: Arc<Stats>, firewall: Option<FirewallHandle>, profile: Option<ProfileHandle>) -> Self {
        Self {
            cache: Arc::new(DecisionCache::new(cfg.cache_size)),
            policy: Arc::clone(&cfg.policy),
            stats,
            firewall,
            profile,
            fw_set_name: cfg.fw_set_name.clone(),
            fw_kind: cfg.fw_type,
            buffer_size: cfg.buffer_size,
        }
    }
}

/// Runs the accept loop until `shutdown` is set. Chooses per-connection or
/// worker-pool mode based on `pool_size`.
pub async fn run(listener: TcpListener, pool_size: usize, shared: Shared, shutdown: Arc<AtomicBool>) {
    if pool_size > 0 {
        run_pooled(listener, pool_size, shared, shutdown).await;
    } else {
        run_per_connection(listener, shared, shutdown).await;
    }
}

async fn run_per_connection(listener: TcpListener, shared: Shared, shutdown: Arc<AtomicBool>) {
    log::info!("starting in per-connection mode");
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let shared = shared.clone();
                tokio::spawn(async move {
                    handle_connection(socket, peer, shared).await;
                });
            }
            Err(err) => {
                log::warn!("accept error: {err}; retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn run_pooled(listener: TcpListener, pool_size: usize, shared: Shared, shutdown: Arc<AtomicBool>) {
    log::info!("starting in worker pool mode (size: {pool_size})");
    let (tx, rx) = mpsc::channel::<(TcpStream, std::net::SocketAddr)>(pool_size);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    for worker_id in 0..pool_size {
        let rx = Arc::clone(&rx);
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                match next {
                    Some((socket, peer)) => {
                        log::debug!("worker {worker_id} processing connection from {peer}");
                        handle_connection(socket, peer, shared.clone()).await;
                    }
                    None => {
                        log::debug!("worker {worker_id} stopping");
                        return;
                    }
                }
            }
        });
    }

    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept().await {
            Ok((socket, peer)) => {
                if tx.send((socket, peer)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                log::warn!("accept error: {err}; retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn handle_connection(client: TcpStream, peer: std::net::SocketAddr, shared: Shared) {
    shared.stats.inc_active();
    let result = run_flow(client, peer, &shared).await;
    if let Err(err) = result {
        log::debug!("flow from {peer} ended with error: {err}");
    }
    shared.stats.dec_active();
}

async fn run_flow(client: TcpStream, peer: std::net::SocketAddr, shared: &Shared) -> std::io::Result<()> {
    let dest = original_dst::original_destination(&client)?;
    log::debug!("connection: {peer} -> {} (original dst)", dest);

    configure_keepalive(&client)?;

    let upstream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(dest))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
    configure_keepalive(&upstream)?;

    let (client_read, mut client_write) = client.into_split();
    let (mut upstream_read, upstream_write) = upstream.into_split();

    let ctx = FlowContext {
        dest_ip: dest.ip().to_string(),
        dest_port: dest.port(),
        cache: Arc::clone(&shared.cache),
        policy: Arc::clone(&shared.policy),
        stats: Arc::clone(&shared.stats),
        firewall: shared.firewall.clone(),
        profile: shared.profile.clone(),
        fw_set_name: shared.fw_set_name.clone(),
        fw_kind: shared.fw_kind,
        buffer_size: shared.buffer_size,
    };

    // Client -> upstream: rewriter. `rewrite::run` half-closes its own
    // upstream writer before returning.
    let forward = tokio::spawn(rewrite::run(client_read, upstream_write, ctx));

    // Upstream -> client: verbatim copy, half-closed the same way.
    let reverse = tokio::spawn(async move {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut client_write).await;
        result
    });

    let (fwd_res, rev_res) = tokio::join!(forward, reverse);
    if let Err(err) = fwd_res {
        log::debug!("forward direction task failed: {err}");
    }
    if let Err(err) = rev_res {
        log::debug!("reverse direction task failed: {err}");
    }

    Ok(())
}

/// Enables TCP keepalive with the configured idle time, via raw `setsockopt`
/// since `tokio::net::TcpStream` does not expose the keepalive-interval
/// knob directly.
fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    let enable: libc::c_int = 1;

    // SAFETY: `fd` is the stream's own live descriptor; `enable`/`idle_secs`
    // are valid, correctly-sized local values for the duration of the call.
    unsafe {
        let rc = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let idle_secs = TCP_KEEPALIVE.as_secs() as libc::c_int;
        let rc = libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPIDLE,
            &idle_secs as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keepalive_setsockopt_succeeds_on_loopback_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        assert!(configure_keepalive(&client).is_ok());
        assert!(configure_keepalive(&server).is_ok());
    }
}
