//! Firewall Set Driver: batches `(ip, port)` bypass entries and shells out
//! to `nft` or `ipset` to insert them into a named set.
//!
//! Grounded on the original tool's `AddToFirewallSet`: validate the inputs,
//! run the external command with a kill timeout, log and move on if it
//! fails. This version adds a batching/dedup layer. The original fired one
//! process per call, which does not scale once the Endpoint Profile Engine
//! can produce a steady trickle of decisions.

mod driver;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

pub use driver::{FirewallDriver, IpsetDriver, NftDriver};

use crate::config::FirewallKind;

const QUEUE_CAPACITY: usize = 10_000;
const ENQUEUE_WAIT: Duration = Duration::from_millis(50);
const MAX_BATCH_SIZE: usize = 200;
const MAX_BATCH_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub ip: String,
    pub port: u16,
    pub timeout_secs: u64,
}

struct Request {
    set_name: String,
    kind: FirewallKind,
    item: BatchItem,
}

#[derive(Clone)]
pub struct FirewallHandle {
    tx: mpsc::Sender<Request>,
}

impl FirewallHandle {
    /// Enqueues a bypass entry. Waits briefly for queue space, then drops
    /// the item with a warning rather than blocking the caller indefinitely.
    pub async fn add(&self, ip: String, port: u16, set_name: String, kind: FirewallKind, timeout_secs: u64) {
        if crate::config::validate_set_name(&set_name).is_err() {
            log::warn!("refusing to enqueue firewall item with invalid set name {set_name}");
            return;
        }
        if ip.parse::<std::net::Ipv4Addr>().is_err() {
            log::warn!("refusing to enqueue firewall item with invalid ip {ip}");
            return;
        }
        let req = Request {
            set_name,
            kind,
            item: BatchItem { ip, port, timeout_secs },
        };
        match tokio::time::timeout(ENQUEUE_WAIT, self.tx.send(req)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::warn!("firewall queue closed, dropping item"),
            Err(_) => log::warn!("firewall queue full, dropping item after {ENQUEUE_WAIT:?} wait"),
        }
    }
}

/// Spawns the consumer task and returns a cheaply-cloneable handle to feed it.
pub fn spawn(nft: NftDriver, ipset: IpsetDriver) -> (FirewallHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let join = tokio::spawn(run_consumer(rx, nft, ipset));
    (FirewallHandle { tx }, join)
}

type BatchKey = (FirewallKindTag, String);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum FirewallKindTag {
    Ipset,
    Nft,
}

async fn run_consumer(mut rx: mpsc::Receiver<Request>, nft: NftDriver, ipset: IpsetDriver) {
    let mut batches: HashMap<BatchKey, HashMap<(String, u16), BatchItem>> = HashMap::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let sleep = match deadline {
            Some(d) => tokio::time::sleep_until(d),
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::pin!(sleep);

        tokio::select! {
            maybe_req = rx.recv() => {
                match maybe_req {
                    Some(req) => {
                        let tag = match req.kind {
                            FirewallKind::Ipset => FirewallKindTag::Ipset,
                            FirewallKind::Nft => FirewallKindTag::Nft,
                        };
                        let key = (tag, req.set_name.clone());
                        let entry = batches.entry(key).or_default();
                        let dedup_key = (req.item.ip.clone(), req.item.port);
                        let is_new_batch_start = entry.is_empty() && deadline.is_none();
                        entry.insert(dedup_key, req.item);
                        if is_new_batch_start {
                            deadline = Some(Instant::now() + MAX_BATCH_WAIT);
                        }
                        let total: usize = batches.values().map(|b| b.len()).sum();
                        if total >= MAX_BATCH_SIZE {
                            flush_all(&mut batches, &nft, &ipset).await;
                            deadline = None;
                        }
                    }
                    None => {
                        flush_all(&mut batches, &nft, &ipset).await;
                        return;
                    }
                }
            }
            _ = &mut sleep, if deadline.is_some() => {
                flush_all(&mut batches, &nft, &ipset).await;
                deadline = None;
            }
        }
    }
}

async fn flush_all(
    batches: &mut HashMap<BatchKey, HashMap<(String, u16), BatchItem>>,
    nft: &NftDriver,
    ipset: &IpsetDriver,
) {
    for ((tag, set_name), items) in batches.drain() {
        if items.is_empty() {
            continue;
        }
        let items: Vec<BatchItem> = items.into_values().collect();
        let result = match tag {
            FirewallKindTag::Ipset => ipset.apply(&set_name, &items).await,
            FirewallKindTag::Nft => nft.apply(&set_name, &items).await,
        };
        match result {
            Ok(()) => log::debug!("flushed {} items into {set_name} ({tag:?})", items.len()),
            Err(err) => log::warn!("failed to flush {} items into {set_name}: {err}", items.len()),
        }
    }
}

impl std::fmt::Debug for FirewallKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallKindTag::Ipset => write!(f, "ipset"),
            FirewallKindTag::Nft => write!(f, "nft"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_last_item_per_endpoint() {
        let mut entry: HashMap<(String, u16), BatchItem> = HashMap::new();
        entry.insert(
            ("1.2.3.4".to_string(), 80),
            BatchItem { ip: "1.2.3.4".into(), port: 80, timeout_secs: 600 },
        );
        entry.insert(
            ("1.2.3.4".to_string(), 80),
            BatchItem { ip: "1.2.3.4".into(), port: 80, timeout_secs: 86400 },
        );
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.values().next().unwrap().timeout_secs, 86400);
    }
}
