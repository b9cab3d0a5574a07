//! Endpoint Profile Engine: scores `(ip, port)` endpoints by how much
//! non-HTTP traffic they carry, vetoed by any HTTP traffic observed to the
//! same endpoint, and emits a debounced firewall bypass decision once the
//! score clears a threshold and stays quiet for a delay window.
//!
//! The profile map has exactly one writer: this module's consumer task.
//! Callers only ever push events into two channels; the map itself is never
//! shared, so no lock discipline leaks out to the rest of the crate.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::firewall::FirewallHandle;
use crate::config::FirewallKind;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub type Endpoint = (String, u16);

pub struct ProfileEngineConfig {
    pub threshold: u32,
    pub decision_delay: Duration,
    pub http_cooldown: Duration,
    pub firewall_timeout_secs: u64,
    pub fw_set_name: String,
    pub fw_kind: FirewallKind,
}

#[derive(Clone)]
pub struct ProfileHandle {
    http_tx: mpsc::Sender<Endpoint>,
    non_http_tx: mpsc::Sender<Endpoint>,
}

impl ProfileHandle {
    pub fn report_http(&self, endpoint: Endpoint) {
        let _ = self.http_tx.try_send(endpoint);
    }

    pub fn report_non_http(&self, endpoint: Endpoint) {
        let _ = self.non_http_tx.try_send(endpoint);
    }
}

struct Profile {
    non_http_score: u32,
    http_lock_until: Option<Instant>,
    last_event: Instant,
    pending_fire_at: Option<Instant>,
}

impl Profile {
    fn fresh(now: Instant) -> Self {
        Self {
            non_http_score: 0,
            http_lock_until: None,
            last_event: now,
            pending_fire_at: None,
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        matches!(self.http_lock_until, Some(until) if now < until)
    }
}

/// Spawns the single-consumer profile engine task.
pub fn spawn(cfg: ProfileEngineConfig, firewall: FirewallHandle) -> (ProfileHandle, tokio::task::JoinHandle<()>) {
    let (http_tx, http_rx) = mpsc::channel(4096);
    let (non_http_tx, non_http_rx) = mpsc::channel(4096);
    let join = tokio::spawn(run_consumer(cfg, firewall, http_rx, non_http_rx));
    (ProfileHandle { http_tx, non_http_tx }, join)
}

async fn run_consumer(
    cfg: ProfileEngineConfig,
    firewall: FirewallHandle,
    mut http_rx: mpsc::Receiver<Endpoint>,
    mut non_http_rx: mpsc::Receiver<Endpoint>,
) {
    let mut profiles: HashMap<Endpoint, Profile> = HashMap::new();
    let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

    loop {
        let next_deadline = earliest_pending(&profiles);
        let fire_sleep = match next_deadline {
            Some(d) => tokio::time::sleep_until(d),
            None => tokio::time::sleep(Duration::from_secs(3600)),
        };
        tokio::pin!(fire_sleep);

        tokio::select! {
            maybe = http_rx.recv() => {
                match maybe {
                    Some(endpoint) => on_http_event(&mut profiles, endpoint, &cfg),
                    None => return,
                }
            }
            maybe = non_http_rx.recv() => {
                match maybe {
                    Some(endpoint) => on_non_http_event(&mut profiles, endpoint, &cfg),
                    None => return,
                }
            }
            _ = &mut fire_sleep, if next_deadline.is_some() => {
                fire_due(&mut profiles, &cfg, &firewall).await;
            }
            _ = cleanup.tick() => {
                cleanup_idle(&mut profiles);
            }
        }
    }
}

fn earliest_pending(profiles: &HashMap<Endpoint, Profile>) -> Option<Instant> {
    profiles.values().filter_map(|p| p.pending_fire_at).min()
}

fn on_http_event(profiles: &mut HashMap<Endpoint, Profile>, endpoint: Endpoint, cfg: &ProfileEngineConfig) {
    let now = Instant::now();
    let profile = profiles.entry(endpoint).or_insert_with(|| Profile::fresh(now));
    if profile.in_cooldown(now) {
        return;
    }
    profile.non_http_score = 0;
    profile.http_lock_until = Some(now + cfg.http_cooldown);
    profile.pending_fire_at = None;
    profile.last_event = now;
}

fn on_non_http_event(profiles: &mut HashMap<Endpoint, Profile>, endpoint: Endpoint, cfg: &ProfileEngineConfig) {
    let now = Instant::now();
    let profile = profiles.entry(endpoint).or_insert_with(|| Profile::fresh(now));
    if profile.in_cooldown(now) {
        return;
    }
    profile.non_http_score += 1;
    profile.last_event = now;
    if profile.non_http_score >= cfg.threshold {
        profile.pending_fire_at = Some(now + cfg.decision_delay);
    }
}

async fn fire_due(profiles: &mut HashMap<Endpoint, Profile>, cfg: &ProfileEngineConfig, firewall: &FirewallHandle) {
    let now = Instant::now();
    let due: Vec<Endpoint> = profiles
        .iter()
        .filter(|(_, p)| matches!(p.pending_fire_at, Some(t) if t <= now))
        .map(|(ep, _)| ep.clone())
        .collect();

    for endpoint in due {
        let Some(profile) = profiles.get_mut(&endpoint) else { continue };
        let guards_hold = profile.non_http_score >= cfg.threshold && !profile.in_cooldown(now);
        if guards_hold {
            profiles.remove(&endpoint);
            let (ip, port) = endpoint;
            firewall
                .add(ip, port, cfg.fw_set_name.clone(), cfg.fw_kind, cfg.firewall_timeout_secs)
                .await;
        } else {
            profile.pending_fire_at = None;
        }
    }
}

fn cleanup_idle(profiles: &mut HashMap<Endpoint, Profile>) {
    let now = Instant::now();
    profiles.retain(|_, p| {
        p.pending_fire_at.is_some() || now.duration_since(p.last_event) <= CLEANUP_INTERVAL
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProfileEngineConfig {
        ProfileEngineConfig {
            threshold: 3,
            decision_delay: Duration::from_millis(10),
            http_cooldown: Duration::from_secs(60),
            firewall_timeout_secs: 600,
            fw_set_name: "bypass".into(),
            fw_kind: FirewallKind::Ipset,
        }
    }

    #[test]
    fn non_http_events_accrue_and_arm_at_threshold() {
        let mut profiles = HashMap::new();
        let cfg = cfg();
        let ep = ("1.1.1.1".to_string(), 80);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        assert!(profiles[&ep].pending_fire_at.is_none());
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        assert!(profiles[&ep].pending_fire_at.is_some());
    }

    #[test]
    fn http_event_vetoes_and_resets_score() {
        let mut profiles = HashMap::new();
        let cfg = cfg();
        let ep = ("1.1.1.1".to_string(), 80);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        assert!(profiles[&ep].pending_fire_at.is_some());

        on_http_event(&mut profiles, ep.clone(), &cfg);
        assert_eq!(profiles[&ep].non_http_score, 0);
        assert!(profiles[&ep].pending_fire_at.is_none());
        assert!(profiles[&ep].in_cooldown(Instant::now()));
    }

    #[test]
    fn events_during_cooldown_are_ignored() {
        let mut profiles = HashMap::new();
        let cfg = cfg();
        let ep = ("1.1.1.1".to_string(), 80);
        on_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        assert_eq!(profiles[&ep].non_http_score, 0);
    }

    #[test]
    fn repeated_non_http_events_rearm_the_timer() {
        let mut profiles = HashMap::new();
        let cfg = cfg();
        let ep = ("1.1.1.1".to_string(), 80);
        for _ in 0..3 {
            on_non_http_event(&mut profiles, ep.clone(), &cfg);
        }
        let first_deadline = profiles[&ep].pending_fire_at.unwrap();
        on_non_http_event(&mut profiles, ep.clone(), &cfg);
        let second_deadline = profiles[&ep].pending_fire_at.unwrap();
        assert!(second_deadline >= first_deadline);
        assert_eq!(profiles[&ep].non_http_score, 4);
    }
}
