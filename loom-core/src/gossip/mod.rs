//! Periodic push gossip over the RPC transport.
//!
//! State machine per tick: build digest, pick targets, send in parallel.
//! The tick interval adapts to observed send load between the configured
//! min and max, clamped to ±20% per adjustment step.

pub mod wire;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::directory::NodeDirectory;
use crate::pool::ConnectionPool;
use crate::types::{unix_ms, GossipFrame, NodeInfo, NodeInfoWire, Role, GOSSIP_SCHEMA};

/// Max digest entries per message, self included.
const DIGEST_CAP: usize = 50;
/// Consecutive send failures to one peer before its liveness clock is
/// pinned.
const FREEZE_AFTER_FAILURES: u32 = 3;
/// Consecutive all-target-failed ticks before signalling that the local
/// interface selection should be rerun.
const SELF_FAILURE_TICKS: u32 = 3;
/// Window for (sender, nonce) duplicate suppression.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);
/// Shutdown bound for the in-flight send fan-out.
const SHUTDOWN_SEND_BOUND: Duration = Duration::from_secs(5);

const ADJUST_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct GossipConfig {
    pub interval_min: Duration,
    pub interval_max: Duration,
    pub max_targets: usize,
    pub compression_threshold: usize,
}

/// Out-of-band notifications for the node wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipSignal {
    /// Every pick-targets round failed several ticks in a row; the local
    /// interface may be gone.
    SustainedSendFailure,
}

pub struct Gossip {
    directory: Arc<NodeDirectory>,
    pool: Arc<ConnectionPool>,
    config: GossipConfig,
    self_role: Role,

    interval_secs: Mutex<f64>,
    sent_count: AtomicU64,
    last_adjust: Mutex<Instant>,

    recent_frames: DashMap<(String, String), Instant>,
    send_failures: DashMap<String, u32>,
    all_fail_ticks: AtomicU32,

    signals: mpsc::Sender<GossipSignal>,
}

impl Gossip {
    pub fn new(
        directory: Arc<NodeDirectory>,
        pool: Arc<ConnectionPool>,
        config: GossipConfig,
        signals: mpsc::Sender<GossipSignal>,
    ) -> Arc<Self> {
        let self_role = directory.self_info().role;
        Arc::new(Self {
            directory,
            pool,
            config,
            self_role,
            interval_secs: Mutex::new(config.interval_min.as_secs_f64()),
            sent_count: AtomicU64::new(0),
            last_adjust: Mutex::new(Instant::now()),
            recent_frames: DashMap::new(),
            send_failures: DashMap::new(),
            all_fail_ticks: AtomicU32::new(0),
            signals,
        })
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_secs_f64(*self.interval_secs.lock())
    }

    /// Tick loop. Waits for the TLS transport before the first send;
    /// inbound frames are processed independently via [`Gossip::handle_frame`].
    pub async fn run(
        self: Arc<Self>,
        mut transport_ready: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while !*transport_ready.borrow() {
            tokio::select! {
                changed = transport_ready.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        info!("Gossip loop started ({:?} base interval)", self.current_interval());

        loop {
            self.adjust_interval();

            let interval = self.current_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Gossip loop exiting");
                        return;
                    }
                }
            }

            self.directory.touch_self(unix_ms());

            let targets = self.pick_targets();
            if targets.is_empty() {
                continue;
            }

            let digest = self.build_digest();
            let frame = GossipFrame {
                from: self.directory.self_id().to_string(),
                nonce: crate::ca::random_token(),
                entries: digest,
            };
            let body = match wire::encode_frame(&frame, self.config.compression_threshold) {
                Ok(body) => body,
                Err(e) => {
                    debug!("Gossip encode failed: {e:#}");
                    continue;
                }
            };

            let fan_out = futures::future::join_all(
                targets
                    .iter()
                    .map(|target| self.send_to(target, body.clone())),
            );
            tokio::pin!(fan_out);

            // A shutdown arriving mid-fan-out bounds the remaining sends.
            let results = tokio::select! {
                results = &mut fan_out => results,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = tokio::time::timeout(SHUTDOWN_SEND_BOUND, fan_out).await;
                        info!("Gossip loop exiting after bounded final fan-out");
                        return;
                    }
                    continue;
                }
            };

            self.sent_count
                .fetch_add(targets.len() as u64, Ordering::Relaxed);

            let failed = results.iter().filter(|ok| !**ok).count();
            if failed == targets.len() {
                let ticks = self.all_fail_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                if ticks == SELF_FAILURE_TICKS {
                    let _ = self.signals.try_send(GossipSignal::SustainedSendFailure);
                    self.all_fail_ticks.store(0, Ordering::Relaxed);
                }
            } else {
                self.all_fail_ticks.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Sweep loop: status decay and eviction, every T_min.
    pub async fn run_sweeper(
        directory: Arc<NodeDirectory>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => directory.sweep(unix_ms()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Digest: self first (authoritative), then peers newest-version
    /// first. Dead nodes are not gossiped about.
    fn build_digest(&self) -> Vec<NodeInfoWire> {
        let mut peers: Vec<NodeInfo> = self
            .directory
            .all()
            .into_iter()
            .filter(|info| {
                info.node_id != self.directory.self_id()
                    && info.status != crate::types::NodeStatus::Dead
            })
            .collect();
        peers.sort_by(|a, b| b.version.cmp(&a.version));
        peers.truncate(DIGEST_CAP - 1);

        let mut digest = Vec::with_capacity(peers.len() + 1);
        digest.push(NodeInfoWire::from(self.directory.self_info()));
        digest.extend(peers.into_iter().map(NodeInfoWire::from));
        digest
    }

    /// Up to K alive peers, uniformly random, biased to include stale
    /// peers and at least one coordinator when self is a worker.
    fn pick_targets(&self) -> Vec<NodeInfo> {
        let now = unix_ms();
        let stale_age_ms = self.config.interval_min.as_millis() as u64 * 3;
        let alive = self.directory.alive_peers();
        if alive.is_empty() {
            return Vec::new();
        }

        let mut chosen: Vec<NodeInfo> = Vec::new();
        let mut chosen_ids: HashSet<String> = HashSet::new();

        for peer in &alive {
            if now.saturating_sub(peer.last_seen) > stale_age_ms
                && chosen_ids.insert(peer.node_id.clone())
            {
                chosen.push(peer.clone());
            }
        }

        if self.self_role != Role::Coordinator
            && !chosen.iter().any(|peer| peer.role == Role::Coordinator)
        {
            if let Some(coordinator) = alive
                .iter()
                .find(|peer| peer.role == Role::Coordinator)
            {
                if chosen_ids.insert(coordinator.node_id.clone()) {
                    chosen.push(coordinator.clone());
                }
            }
        }

        let mut remainder: Vec<&NodeInfo> = alive
            .iter()
            .filter(|peer| !chosen_ids.contains(&peer.node_id))
            .collect();
        remainder.shuffle(&mut rand::thread_rng());
        for peer in remainder {
            if chosen.len() >= self.config.max_targets {
                break;
            }
            chosen.push(peer.clone());
        }

        chosen
    }

    async fn send_to(&self, target: &NodeInfo, body: Vec<u8>) -> bool {
        let result = async {
            let client = self.pool.client(&target.node_id)?;
            let mut builder = client
                .post(format!("{}/internal/gossip", target.base_url()))
                .header("content-type", "application/octet-stream")
                .header("x-loom-node", self.directory.self_id())
                .body(body);
            if let Some(token) = self.pool.bearer_token() {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            let response = builder
                .send()
                .await
                .map_err(|e| self.pool.classify_error(e))?;
            if !response.status().is_success() {
                return Err(crate::error::FabricError::Transport(format!(
                    "gossip to {} returned HTTP {}",
                    target.node_id,
                    response.status()
                )));
            }
            Ok::<(), crate::error::FabricError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.pool.record_success(&target.node_id);
                self.send_failures.remove(&target.node_id);
                // A successful round trip is first-hand liveness evidence.
                self.directory.unfreeze(&target.node_id);
                self.directory.mark_seen(&target.node_id, unix_ms());
                true
            }
            Err(e) => {
                // Never surfaced to application code.
                debug!("Gossip send to {} failed: {e}", target.node_id);
                self.pool.record_failure(&target.node_id);
                let mut failures = self
                    .send_failures
                    .entry(target.node_id.clone())
                    .or_insert(0);
                *failures += 1;
                if *failures > FREEZE_AFTER_FAILURES {
                    self.directory.freeze(&target.node_id);
                }
                false
            }
        }
    }

    /// Receive path. Duplicate (sender, nonce) pairs inside the window
    /// only refresh the sender's liveness clock.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<()> {
        let frame = wire::decode_frame(bytes)?;
        let now = unix_ms();

        self.prune_recent();
        let dedup_key = (frame.from.clone(), frame.nonce.clone());
        let duplicate = self.recent_frames.contains_key(&dedup_key);
        self.recent_frames.insert(dedup_key, Instant::now());

        // The sender reached us: first-hand evidence, frozen or not.
        self.directory.unfreeze(&frame.from);
        self.directory.mark_seen(&frame.from, now);
        if duplicate {
            debug!("Duplicate gossip frame from {} suppressed", frame.from);
            return Ok(());
        }

        for entry in frame.entries {
            if entry.schema != GOSSIP_SCHEMA {
                debug!(
                    "Skipping gossip entry with unknown schema {} from {}",
                    entry.schema, frame.from
                );
                continue;
            }
            let mut info = entry.info;
            // Third-party reports never carry liveness into the future.
            if info.last_seen > now {
                info.last_seen = now;
            }
            self.directory.upsert(info);
        }

        Ok(())
    }

    fn prune_recent(&self) {
        self.recent_frames
            .retain(|_, seen| seen.elapsed() < DEDUP_WINDOW);
    }

    /// Linear interpolation of the tick interval from observed send load,
    /// clamped to ±20% per step.
    fn adjust_interval(&self) {
        let mut last_adjust = self.last_adjust.lock();
        let elapsed = last_adjust.elapsed();
        if elapsed < ADJUST_PERIOD {
            return;
        }

        let sent = self.sent_count.swap(0, Ordering::Relaxed);
        *last_adjust = Instant::now();
        drop(last_adjust);

        let per_second = sent as f64 / elapsed.as_secs_f64();
        let min = self.config.interval_min.as_secs_f64();
        let max = self.config.interval_max.as_secs_f64();

        let target = if per_second <= 1.0 {
            min
        } else if per_second >= 5.0 {
            max
        } else {
            min + (max - min) * ((per_second - 1.0) / 4.0)
        };

        let mut interval = self.interval_secs.lock();
        let clamped = target.clamp(*interval * 0.8, *interval * 1.2);
        if (clamped - *interval).abs() > f64::EPSILON {
            debug!(
                "Adaptive gossip: {per_second:.2} msg/s -> interval {clamped:.1}s (range {min}-{max}s)"
            );
        }
        *interval = clamped;
    }

    /// Join fast-path: push a one-entry digest about self to each
    /// bootstrap address so the cluster learns about this node without
    /// waiting for a tick.
    pub async fn announce_to_bootstraps(&self, bootstraps: &[String]) {
        let frame = GossipFrame {
            from: self.directory.self_id().to_string(),
            nonce: crate::ca::random_token(),
            entries: vec![NodeInfoWire::from(self.directory.self_info())],
        };
        let Ok(body) = wire::encode_frame(&frame, self.config.compression_threshold) else {
            return;
        };

        for addr in bootstraps {
            let Ok(client) = self.pool.client(addr) else {
                continue;
            };
            let url = format!("https://{addr}/internal/gossip");
            let mut builder = client
                .post(&url)
                .header("content-type", "application/octet-stream")
                .header("x-loom-node", self.directory.self_id())
                .body(body.clone());
            if let Some(token) = self.pool.bearer_token() {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Announced self to bootstrap {addr}");
                }
                Ok(response) => {
                    debug!("Bootstrap announce to {addr}: HTTP {}", response.status());
                }
                Err(e) => {
                    debug!("Bootstrap announce to {addr} failed: {e}");
                }
            }
        }
    }
}
