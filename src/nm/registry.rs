//! Storage-Server Registry & Failover
//!
//! Tracks every storage server that ever registered or heartbeated, marks
//! entries down when their heartbeat goes stale, and promotes replicas
//! when a file's primary is down. Placement for new files is
//! least-loaded-by-mapping-count.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::state::NmState;
use super::types::StorageServer;

/// A server whose heartbeat is older than this is down.
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(6);
/// Cadence of the down-marking / promotion sweep.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct SsRegistry {
    servers: DashMap<u32, StorageServer>,
}

impl SsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upsert from `SS_REGISTER`. The peer address comes from the socket.
    pub fn register(&self, ss_id: u32, addr: &str, ctrl_port: u16, data_port: u16) {
        self.servers.insert(
            ss_id,
            StorageServer {
                ss_id,
                addr: addr.to_string(),
                ctrl_port,
                data_port,
                last_heartbeat: Instant::now(),
                is_up: true,
            },
        );
    }

    /// Record a heartbeat. A server we have never seen register is kept
    /// down until it does (its data port is unknown). Returns `true` on a
    /// down-to-up transition, which is the caller's cue to resync.
    pub fn heartbeat(&self, ss_id: u32, addr: &str) -> bool {
        let mut entry = self.servers.entry(ss_id).or_insert_with(|| StorageServer {
            ss_id,
            addr: addr.to_string(),
            ctrl_port: 0,
            data_port: 0,
            last_heartbeat: Instant::now(),
            is_up: false,
        });
        let was_up = entry.is_up;
        entry.last_heartbeat = Instant::now();
        entry.is_up = entry.data_port != 0;
        !was_up && entry.is_up
    }

    /// Data endpoint of `ss_id` if it has one.
    pub fn data_addr(&self, ss_id: u32) -> Option<String> {
        self.servers.get(&ss_id).and_then(|e| e.data_addr())
    }

    /// Data endpoint split into host and port, for replies that carry
    /// them as separate fields.
    pub fn endpoint(&self, ss_id: u32) -> Option<(String, u16)> {
        let entry = self.servers.get(&ss_id)?;
        if entry.data_port == 0 {
            return None;
        }
        Some((entry.addr.clone(), entry.data_port))
    }

    /// Lowest-id up server, used for best-effort single-server chores.
    pub fn lowest_up(&self) -> Option<u32> {
        self.snapshot()
            .into_iter()
            .find(|s| s.is_up && s.data_port != 0)
            .map(|s| s.ss_id)
    }

    pub fn is_up(&self, ss_id: u32) -> bool {
        self.servers.get(&ss_id).map(|e| e.is_up).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<StorageServer> {
        let mut servers: Vec<StorageServer> =
            self.servers.iter().map(|e| e.value().clone()).collect();
        servers.sort_by_key(|s| s.ss_id);
        servers
    }

    pub fn up_count(&self) -> usize {
        self.servers.iter().filter(|e| e.is_up).count()
    }

    /// Least-loaded up server by directory mapping count, ties broken by
    /// id order. Only servers with a known data port qualify.
    pub fn pick_least_loaded(&self, load: &HashMap<u32, usize>) -> Option<StorageServer> {
        let mut candidates = self.snapshot();
        candidates.retain(|s| s.is_up && s.data_port != 0);
        candidates
            .into_iter()
            .min_by_key(|s| (*load.get(&s.ss_id).unwrap_or(&0), s.ss_id))
    }

    /// First `count` other up servers, in id order.
    pub fn pick_replicas(&self, primary: u32, count: usize) -> Vec<u32> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.ss_id != primary && s.is_up && s.data_port != 0)
            .map(|s| s.ss_id)
            .take(count)
            .collect()
    }

    /// Force an entry down, as the staleness sweep would. Test hook.
    #[cfg(test)]
    pub fn force_down(&self, ss_id: u32) {
        if let Some(mut entry) = self.servers.get_mut(&ss_id) {
            entry.is_up = false;
        }
    }

    /// Mark stale entries down; returns the ids that transitioned.
    pub fn mark_stale_down(&self) -> Vec<u32> {
        let now = Instant::now();
        let mut downed = Vec::new();
        for mut entry in self.servers.iter_mut() {
            if entry.is_up && now.duration_since(entry.last_heartbeat) > HEARTBEAT_STALE {
                entry.is_up = false;
                downed.push(entry.ss_id);
            }
        }
        downed
    }
}

/// One promotion pass: for each file whose primary is down, promote the
/// first up replica. The old primary moves to the head of the replica
/// list so a later rejoin resyncs it. Returns whether anything changed.
pub fn promote_down_primaries(registry: &SsRegistry, state: &mut NmState) -> bool {
    let mut promoted = false;
    for file in state.directory.files() {
        let Some(entry) = state.directory.get(&file) else {
            continue;
        };
        let primary = entry.primary;
        if registry.is_up(primary) {
            continue;
        }
        let replicas = entry.replicas.clone();
        let Some(candidate) = replicas.iter().copied().find(|&r| registry.is_up(r)) else {
            continue;
        };
        let mut new_replicas = vec![primary];
        new_replicas.extend(
            replicas
                .iter()
                .copied()
                .filter(|&r| r != candidate && r != primary),
        );
        state.directory.set_primary(&file, candidate);
        state.directory.set_replicas(&file, new_replicas);
        promoted = true;
        tracing::warn!(
            "promoted {} primary -> ss{}; old primary {} demoted to replica",
            file,
            candidate,
            primary
        );
    }
    promoted
}

/// Background sweep: every second, mark stale servers down and run a
/// promotion pass, persisting when a promotion happened.
pub async fn run_monitor(registry: Arc<SsRegistry>, state: Arc<Mutex<NmState>>) {
    let mut interval = tokio::time::interval(MONITOR_INTERVAL);
    loop {
        interval.tick().await;

        for ss_id in registry.mark_stale_down() {
            tracing::warn!("storage server {} marked DOWN", ss_id);
        }

        let mut st = state.lock().await;
        if promote_down_primaries(&registry, &mut st) {
            if let Err(e) = st.save().await {
                tracing::error!("state save after promotion failed: {}", e);
            }
        }
    }
}
