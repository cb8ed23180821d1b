//! Relay session cache
//!
//! Maps identifiers to running relays and decides, per lookup, whether the
//! existing relay can be reused, must be refreshed, or has to be created.
//!
//! Each identifier owns a slot guarded by its own async mutex, held for the
//! whole check → fetch metadata → launch → install sequence, so at most one
//! relay is started per identifier at a time. Lookups for different
//! identifiers run in parallel. A lookup that acquires a slot which was
//! evicted while it waited starts over on the current slot.
//!
//! A record is `Live` while its relay answers the liveness probe and it has
//! been looked up within the refresh period. Otherwise it is `Stale` and the
//! next lookup tries one refresh; a failed refresh leaves the stale record in
//! place. Records only disappear through [`SessionCache::sweep`] (idle TTL)
//! or [`SessionCache::evict`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{RelayError, RelayErrorKind, Result};
use crate::launcher::RelayLauncher;
use crate::metadata::{select_source, MetadataProvider};
use crate::ports::PortAllocator;
use crate::process::RelayHandle;

/// A running relay for one identifier
#[derive(Debug)]
pub struct SessionRecord {
    identifier: String,
    port: u16,
    relay: Box<dyn RelayHandle>,
    last_access: Instant,
    created_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
    refresh_count: u32,
}

/// Why a record needs a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Liveness probe did not confirm the relay is running
    RelayDead,
    /// Not looked up within the refresh period
    Expired,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::RelayDead => write!(f, "relay_dead"),
            StaleReason::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Live,
    Stale(StaleReason),
}

impl SessionRecord {
    fn new(identifier: &str, port: u16, relay: Box<dyn RelayHandle>, now: Instant) -> Self {
        let wall = Utc::now();
        Self {
            identifier: identifier.to_string(),
            port,
            relay,
            last_access: now,
            created_at: wall,
            refreshed_at: wall,
            refresh_count: 0,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Probe the relay and check the refresh period
    pub fn freshness(&self, refresh_period: Duration, now: Instant) -> Freshness {
        if !self.relay.is_alive() {
            Freshness::Stale(StaleReason::RelayDead)
        } else if now.saturating_duration_since(self.last_access) >= refresh_period {
            Freshness::Stale(StaleReason::Expired)
        } else {
            Freshness::Live
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identifier: self.identifier.clone(),
            port: self.port,
            pid: self.relay.pid(),
            alive: self.relay.is_alive(),
            created_at: self.created_at,
            refreshed_at: self.refreshed_at,
            refresh_count: self.refresh_count,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub identifier: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub alive: bool,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
    pub refresh_count: u32,
}

/// Outcome of [`SessionCache::resolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// Relay port, `-1` if not found
    pub port: i32,
    pub found: bool,
    pub error: Option<RelayErrorKind>,
}

impl Lookup {
    fn found(port: u16) -> Self {
        Self {
            port: i32::from(port),
            found: true,
            error: None,
        }
    }

    fn not_found(kind: RelayErrorKind) -> Self {
        Self {
            port: -1,
            found: false,
            error: Some(kind),
        }
    }
}

/// A replaced relay whose port is held back until it is confirmed dead
#[derive(Debug)]
struct Retired {
    port: u16,
    relay: Box<dyn RelayHandle>,
}

type Slot = Arc<Mutex<Option<SessionRecord>>>;

/// Session cache timing and selection policy
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub refresh_period: Duration,
    pub idle_ttl: Duration,
    pub upstream_timeout: Duration,
    pub max_bitrate: f64,
}

impl CachePolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_period: config.session.refresh_period(),
            idle_ttl: config.session.idle_ttl(),
            upstream_timeout: config.upstream.timeout(),
            max_bitrate: config.upstream.max_bitrate,
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Identifier → relay session cache
pub struct SessionCache {
    slots: RwLock<HashMap<String, Slot>>,
    ports: parking_lot::Mutex<PortAllocator>,
    retired: parking_lot::Mutex<Vec<Retired>>,
    provider: Arc<dyn MetadataProvider>,
    launcher: Arc<dyn RelayLauncher>,
    policy: CachePolicy,
}

impl SessionCache {
    pub fn new(
        policy: CachePolicy,
        ports: PortAllocator,
        provider: Arc<dyn MetadataProvider>,
        launcher: Arc<dyn RelayLauncher>,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ports: parking_lot::Mutex::new(ports),
            retired: parking_lot::Mutex::new(Vec::new()),
            provider,
            launcher,
            policy,
        }
    }

    /// Build a cache with policy and port range taken from `config`
    pub fn from_config(
        config: &Config,
        provider: Arc<dyn MetadataProvider>,
        launcher: Arc<dyn RelayLauncher>,
    ) -> Self {
        Self::new(
            CachePolicy::from_config(config),
            PortAllocator::from_config(&config.ports),
            provider,
            launcher,
        )
    }

    /// Resolve `identifier` to a relay port, absorbing every failure
    pub async fn resolve(&self, identifier: &str) -> Lookup {
        match self.try_resolve(identifier).await {
            Ok(port) => Lookup::found(port),
            Err(e) => {
                match &e {
                    RelayError::NoUsableSource(_) | RelayError::InvalidIdentifier => {
                        tracing::info!(identifier = %identifier, "Lookup failed: {}", e)
                    }
                    RelayError::UpstreamUnavailable(_) => {
                        tracing::warn!(identifier = %identifier, "Lookup failed: {}", e)
                    }
                    RelayError::ProcessLaunch(_) | RelayError::PortsExhausted { .. } => {
                        tracing::error!(identifier = %identifier, "Lookup failed: {}", e)
                    }
                }
                Lookup::not_found(e.kind())
            }
        }
    }

    /// Resolve `identifier` to a relay port, creating or refreshing as needed
    pub async fn try_resolve(&self, identifier: &str) -> Result<u16> {
        if identifier.is_empty() {
            return Err(RelayError::InvalidIdentifier);
        }

        let mut entry = loop {
            let slot = self.slot(identifier).await;
            let entry = slot.clone().lock_owned().await;
            if self.is_mapped(identifier, &slot).await {
                break entry;
            }
            // Evicted while we waited; its record is gone with it
            tracing::debug!(identifier = %identifier, "Slot evicted during lookup, retrying");
        };

        if let Some(record) = entry.as_mut() {
            let now = Instant::now();
            match record.freshness(self.policy.refresh_period, now) {
                Freshness::Live => {
                    record.last_access = now;
                    return Ok(record.port);
                }
                Freshness::Stale(reason) => {
                    tracing::info!(
                        identifier = %identifier,
                        port = record.port,
                        reason = %reason,
                        "Refreshing stale relay session"
                    );
                }
            }
        }

        let (port, relay) = self.start_relay(identifier).await?;

        let mut record = SessionRecord::new(identifier, port, relay, Instant::now());
        if let Some(previous) = entry.take() {
            record.created_at = previous.created_at;
            record.refresh_count = previous.refresh_count + 1;
            self.retire(previous);
        }

        tracing::info!(
            identifier = %identifier,
            port,
            refresh_count = record.refresh_count,
            "Relay session ready"
        );
        *entry = Some(record);
        Ok(port)
    }

    /// Fetch metadata, pick a source, allocate a port and launch
    async fn start_relay(&self, identifier: &str) -> Result<(u16, Box<dyn RelayHandle>)> {
        let variants = tokio::time::timeout(
            self.policy.upstream_timeout,
            self.provider.fetch_variants(identifier),
        )
        .await
        .map_err(|_| {
            RelayError::UpstreamUnavailable(format!(
                "metadata request timed out after {:?}",
                self.policy.upstream_timeout
            ))
        })??;

        let source = select_source(&variants, self.policy.max_bitrate)
            .ok_or_else(|| RelayError::NoUsableSource(identifier.to_string()))?;

        let port = self.allocate_port()?;
        match self.launcher.launch(&source, port).await {
            Ok(relay) => Ok((port, relay)),
            Err(e) => {
                // Nothing ever bound this port
                self.ports.lock().release(port);
                Err(e)
            }
        }
    }

    async fn slot(&self, identifier: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(identifier) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(identifier.to_string())
            .or_default()
            .clone()
    }

    async fn is_mapped(&self, identifier: &str, slot: &Slot) -> bool {
        self.slots
            .read()
            .await
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn allocate_port(&self) -> Result<u16> {
        self.reclaim_retired();
        self.ports.lock().allocate()
    }

    /// Stop a replaced relay; its port returns to the pool once it is dead
    fn retire(&self, record: SessionRecord) {
        tracing::debug!(
            identifier = %record.identifier,
            port = record.port,
            "Retiring relay"
        );
        record.relay.terminate();
        self.retired.lock().push(Retired {
            port: record.port,
            relay: record.relay,
        });
    }

    /// Release ports of retired relays that are confirmed dead
    fn reclaim_retired(&self) -> usize {
        let mut retired = self.retired.lock();
        let mut ports = self.ports.lock();
        let before = retired.len();
        retired.retain(|r| {
            if r.relay.is_alive() {
                true
            } else {
                ports.release(r.port);
                false
            }
        });
        before - retired.len()
    }

    /// Evict sessions idle for longer than the idle TTL
    ///
    /// Slots currently in use by a lookup are skipped. Returns the number of
    /// evicted sessions.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.policy.idle_ttl;
        let mut evicted = Vec::new();

        {
            let mut slots = self.slots.write().await;
            slots.retain(|_, slot| {
                // Clones are only handed out under the map lock
                if Arc::strong_count(slot) > 1 {
                    return true;
                }
                let Ok(mut entry) = slot.try_lock() else {
                    return true;
                };
                if let Some(record) =
                    entry.take_if(|r| now.saturating_duration_since(r.last_access) >= idle_ttl)
                {
                    evicted.push(record);
                    return false;
                }
                entry.is_some()
            });
        }

        let count = evicted.len();
        for record in evicted {
            tracing::info!(
                identifier = %record.identifier,
                port = record.port,
                "Evicting idle relay session"
            );
            self.retire(record);
        }

        let reclaimed = self.reclaim_retired();
        if count > 0 || reclaimed > 0 {
            tracing::debug!(evicted = count, reclaimed, "Session sweep complete");
        }
        count
    }

    /// Evict one session, stopping its relay
    pub async fn evict(&self, identifier: &str) -> bool {
        let Some(slot) = self.slots.write().await.remove(identifier) else {
            return false;
        };
        let record = slot.lock().await.take();
        match record {
            Some(record) => {
                tracing::info!(identifier = %identifier, port = record.port, "Evicting relay session");
                self.retire(record);
                true
            }
            None => false,
        }
    }

    /// Run periodic sweeps until shutdown is signalled
    pub async fn run_sweep_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tracing::info!("Session sweep task started (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Session sweep task shutting down");
                    break;
                }
            }
        }
    }

    /// Stop every relay: SIGTERM, wait up to `grace`, then SIGKILL survivors
    pub async fn shutdown(&self, grace: Duration) {
        let slots: Vec<Slot> = self.slots.write().await.drain().map(|(_, s)| s).collect();
        for slot in slots {
            if let Some(record) = slot.lock().await.take() {
                self.retire(record);
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            self.reclaim_retired();
            if self.retired.lock().is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let survivors = std::mem::take(&mut *self.retired.lock());
        for r in &survivors {
            tracing::warn!(port = r.port, pid = ?r.relay.pid(), "Relay ignored SIGTERM, killing");
            r.relay.kill();
        }
    }

    /// Snapshot of all sessions, ordered by identifier
    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.lock().await.as_ref() {
                out.push(record.snapshot());
            }
        }
        out.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        out
    }

    /// Number of identifiers with a session record
    pub async fn session_count(&self) -> usize {
        self.sessions().await.len()
    }

    /// Replaced relays still waiting to be confirmed dead
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Ports still available to new relays
    pub fn available_ports(&self) -> usize {
        self.ports.lock().available()
    }
}
