//! Fake collaborators for driving the session cache without processes or network

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use remotemedia_stream_relay::launcher::RelayLauncher;
use remotemedia_stream_relay::metadata::{MetadataProvider, QualityVariant};
use remotemedia_stream_relay::ports::PortAllocator;
use remotemedia_stream_relay::process::RelayHandle;
use remotemedia_stream_relay::session::{CachePolicy, SessionCache};
use remotemedia_stream_relay::{RelayError, Result};

pub const REFRESH_PERIOD: Duration = Duration::from_secs(600 * 60);

pub fn variant(play: &str, bitrate: f64) -> QualityVariant {
    QualityVariant {
        play: play.to_string(),
        token: format!("token-{}", play),
        connect: "rtmp://203.0.113.7/app".to_string(),
        bitrate: Some(bitrate),
    }
}

/// Relay whose liveness is controlled by the test
#[derive(Debug, Clone, Default)]
pub struct FakeRelay {
    alive: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    /// Keeps running after SIGTERM
    stubborn: bool,
}

impl FakeRelay {
    pub fn running(stubborn: bool) -> Self {
        Self {
            alive: Arc::new(AtomicBool::new(true)),
            terminated: Arc::new(AtomicBool::new(false)),
            stubborn,
        }
    }

    /// Simulate the process dying behind our back
    pub fn die(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl RelayHandle for FakeRelay {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if !self.stubborn {
            self.die();
        }
    }

    fn kill(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.die();
    }
}

/// One recorded launch
#[derive(Debug, Clone)]
pub struct Launch {
    pub source: QualityVariant,
    pub port: u16,
    pub relay: FakeRelay,
}

#[derive(Default)]
pub struct FakeLauncher {
    launches: Mutex<Vec<Launch>>,
    fail_next: AtomicBool,
    stubborn: AtomicBool,
}

impl FakeLauncher {
    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn last(&self) -> Launch {
        self.launches.lock().last().cloned().expect("no launches recorded")
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Relays launched from now on ignore SIGTERM
    pub fn set_stubborn(&self, stubborn: bool) {
        self.stubborn.store(stubborn, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayLauncher for FakeLauncher {
    async fn launch(&self, source: &QualityVariant, port: u16) -> Result<Box<dyn RelayHandle>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RelayError::ProcessLaunch("simulated spawn failure".to_string()));
        }
        let relay = FakeRelay::running(self.stubborn.load(Ordering::SeqCst));
        self.launches.lock().push(Launch {
            source: source.clone(),
            port,
            relay: relay.clone(),
        });
        Ok(Box::new(relay))
    }
}

/// Metadata provider with per-identifier canned answers
#[derive(Default)]
pub struct FakeProvider {
    streams: Mutex<HashMap<String, Vec<QualityVariant>>>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeProvider {
    /// Provider where every identifier streams a single 1000-bitrate variant
    pub fn live(identifiers: &[&str]) -> Self {
        let provider = Self::default();
        for id in identifiers {
            provider.set(id, vec![variant(id, 1000.0)]);
        }
        provider
    }

    pub fn set(&self, identifier: &str, variants: Vec<QualityVariant>) {
        self.streams.lock().insert(identifier.to_string(), variants);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataProvider for FakeProvider {
    async fn fetch_variants(&self, identifier: &str) -> Result<Vec<QualityVariant>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelayError::UpstreamUnavailable("connection refused".to_string()));
        }
        Ok(self
            .streams
            .lock()
            .get(identifier)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn policy() -> CachePolicy {
    CachePolicy {
        refresh_period: REFRESH_PERIOD,
        idle_ttl: REFRESH_PERIOD,
        upstream_timeout: Duration::from_secs(5),
        max_bitrate: 5000.0,
    }
}

pub fn cache_with(
    provider: Arc<FakeProvider>,
    launcher: Arc<FakeLauncher>,
    max_ports: u16,
) -> SessionCache {
    SessionCache::new(
        policy(),
        PortAllocator::new(6000, max_ports),
        provider,
        launcher,
    )
}
