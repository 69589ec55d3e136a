//! Per-project traffic accounting.
//!
//! Each project keeps a sliding window of per-second byte counts. The window
//! is an approximation: framing bytes are counted along with payload.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Seconds kept per project
pub const WINDOW_SECONDS: usize = 100;

/// Source of the current second, replaceable in tests
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficEntry {
    pub second: i64,
    pub bytes: u64,
}

/// Ring of per-second buckets, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficWindow {
    entries: VecDeque<TrafficEntry>,
}

impl TrafficWindow {
    /// A window of zero-filled seconds ending at `now`
    pub fn zeroed(now: i64) -> Self {
        let first = now - (WINDOW_SECONDS as i64 - 1);
        Self {
            entries: (first..=now)
                .map(|second| TrafficEntry { second, bytes: 0 })
                .collect(),
        }
    }

    pub fn record(&mut self, now: i64, bytes: u64) {
        // A clock stepping backwards lands in the newest bucket
        if let Some(last) = self.entries.back_mut() {
            if last.second >= now {
                last.bytes += bytes;
                return;
            }
        }

        self.entries.push_back(TrafficEntry { second: now, bytes });
        while self.entries.len() > WINDOW_SECONDS {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrafficEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes_at(&self, second: i64) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.second == second)
            .map(|e| e.bytes)
            .sum()
    }
}

/// Project name -> window entries, oldest first
pub type TrafficSnapshot = BTreeMap<String, Vec<TrafficEntry>>;

pub struct TrafficMeter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, TrafficWindow>>,
    tx: watch::Sender<TrafficSnapshot>,
}

impl TrafficMeter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (tx, _rx) = watch::channel(TrafficSnapshot::new());
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }

    pub async fn record(&self, project: &str, bytes: usize) {
        let now = self.clock.now_secs();
        let mut windows = self.windows.lock().await;
        windows
            .entry(project.to_string())
            .or_insert_with(|| TrafficWindow::zeroed(now))
            .record(now, bytes as u64);
    }

    pub async fn clear(&self, project: &str) {
        self.windows.lock().await.remove(project);
    }

    pub async fn window(&self, project: &str) -> Option<TrafficWindow> {
        self.windows.lock().await.get(project).cloned()
    }

    pub async fn snapshot(&self) -> TrafficSnapshot {
        self.windows
            .lock()
            .await
            .iter()
            .map(|(project, window)| (project.clone(), window.entries().copied().collect()))
            .collect()
    }

    /// Receive a snapshot on every publisher tick
    pub fn subscribe(&self) -> watch::Receiver<TrafficSnapshot> {
        self.tx.subscribe()
    }

    /// Push snapshots to subscribers every `interval` until `shutdown` fires
    pub fn spawn_publisher(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let meter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = meter.snapshot().await;
                        meter.tx.send_replace(snapshot);
                    }
                }
            }

            debug!("Traffic publisher stopped");
        })
    }
}
