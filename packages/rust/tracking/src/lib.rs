//! Best-effort metrics sink for imgflow.
//!
//! Stages hand [`MetricsRecord`]s to a [`MetricsSink`] and move on. The
//! [`BackgroundSink`] puts records on a bounded queue drained by a worker
//! thread that retries each delivery with exponential backoff. When the queue
//! is full, or a record still fails after the last attempt, the record is
//! counted and logged, never raised to the caller.

pub mod transport;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use imgflow_shared::{PipelineError, Result};

pub use transport::{
    Credentials, HttpTransport, JsonlTransport, TrackingTarget, Transport, transport_for,
};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Parameters and metrics reported by one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub run_id: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<String>,
    pub params: BTreeMap<String, serde_json::Value>,
    pub metrics: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
}

impl MetricsRecord {
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>, experiment: Option<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            experiment,
            params: BTreeMap::new(),
            metrics: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, serde_json::Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

/// Fire-and-forget destination for metric records. Never fails the caller.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, record: MetricsRecord);
}

/// Sink that discards everything (tracking not configured).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, record: MetricsRecord) {
        debug!(stage = %record.stage, "tracking disabled, discarding metrics");
    }
}

// ---------------------------------------------------------------------------
// Retry policy & stats
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Delivery counters reported when the sink shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

// ---------------------------------------------------------------------------
// BackgroundSink
// ---------------------------------------------------------------------------

/// Queue capacity used by [`BackgroundSink::open`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Bounded queue in front of a transport, drained by a worker thread.
pub struct BackgroundSink {
    sender: Mutex<Option<SyncSender<MetricsRecord>>>,
    worker: Mutex<Option<JoinHandle<SinkStats>>>,
    dropped: Arc<AtomicU64>,
}

impl BackgroundSink {
    /// Open a sink for a tracking target with the default queue and retry policy.
    pub fn open(target: &TrackingTarget) -> Result<Self> {
        Self::spawn(transport_for(target)?, DEFAULT_QUEUE_CAPACITY, RetryPolicy::default())
    }

    /// Start a worker thread delivering through `transport`.
    pub fn spawn(transport: Box<dyn Transport>, capacity: usize, policy: RetryPolicy) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let worker = std::thread::Builder::new()
            .name("imgflow-metrics".into())
            .spawn(move || drain(transport, receiver, policy))
            .map_err(|e| PipelineError::SinkUnavailable(format!("spawn worker: {e}")))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Close the queue, wait for in-flight deliveries, and report counters.
    pub fn shutdown(&self) -> SinkStats {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        let mut stats = match handle.map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("metrics worker panicked");
                SinkStats::default()
            }
            None => SinkStats::default(),
        };
        stats.dropped = self.dropped.load(Ordering::Relaxed);
        stats
    }

    fn record_drop(&self, stage: &str, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(stage, reason, "metrics record dropped");
    }
}

impl MetricsSink for BackgroundSink {
    fn emit(&self, record: MetricsRecord) {
        let stage = record.stage.clone();
        let Ok(guard) = self.sender.lock() else {
            self.record_drop(&stage, "sink lock poisoned");
            return;
        };
        match guard.as_ref().map(|s| s.try_send(record)) {
            Some(Ok(())) => debug!(stage = %stage, "metrics record queued"),
            Some(Err(TrySendError::Full(_))) => self.record_drop(&stage, "queue full"),
            Some(Err(TrySendError::Disconnected(_))) | None => {
                self.record_drop(&stage, "sink closed")
            }
        }
    }
}

impl Drop for BackgroundSink {
    fn drop(&mut self) {
        let stats = self.shutdown();
        if stats.failed > 0 || stats.dropped > 0 {
            warn!(
                delivered = stats.delivered,
                failed = stats.failed,
                dropped = stats.dropped,
                "metrics sink closed with undelivered records"
            );
        }
    }
}

fn drain(transport: Box<dyn Transport>, receiver: Receiver<MetricsRecord>, policy: RetryPolicy) -> SinkStats {
    let mut stats = SinkStats::default();
    for record in receiver {
        match deliver(transport.as_ref(), &record, &policy) {
            Ok(()) => stats.delivered += 1,
            Err(e) => {
                warn!(
                    transport = transport.name(),
                    stage = %record.stage,
                    kind = e.kind(),
                    error = %e,
                    "giving up on metrics record"
                );
                stats.failed += 1;
            }
        }
    }
    stats
}

fn deliver(transport: &dyn Transport, record: &MetricsRecord, policy: &RetryPolicy) -> Result<()> {
    let mut attempt = 1;
    loop {
        match transport.send(record) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "metrics delivery failed, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
