//! Retention sink plumbing. Telemetry lands in a bounded in-memory queue
//! (drop-oldest on overflow) and is flushed to the storage sink in batches,
//! so a slow sink never stalls the telemetry fast path. A periodic purge
//! applies the license tier's retention window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use pankha_protocol::frames::TelemetryData;

/// Records buffered beyond this are dropped oldest-first.
const QUEUE_CAPACITY: usize = 8192;
/// Maximum records per sink write.
const BATCH_SIZE: usize = 512;
/// How often the worker drains the queue.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
/// How often old records are purged.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub agent_id: String,
    pub sensor_id: String,
    pub temperature: f64,
    pub timestamp: i64,
}

/// The byte-addressable store, external to this process. Only its IO
/// contract matters here.
#[async_trait]
pub trait RetentionSink: Send + Sync {
    async fn write_batch(&self, records: &[SensorRecord]) -> Result<()>;
    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64>;
}

pub struct RetentionBuffer {
    queue: Mutex<VecDeque<SensorRecord>>,
    sink: Arc<dyn RetentionSink>,
}

impl RetentionBuffer {
    pub fn new(sink: Arc<dyn RetentionSink>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            sink,
        })
    }

    /// Queue one telemetry frame's visible sensor readings. Never blocks on
    /// the sink; overflow drops the oldest queued records.
    pub async fn enqueue(&self, telemetry: &TelemetryData) {
        let mut queue = self.queue.lock().await;
        for sensor in telemetry.sensors.iter().filter(|s| s.visible && !s.stale) {
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(SensorRecord {
                agent_id: telemetry.agent_id.clone(),
                sensor_id: sensor.id.clone(),
                temperature: sensor.temperature,
                timestamp: telemetry.timestamp,
            });
        }
    }

    /// Drain up to one batch into the sink. Failed batches are requeued at
    /// the front (subject to the same overflow rule).
    pub async fn flush(&self) {
        let batch: Vec<SensorRecord> = {
            let mut queue = self.queue.lock().await;
            let take = queue.len().min(BATCH_SIZE);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.sink.write_batch(&batch).await {
            warn!("Retention sink write failed, requeueing {} records: {}", batch.len(), e);
            let mut queue = self.queue.lock().await;
            for record in batch.into_iter().rev() {
                if queue.len() >= QUEUE_CAPACITY {
                    queue.pop_back();
                }
                queue.push_front(record);
            }
        }
    }

    pub async fn purge(&self, retention_days: u32) {
        let cutoff = pankha_protocol::now_millis() - (retention_days as i64) * 24 * 3600 * 1000;
        match self.sink.purge_older_than(cutoff).await {
            Ok(purged) if purged > 0 => debug!("Purged {} expired sensor records", purged),
            Ok(_) => {}
            Err(e) => warn!("Retention purge failed: {}", e),
        }
    }

    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// In-process sink used until a relational store is attached.
pub struct MemorySink {
    records: Mutex<Vec<SensorRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
        })
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl RetentionSink for MemorySink {
    async fn write_batch(&self, records: &[SensorRecord]) -> Result<()> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }

    async fn purge_older_than(&self, cutoff_ms: i64) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff_ms);
        Ok((before - records.len()) as u64)
    }
}
