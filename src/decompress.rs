//! Snapshot decode pipeline
//!
//! Snapshot downloads normally arrive gzip-compressed. Decoding runs
//! through an explicit, ordered strategy list: a dedicated worker
//! thread first, which keeps large decodes off the async executor, then
//! in-process decoding as a last resort. A payload that already starts
//! with the snapshot magic skips decoding entirely.
//!
//! The worker is spawned lazily on first use. If it dies, every
//! outstanding job is rejected and the next decode spawns a fresh one.

use crate::error::{CapsidError, Result};
use crate::integrity::is_valid_snapshot;
use async_trait::async_trait;
use crossbeam::channel::{self, Sender};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Decompress a gzip payload on the calling thread
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CapsidError::Decompression(e.to_string()))?;
    Ok(out)
}

enum WorkerJob {
    Decode { id: u64, bytes: Vec<u8> },
    Shutdown,
}

enum WorkerOutcome {
    /// The worker ran the job; the payload may still have failed to decode
    Completed(Result<Vec<u8>>),
    /// The worker is gone and the job never ran to completion
    Dead,
}

/// Dedicated decode thread
///
/// Jobs carry a correlation id; replies are matched back to waiters
/// through a shared pending map. When the thread exits it drains the
/// map, which wakes every remaining waiter with an error.
struct GzipWorker {
    jobs: Sender<WorkerJob>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>>,
    next_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GzipWorker {
    fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<WorkerJob>();
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let worker_pending = pending.clone();
        let handle = thread::Builder::new()
            .name("capsid-gunzip".to_string())
            .spawn(move || {
                for job in rx.iter() {
                    match job {
                        WorkerJob::Decode { id, bytes } => {
                            let result = gunzip(&bytes);
                            if let Some(reply) = worker_pending.lock().remove(&id) {
                                let _ = reply.send(result);
                            }
                        }
                        WorkerJob::Shutdown => break,
                    }
                }
                worker_pending.lock().clear();
            })?;

        Ok(GzipWorker {
            jobs: tx,
            pending,
            next_id: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        })
    }

    async fn decode(&self, bytes: Vec<u8>) -> WorkerOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        if self.jobs.send(WorkerJob::Decode { id, bytes }).is_err() {
            self.pending.lock().remove(&id);
            return WorkerOutcome::Dead;
        }
        match reply_rx.await {
            Ok(result) => WorkerOutcome::Completed(result),
            Err(_) => WorkerOutcome::Dead,
        }
    }

    fn shutdown(&self) {
        let _ = self.jobs.send(WorkerJob::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.pending.lock().clear();
    }
}

/// One way of turning a downloaded payload into raw snapshot bytes
#[async_trait]
pub trait DecodeStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Whether this strategy can run in the current environment
    fn available(&self) -> bool {
        true
    }

    /// Attempt to decode `bytes`
    async fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Release any resources held by the strategy
    fn teardown(&self) {}
}

/// Gzip on a dedicated worker thread, spawned on first use
pub struct WorkerGzip {
    slot: Mutex<Option<Arc<GzipWorker>>>,
}

impl WorkerGzip {
    pub fn new() -> Self {
        WorkerGzip {
            slot: Mutex::new(None),
        }
    }

    fn worker(&self) -> Result<Arc<GzipWorker>> {
        let mut slot = self.slot.lock();
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.clone());
        }
        let worker = Arc::new(GzipWorker::spawn().map_err(|e| {
            CapsidError::Decompression(format!("failed to spawn decode worker: {e}"))
        })?);
        *slot = Some(worker.clone());
        Ok(worker)
    }

    /// Take the worker out of the slot, but only while it is still `used`
    ///
    /// Another decode may have respawned a fresh worker already; that
    /// one stays.
    fn retire(&self, used: &Arc<GzipWorker>) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, used)) {
            if let Some(dead) = slot.take() {
                dead.shutdown();
            }
        }
    }
}

impl Default for WorkerGzip {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecodeStrategy for WorkerGzip {
    fn name(&self) -> &'static str {
        "worker-gzip"
    }

    async fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let worker = self.worker()?;
        match worker.decode(bytes.to_vec()).await {
            WorkerOutcome::Completed(result) => result,
            WorkerOutcome::Dead => {
                warn!("decode worker terminated; will respawn on next use");
                self.retire(&worker);
                Err(CapsidError::Decompression(
                    "decode worker terminated mid-job".to_string(),
                ))
            }
        }
    }

    fn teardown(&self) {
        if let Some(worker) = self.slot.lock().take() {
            worker.shutdown();
        }
    }
}

/// Gzip on the calling task, as a last resort
pub struct InProcessGzip;

#[async_trait]
impl DecodeStrategy for InProcessGzip {
    fn name(&self) -> &'static str {
        "in-process-gzip"
    }

    async fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        gunzip(bytes)
    }
}

/// Ordered decode strategy list
pub struct DecompressPipeline {
    strategies: Vec<Box<dyn DecodeStrategy>>,
}

impl DecompressPipeline {
    /// Default pipeline: worker thread first, then in-process
    pub fn new() -> Self {
        Self::with_strategies(vec![Box::new(WorkerGzip::new()), Box::new(InProcessGzip)])
    }

    /// Build a pipeline with an explicit strategy list
    pub fn with_strategies(strategies: Vec<Box<dyn DecodeStrategy>>) -> Self {
        DecompressPipeline { strategies }
    }

    /// Whether any strategy can run here
    pub fn is_supported(&self) -> bool {
        self.strategies.iter().any(|s| s.available())
    }

    /// Decode a downloaded payload into raw snapshot bytes
    ///
    /// A payload that already starts with the snapshot magic is
    /// returned as-is. Otherwise strategies run in order until one
    /// succeeds; each failure falls through to the next.
    pub async fn decompress(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if is_valid_snapshot(&bytes) {
            debug!("payload already uncompressed; skipping decode");
            return Ok(bytes);
        }

        let mut attempted = false;
        let mut last_err = None;
        for strategy in &self.strategies {
            if !strategy.available() {
                debug!(strategy = strategy.name(), "strategy unavailable; skipping");
                continue;
            }
            attempted = true;
            match strategy.decode(&bytes).await {
                Ok(out) => {
                    debug!(
                        strategy = strategy.name(),
                        input = bytes.len(),
                        output = out.len(),
                        "decode complete"
                    );
                    return Ok(out);
                }
                Err(e) => {
                    warn!(
                        strategy = strategy.name(),
                        error = %e,
                        "decode failed; trying next strategy"
                    );
                    last_err = Some(e);
                }
            }
        }

        if !attempted {
            return Err(CapsidError::UnsupportedEnvironment(
                "no decode strategy available".to_string(),
            ));
        }
        Err(last_err.unwrap_or_else(|| {
            CapsidError::Decompression("all decode strategies failed".to_string())
        }))
    }

    /// Tear down every strategy, rejecting any outstanding worker jobs
    pub fn close(&self) {
        for strategy in &self.strategies {
            strategy.teardown();
        }
    }
}

impl Default for DecompressPipeline {
    fn default() -> Self {
        Self::new()
    }
}
