//! Load progress reporting
//!
//! Progress events flow over an unbounded channel so emission never
//! blocks the load path, and receivers observe events in emission order.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Percent reported when the download starts
const DOWNLOAD_PERCENT_FLOOR: u8 = 5;

/// Percent reported when the download completes
const DOWNLOAD_PERCENT_CEIL: u8 = 80;

/// Cap for the coarse heuristic used when the length is untrusted
const UNTRUSTED_PERCENT_CEIL: u8 = 75;

/// One heuristic step per this many bytes received
const UNTRUSTED_STEP_BYTES: u64 = 4 * 1024 * 1024;

/// Percent added per heuristic step
const UNTRUSTED_STEP_PERCENT: u8 = 5;

/// Stage of a snapshot load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    /// Looking for a cached copy
    Checking,
    /// Streaming the snapshot from the network
    Downloading,
    /// Running the decode pipeline
    Decompressing,
    /// Validating and persisting the payload
    Initializing,
    /// Dataset is available
    Ready,
    /// Load failed
    Error,
}

impl LoadStage {
    /// Stable lowercase name of the stage
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStage::Checking => "checking",
            LoadStage::Downloading => "downloading",
            LoadStage::Decompressing => "decompressing",
            LoadStage::Initializing => "initializing",
            LoadStage::Ready => "ready",
            LoadStage::Error => "error",
        }
    }
}

/// A single progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProgress {
    /// Current stage
    pub stage: LoadStage,
    /// Overall completion in percent, 0 to 100
    pub percent: u8,
    /// Human-readable status line
    pub message: String,
    /// True when the bytes being served came from the durable cache
    pub served_from_cache: bool,
}

/// Sending half of a progress channel
///
/// A disabled sender drops every event, so the load path emits
/// unconditionally. Emission never blocks and a hung or dropped
/// receiver never stalls a load.
#[derive(Clone)]
pub struct ProgressSender {
    tx: Option<mpsc::UnboundedSender<LoadProgress>>,
}

impl ProgressSender {
    /// Create a connected sender/receiver pair
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoadProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProgressSender { tx: Some(tx) }, rx)
    }

    /// Create a sender that discards every event
    pub fn disabled() -> Self {
        ProgressSender { tx: None }
    }

    pub(crate) fn emit(
        &self,
        stage: LoadStage,
        percent: u8,
        message: impl Into<String>,
        served_from_cache: bool,
    ) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening anymore.
            let _ = tx.send(LoadProgress {
                stage,
                percent: percent.min(100),
                message: message.into(),
                served_from_cache,
            });
        }
    }
}

/// Map received byte counts onto the download percent band
///
/// With a trusted total the mapping is proportional. Without one (the
/// transport declared no length, or the payload is opaquely transformed
/// in transit) a coarse heuristic advances the bar per chunk of bytes
/// and saturates below the band ceiling.
pub(crate) fn download_percent(bytes_read: u64, trusted_total: Option<u64>) -> u8 {
    let span = (DOWNLOAD_PERCENT_CEIL - DOWNLOAD_PERCENT_FLOOR) as u64;
    match trusted_total {
        Some(total) if total > 0 => {
            let scaled = bytes_read.min(total) * span / total;
            DOWNLOAD_PERCENT_FLOOR + scaled as u8
        }
        _ => {
            let steps = bytes_read / UNTRUSTED_STEP_BYTES;
            let bump = steps.saturating_mul(UNTRUSTED_STEP_PERCENT as u64);
            let capped = bump.min((UNTRUSTED_PERCENT_CEIL - DOWNLOAD_PERCENT_FLOOR) as u64);
            DOWNLOAD_PERCENT_FLOOR + capped as u8
        }
    }
}
