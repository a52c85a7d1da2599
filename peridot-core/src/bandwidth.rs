//! Transfer accounting and rolling-window speed estimation.
//!
//! Transfers are tracked from `start_transfer` to `complete_transfer`;
//! completed records land in a bounded FIFO history. Per-direction speed is
//! computed from a 5-second sliding window of `(bytes, time)` samples,
//! evicted by age rather than count. Throttle limits are stored for the sync
//! transport to enforce; the monitor itself only reports them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Completed transfers kept for history queries.
const MAX_HISTORY: usize = 100;

/// Wall-clock span of the speed estimation window.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    fn label(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

/// Lifecycle record of one transfer.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: String,
    pub filename: String,
    pub direction: TransferDirection,
    pub bytes: u64,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub completed: bool,
    pub success: bool,
    pub error: String,
}

/// Process-scoped cumulative counters, reset only on request.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub total_uploaded: u64,
    pub total_downloaded: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub errors: u64,
    pub session_start: Instant,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            total_uploaded: 0,
            total_downloaded: 0,
            files_uploaded: 0,
            files_downloaded: 0,
            errors: 0,
            session_start: Instant::now(),
        }
    }
}

type SpeedSample = (u64, Instant);

#[derive(Debug)]
struct MonitorInner {
    active: HashMap<String, TransferRecord>,
    completed: VecDeque<TransferRecord>,
    upload_samples: VecDeque<SpeedSample>,
    download_samples: VecDeque<SpeedSample>,
    session: SessionStats,
}

#[derive(Debug)]
pub struct BandwidthMonitor {
    inner: Mutex<MonitorInner>,
    active_uploads: AtomicI64,
    active_downloads: AtomicI64,
    pending_transfers: AtomicI64,
    upload_limit: AtomicU64,
    download_limit: AtomicU64,
}

impl Default for BandwidthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                active: HashMap::new(),
                completed: VecDeque::new(),
                upload_samples: VecDeque::new(),
                download_samples: VecDeque::new(),
                session: SessionStats::new(),
            }),
            active_uploads: AtomicI64::new(0),
            active_downloads: AtomicI64::new(0),
            pending_transfers: AtomicI64::new(0),
            upload_limit: AtomicU64::new(0),
            download_limit: AtomicU64::new(0),
        }
    }

    pub fn start_transfer(
        &self,
        id: &str,
        filename: &str,
        direction: TransferDirection,
        total_bytes: u64,
    ) {
        let mut inner = self.lock();
        inner.active.insert(
            id.to_string(),
            TransferRecord {
                id: id.to_string(),
                filename: filename.to_string(),
                direction,
                bytes: total_bytes,
                start_time: Instant::now(),
                end_time: None,
                completed: false,
                success: false,
                error: String::new(),
            },
        );
        match direction {
            TransferDirection::Upload => self.active_uploads.fetch_add(1, Ordering::Relaxed),
            TransferDirection::Download => self.active_downloads.fetch_add(1, Ordering::Relaxed),
        };
        debug!("started {}: {filename}", direction.label());
    }

    /// Feed a progress sample for a running transfer. Unknown ids are
    /// ignored (the transfer may have completed concurrently).
    pub fn update_progress(&self, id: &str, bytes_transferred: u64) {
        let now = Instant::now();
        let mut inner = self.lock();
        let Some(direction) = inner.active.get(id).map(|r| r.direction) else {
            return;
        };
        match direction {
            TransferDirection::Upload => inner.upload_samples.push_back((bytes_transferred, now)),
            TransferDirection::Download => {
                inner.download_samples.push_back((bytes_transferred, now))
            }
        }

        if let Some(cutoff) = now.checked_sub(SPEED_WINDOW) {
            evict_old(&mut inner.upload_samples, cutoff);
            evict_old(&mut inner.download_samples, cutoff);
        }
    }

    /// Close out a transfer, moving it into the history ring. Session
    /// cumulatives only grow on success; failures bump the error count.
    pub fn complete_transfer(&self, id: &str, success: bool, error: &str) {
        let mut inner = self.lock();
        let Some(mut record) = inner.active.remove(id) else {
            return;
        };
        record.end_time = Some(Instant::now());
        record.completed = true;
        record.success = success;
        record.error = error.to_string();

        match record.direction {
            TransferDirection::Upload => {
                self.active_uploads.fetch_sub(1, Ordering::Relaxed);
                if success {
                    inner.session.total_uploaded += record.bytes;
                    inner.session.files_uploaded += 1;
                }
            }
            TransferDirection::Download => {
                self.active_downloads.fetch_sub(1, Ordering::Relaxed);
                if success {
                    inner.session.total_downloaded += record.bytes;
                    inner.session.files_downloaded += 1;
                }
            }
        }
        if !success {
            inner.session.errors += 1;
        }

        debug!(
            "completed {}: {} ({})",
            record.direction.label(),
            record.filename,
            if success { "success" } else { "failed" }
        );
        inner.completed.push_back(record);
        while inner.completed.len() > MAX_HISTORY {
            inner.completed.pop_front();
        }
    }

    /// Instantaneous upload speed in bytes per second.
    pub fn upload_speed(&self) -> f64 {
        calculate_speed(&self.lock().upload_samples)
    }

    /// Instantaneous download speed in bytes per second.
    pub fn download_speed(&self) -> f64 {
        calculate_speed(&self.lock().download_samples)
    }

    pub fn upload_speed_string(&self) -> String {
        format_speed(self.upload_speed())
    }

    pub fn download_speed_string(&self) -> String {
        format_speed(self.download_speed())
    }

    pub fn active_uploads(&self) -> i64 {
        self.active_uploads.load(Ordering::Relaxed)
    }

    pub fn active_downloads(&self) -> i64 {
        self.active_downloads.load(Ordering::Relaxed)
    }

    /// Queue depth reported by the sync scheduler; purely a gauge.
    pub fn set_pending_transfers(&self, count: i64) {
        self.pending_transfers.store(count, Ordering::Relaxed);
    }

    pub fn pending_transfers(&self) -> i64 {
        self.pending_transfers.load(Ordering::Relaxed)
    }

    /// Most recent completed transfers, newest first.
    pub fn recent_transfers(&self, limit: usize) -> Vec<TransferRecord> {
        let inner = self.lock();
        inner.completed.iter().rev().take(limit).cloned().collect()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.lock().session.clone()
    }

    /// Bytes-per-second caps; 0 means unlimited. Stored for the transport,
    /// not enforced here.
    pub fn set_upload_limit(&self, bytes_per_second: u64) {
        self.upload_limit.store(bytes_per_second, Ordering::Relaxed);
        info!("upload limit set to {}", describe_limit(bytes_per_second));
    }

    pub fn set_download_limit(&self, bytes_per_second: u64) {
        self.download_limit.store(bytes_per_second, Ordering::Relaxed);
        info!("download limit set to {}", describe_limit(bytes_per_second));
    }

    pub fn upload_limit(&self) -> u64 {
        self.upload_limit.load(Ordering::Relaxed)
    }

    pub fn download_limit(&self) -> u64 {
        self.download_limit.load(Ordering::Relaxed)
    }

    /// Clear history, samples and cumulatives; active transfers keep going.
    pub fn reset_session(&self) {
        let mut inner = self.lock();
        inner.session = SessionStats::new();
        inner.completed.clear();
        inner.upload_samples.clear();
        inner.download_samples.clear();
        info!("session stats reset");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().expect("bandwidth monitor lock poisoned")
    }
}

fn evict_old(samples: &mut VecDeque<SpeedSample>, cutoff: Instant) {
    while samples.front().is_some_and(|(_, t)| *t < cutoff) {
        samples.pop_front();
    }
}

/// Bytes over the retained window divided by the span from the oldest
/// retained sample to now. Zero with fewer than two samples or a zero span.
fn calculate_speed(samples: &VecDeque<SpeedSample>) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let now = Instant::now();
    let cutoff = now.checked_sub(SPEED_WINDOW);
    let total_bytes: u64 = samples
        .iter()
        .filter(|(_, t)| cutoff.is_none_or(|c| *t >= c))
        .map(|(b, _)| b)
        .sum();

    let span = now.duration_since(samples.front().expect("len checked").1);
    let millis = span.as_millis();
    if millis == 0 {
        return 0.0;
    }
    (total_bytes as f64 * 1000.0) / millis as f64
}

fn describe_limit(bytes_per_second: u64) -> String {
    if bytes_per_second == 0 {
        "unlimited".to_string()
    } else {
        format_speed(bytes_per_second as f64)
    }
}

/// Human-readable speed in binary units, one decimal place above KB/s.
pub fn format_speed(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut speed = bytes_per_second;
    let mut unit = 0;
    while speed >= 1024.0 && unit < UNITS.len() - 1 {
        speed /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", speed as u64, UNITS[unit])
    } else {
        format!("{speed:.1} {}", UNITS[unit])
    }
}
