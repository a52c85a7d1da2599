//! Connectivity and metered-connection monitoring.
//!
//! A single background task probes every 10 seconds: kernel carrier state
//! for a fixed set of interfaces with an HTTPS reachability fallback, and the
//! system connection manager for the metered attribute. State changes are
//! pushed to one subscriber callback; no history is kept.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::index::lister::ensure_valid_cwd;

pub type StatusCallback = Arc<dyn Fn(bool, bool) + Send + Sync>;

/// Timeout for the HTTPS reachability fallback.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe cadence, split into short sleeps for responsive shutdown.
const PROBE_SUBSLEEP: Duration = Duration::from_millis(100);
const PROBE_SUBSLEEPS_PER_CYCLE: u32 = 100;

pub struct NetworkMonitor {
    probe_url: String,
    interfaces: Vec<String>,
    online: Arc<AtomicBool>,
    metered: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<StatusCallback>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("metered", &self.is_metered())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl NetworkMonitor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            probe_url: config.probe_url.clone(),
            interfaces: config.interfaces.clone(),
            online: Arc::new(AtomicBool::new(true)),
            metered: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let handle = tokio::spawn(monitor_loop(MonitorState {
            probe_url: self.probe_url.clone(),
            interfaces: self.interfaces.clone(),
            online: self.online.clone(),
            metered: self.metered.clone(),
            running: self.running.clone(),
            callback: self.callback.clone(),
        }));
        *self.task.lock().expect("network monitor lock poisoned") = Some(handle);
        info!("network monitor started");
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.task.lock().expect("network monitor lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("network monitor stopped");
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_metered(&self) -> bool {
        self.metered.load(Ordering::SeqCst)
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.callback.lock().expect("network monitor lock poisoned") = Some(callback);
    }

    /// One-shot connectivity probe, independent of the background loop.
    pub async fn check_connectivity(&self) -> bool {
        probe_connectivity(&self.interfaces, &self.probe_url).await
    }
}

struct MonitorState {
    probe_url: String,
    interfaces: Vec<String>,
    online: Arc<AtomicBool>,
    metered: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    callback: Arc<Mutex<Option<StatusCallback>>>,
}

async fn monitor_loop(state: MonitorState) {
    let mut was_online = true;
    let mut was_metered = false;

    while state.running.load(Ordering::SeqCst) {
        let now_online = probe_connectivity(&state.interfaces, &state.probe_url).await;
        let now_metered = probe_metered().await;

        state.online.store(now_online, Ordering::SeqCst);
        state.metered.store(now_metered, Ordering::SeqCst);

        if now_online != was_online || now_metered != was_metered {
            if now_online && !was_online {
                info!("network connection restored");
            } else if !now_online && was_online {
                warn!("network connection lost");
            }
            if now_metered && !was_metered {
                info!("metered connection detected");
            }

            let callback = state
                .callback
                .lock()
                .expect("network monitor lock poisoned")
                .clone();
            if let Some(callback) = callback {
                callback(now_online, now_metered);
            }

            was_online = now_online;
            was_metered = now_metered;
        }

        for _ in 0..PROBE_SUBSLEEPS_PER_CYCLE {
            if !state.running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(PROBE_SUBSLEEP).await;
        }
    }
}

/// Carrier state first (no I/O beyond sysfs), HTTPS reachability second.
/// Probe failures count as offline.
async fn probe_connectivity(interfaces: &[String], probe_url: &str) -> bool {
    for iface in interfaces {
        let carrier_path = format!("/sys/class/net/{iface}/carrier");
        if let Ok(contents) = std::fs::read_to_string(&carrier_path) {
            if contents.trim() == "1" {
                return true;
            }
        }
    }

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("could not build connectivity probe client: {e}");
            return false;
        }
    };
    match client.get(probe_url).send().await {
        Ok(_) => true,
        Err(e) => {
            debug!("connectivity probe failed: {e}");
            false
        }
    }
}

/// Ask the connection manager whether the first device reports a metered
/// link. `yes` and `guess-yes` both count.
async fn probe_metered() -> bool {
    ensure_valid_cwd();

    let output = Command::new("nmcli")
        .args(["-t", "-f", "GENERAL.METERED", "dev", "show"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    let Ok(output) = output else {
        return false;
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let Some(first) = stdout.lines().next() else {
        return false;
    };
    let value = first.rsplit(':').next().unwrap_or("").trim();
    value == "yes" || value == "guess-yes"
}
