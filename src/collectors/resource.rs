//! Resource metrics collector
//!
//! Samples the engine's own process and the host at a fixed interval and
//! writes the readings into the time-series store. Every metric read is
//! isolated: a failure to read one source logs a warning and skips that
//! metric for the tick, never aborting the rest of the batch.

use crate::error::{CollectError, StoreError};
use crate::model::SeriesKey;
use crate::store::TimeSeriesStore;
use chrono::Utc;
use log::{error, info, warn};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Resident set size of the engine process, in bytes
pub const SELF_RSS_METRIC: &str = "process_resident_memory_bytes";
/// Cumulative user plus system CPU time of the engine process, in seconds
pub const SELF_CPU_METRIC: &str = "process_cpu_seconds_total";
/// Used fraction of the root filesystem, in percent
pub const DISK_USED_METRIC: &str = "host_disk_used_percent";
/// Bytes received across all host network interfaces since boot
pub const NET_RX_METRIC: &str = "host_network_rx_bytes_total";
/// Bytes transmitted across all host network interfaces since boot
pub const NET_TX_METRIC: &str = "host_network_tx_bytes_total";

/// Samples process and host resource usage into the store
pub struct ResourceCollector {
    store: Arc<TimeSeriesStore>,
    interval: Duration,
    /// Watched external processes, service name to pid
    watched: RwLock<HashMap<String, u32>>,
    store_down: AtomicBool,
}

impl ResourceCollector {
    pub fn new(store: Arc<TimeSeriesStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            watched: RwLock::new(HashMap::new()),
            store_down: AtomicBool::new(false),
        }
    }

    /// Start sampling the resident memory of an external process
    ///
    /// Replaces an existing watch for the same service name. The process is
    /// sampled through `/proc/<pid>`; a vanished pid degrades to a per-tick
    /// read failure for that service only.
    pub fn watch_process(&self, service: &str, pid: u32) {
        info!("watching process {} for service '{}'", pid, service);
        if let Ok(mut watched) = self.watched.write() {
            watched.insert(service.to_string(), pid);
        }
    }

    /// Stop sampling a watched process
    pub fn unwatch_process(&self, service: &str) -> bool {
        match self.watched.write() {
            Ok(mut watched) => watched.remove(service).is_some(),
            Err(_) => false,
        }
    }

    /// Run one sampling pass over all metrics
    ///
    /// Failures are isolated per metric; the pass always completes.
    pub fn collect_tick(&self) {
        let readings: [(SeriesKey, Result<f64, CollectError>); 5] = [
            (SeriesKey::bare(SELF_RSS_METRIC), self_resident_memory()),
            (SeriesKey::bare(SELF_CPU_METRIC), self_cpu_seconds()),
            (SeriesKey::bare(DISK_USED_METRIC), disk_used_percent("/")),
            (SeriesKey::bare(NET_RX_METRIC), network_bytes().map(|(rx, _)| rx)),
            (SeriesKey::bare(NET_TX_METRIC), network_bytes().map(|(_, tx)| tx)),
        ];

        for (key, reading) in readings {
            match reading {
                Ok(value) => self.record(&key, value),
                Err(e) => warn!("skipping metric this tick: {}", e),
            }
        }

        let watched: Vec<(String, u32)> = match self.watched.read() {
            Ok(watched) => watched.iter().map(|(s, p)| (s.clone(), *p)).collect(),
            Err(_) => Vec::new(),
        };
        for (service, pid) in watched {
            let key = SeriesKey::new(SELF_RSS_METRIC, &[("service", service.as_str())]);
            match process_resident_memory(pid) {
                Ok(value) => self.record(&key, value),
                Err(e) => warn!("skipping watched process '{}' this tick: {}", service, e),
            }
        }
    }

    fn record(&self, key: &SeriesKey, value: f64) {
        match self.store.write(key, Utc::now(), value) {
            Ok(()) => {}
            Err(e @ StoreError::OutOfOrderSample { .. }) => {
                warn!("dropping collector sample: {}", e);
            }
            Err(e @ StoreError::Unavailable(_)) => {
                error!("store rejected collector write: {}", e);
                self.store_down.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Sampling loop
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` when the store stops accepting
    /// writes.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("resource collector started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_tick();
                    if self.store_down.load(Ordering::SeqCst) {
                        return Err(StoreError::Unavailable(
                            "collector writes rejected".to_string(),
                        ));
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("resource collector stopped");
        Ok(())
    }
}

/// Resident set size of this process in bytes
fn self_resident_memory() -> Result<f64, CollectError> {
    #[cfg(target_os = "linux")]
    {
        let status = fs::read_to_string("/proc/self/status").map_err(|e| {
            CollectError::MetricReadFailed {
                metric: SELF_RSS_METRIC.to_string(),
                detail: format!("/proc/self/status: {}", e),
            }
        })?;
        if let Some(bytes) = parse_vm_rss(&status) {
            return Ok(bytes);
        }
    }

    // Peak rather than current RSS, but better than no sample
    rusage_self()
        .map(|usage| {
            #[cfg(target_os = "macos")]
            let bytes = usage.ru_maxrss as f64;
            #[cfg(not(target_os = "macos"))]
            let bytes = (usage.ru_maxrss * 1024) as f64;
            bytes
        })
        .ok_or_else(|| CollectError::MetricReadFailed {
            metric: SELF_RSS_METRIC.to_string(),
            detail: "getrusage failed".to_string(),
        })
}

/// Cumulative user plus system CPU seconds of this process
fn self_cpu_seconds() -> Result<f64, CollectError> {
    let usage = rusage_self().ok_or_else(|| CollectError::MetricReadFailed {
        metric: SELF_CPU_METRIC.to_string(),
        detail: "getrusage failed".to_string(),
    })?;
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Ok(seconds(usage.ru_utime) + seconds(usage.ru_stime))
}

fn rusage_self() -> Option<libc::rusage> {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
            Some(usage)
        } else {
            None
        }
    }
}

/// Used percentage of the filesystem at the given mount point
fn disk_used_percent(mount: &str) -> Result<f64, CollectError> {
    let read_failed = |detail: String| CollectError::MetricReadFailed {
        metric: DISK_USED_METRIC.to_string(),
        detail,
    };
    let path = std::ffi::CString::new(mount)
        .map_err(|_| read_failed("mount path contains a NUL byte".to_string()))?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(path.as_ptr(), &mut stat) != 0 {
            return Err(read_failed(format!(
                "statvfs({}): {}",
                mount,
                std::io::Error::last_os_error()
            )));
        }
        if stat.f_blocks == 0 {
            return Err(read_failed(format!("statvfs({}): zero block count", mount)));
        }
        let total = stat.f_blocks as f64;
        let free = stat.f_bfree as f64;
        Ok((total - free) / total * 100.0)
    }
}

/// Total bytes received and transmitted across all host interfaces
fn network_bytes() -> Result<(f64, f64), CollectError> {
    let read_failed = |detail: String| CollectError::MetricReadFailed {
        metric: NET_RX_METRIC.to_string(),
        detail,
    };
    let dev = fs::read_to_string("/proc/net/dev")
        .map_err(|e| read_failed(format!("/proc/net/dev: {}", e)))?;
    parse_net_dev(&dev).ok_or_else(|| read_failed("unparseable /proc/net/dev".to_string()))
}

/// Resident set size of an arbitrary process, via `/proc/<pid>/status`
fn process_resident_memory(pid: u32) -> Result<f64, CollectError> {
    let path = format!("/proc/{}/status", pid);
    let status = fs::read_to_string(&path).map_err(|e| CollectError::MetricReadFailed {
        metric: SELF_RSS_METRIC.to_string(),
        detail: format!("{}: {}", path, e),
    })?;
    parse_vm_rss(&status).ok_or_else(|| CollectError::MetricReadFailed {
        metric: SELF_RSS_METRIC.to_string(),
        detail: format!("{}: no VmRSS line", path),
    })
}

/// Extract the VmRSS value, in bytes, from `/proc/<pid>/status` content
fn parse_vm_rss(status: &str) -> Option<f64> {
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
            return Some((kb * 1024) as f64);
        }
    }
    None
}

/// Sum rx/tx byte counters over all interfaces in `/proc/net/dev` content
fn parse_net_dev(dev: &str) -> Option<(f64, f64)> {
    let mut rx_total: u64 = 0;
    let mut tx_total: u64 = 0;
    let mut saw_interface = false;

    // First two lines are headers; data lines are "iface: rx_bytes ... tx_bytes ..."
    for line in dev.lines().skip(2) {
        let (_, counters) = line.split_once(':')?;
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 16 {
            return None;
        }
        rx_total += fields[0].parse::<u64>().ok()?;
        tx_total += fields[8].parse::<u64>().ok()?;
        saw_interface = true;
    }

    if saw_interface {
        Some((rx_total as f64, tx_total as f64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RetentionPolicy;

    fn test_store() -> Arc<TimeSeriesStore> {
        Arc::new(TimeSeriesStore::new(
            RetentionPolicy::default(),
            chrono::Duration::seconds(2),
        ))
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tvantage\nVmPeak:\t  20000 kB\nVmRSS:\t  12345 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss(status), Some(12345.0 * 1024.0));
    }

    #[test]
    fn test_parse_vm_rss_missing_line() {
        assert_eq!(parse_vm_rss("Name:\tvantage\nThreads:\t8\n"), None);
    }

    #[test]
    fn test_parse_net_dev_sums_interfaces() {
        let dev = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:     100       2    0    0    0     0          0         0      100       2    0    0    0     0       0          0
  eth0:    1000      10    0    0    0     0          0         0     2000      20    0    0    0     0       0          0
";
        assert_eq!(parse_net_dev(dev), Some((1100.0, 2100.0)));
    }

    #[test]
    fn test_parse_net_dev_rejects_garbage() {
        assert_eq!(parse_net_dev("header\nheader\nnot a counter line\n"), None);
    }

    #[test]
    fn test_self_cpu_seconds_is_monotone_nonnegative() {
        let first = self_cpu_seconds().unwrap();
        assert!(first >= 0.0);
        // Burn a little CPU so the second reading cannot go backwards.
        let mut acc = 0u64;
        for i in 0..100_000u64 {
            acc = acc.wrapping_add(i * i);
        }
        std::hint::black_box(acc);
        let second = self_cpu_seconds().unwrap();
        assert!(second >= first);
    }

    #[test]
    fn test_disk_used_percent_in_range() {
        let used = disk_used_percent("/").unwrap();
        assert!((0.0..=100.0).contains(&used), "used = {}", used);
    }

    #[test]
    fn test_collect_tick_populates_self_metrics() {
        let store = test_store();
        let collector = ResourceCollector::new(Arc::clone(&store), Duration::from_secs(10));
        collector.collect_tick();

        assert!(store.latest(&SeriesKey::bare(SELF_RSS_METRIC)).is_some());
        assert!(store.latest(&SeriesKey::bare(SELF_CPU_METRIC)).is_some());
        let rss = store.latest(&SeriesKey::bare(SELF_RSS_METRIC)).unwrap();
        assert!(rss.value > 0.0);
    }

    #[test]
    fn test_dead_watched_process_does_not_abort_tick() {
        let store = test_store();
        let collector = ResourceCollector::new(Arc::clone(&store), Duration::from_secs(10));
        // A pid from the reserved high range that cannot exist.
        collector.watch_process("ghost", u32::MAX - 1);
        collector.collect_tick();

        // Self metrics still collected despite the dead watch.
        assert!(store.latest(&SeriesKey::bare(SELF_RSS_METRIC)).is_some());
        let ghost_key = SeriesKey::new(SELF_RSS_METRIC, &[("service", "ghost")]);
        assert!(store.latest(&ghost_key).is_none());
    }

    #[test]
    fn test_watch_unwatch() {
        let collector = ResourceCollector::new(test_store(), Duration::from_secs(10));
        collector.watch_process("svc", std::process::id());
        assert!(collector.unwatch_process("svc"));
        assert!(!collector.unwatch_process("svc"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_watched_live_process_is_sampled() {
        let store = test_store();
        let collector = ResourceCollector::new(Arc::clone(&store), Duration::from_secs(10));
        collector.watch_process("self", std::process::id());
        collector.collect_tick();

        let key = SeriesKey::new(SELF_RSS_METRIC, &[("service", "self")]);
        assert!(store.latest(&key).unwrap().value > 0.0);
    }
}
