//! Resident memory sampling for streaming runs.
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Current resident set size in bytes, `None` where `/proc` is unavailable.
pub fn current_rss() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Background sampler recording the highest resident set size seen.
pub struct PeakRss {
    peak: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeakRss {
    pub fn start() -> Self {
        PeakRss::start_with(SAMPLE_INTERVAL)
    }

    pub fn start_with(interval: Duration) -> Self {
        let peak = Arc::new(AtomicU64::new(current_rss().unwrap_or(0)));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let peak = peak.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(rss) = current_rss() {
                        peak.fetch_max(rss, Ordering::Relaxed);
                    }
                    thread::sleep(interval);
                }
            })
        };

        PeakRss {
            peak,
            stop,
            handle: Some(handle),
        }
    }

    /// Highest sample so far, in bytes.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Stops sampling and returns the peak, including one final sample.
    pub fn stop(mut self) -> u64 {
        self.shutdown();
        self.peak()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            if let Some(rss) = current_rss() {
                self.peak.fetch_max(rss, Ordering::Relaxed);
            }
            trace!("RSS sampler stopped, peak {} bytes", self.peak());
        }
    }
}

impl Drop for PeakRss {
    fn drop(&mut self) {
        self.shutdown();
    }
}
