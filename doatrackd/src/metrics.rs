use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global counters for the tracking daemon.
///
/// Updated from the capture path, so every field is atomic.
pub struct Metrics {
    pub start_time: SystemTime,
    rx_frames_total: AtomicU64,
    rx_frames_this_sec: AtomicU64,
    rx_frames_per_sec: AtomicU64,
    rx_empty_total: AtomicU64,
    transport_errors_total: AtomicU64,
    scans_total: AtomicU64,
    track_iterations_total: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            rx_frames_total: AtomicU64::new(0),
            rx_frames_this_sec: AtomicU64::new(0),
            rx_frames_per_sec: AtomicU64::new(0),
            rx_empty_total: AtomicU64::new(0),
            transport_errors_total: AtomicU64::new(0),
            scans_total: AtomicU64::new(0),
            track_iterations_total: AtomicU64::new(0),
        }
    }

    pub fn record_rx_frame(&self) {
        self.rx_frames_total.fetch_add(1, Ordering::Relaxed);
        self.rx_frames_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once a second to refresh the frames-per-second gauge.
    pub fn rollup(&self) {
        let per_sec = self.rx_frames_this_sec.swap(0, Ordering::Relaxed);
        self.rx_frames_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn rx_frames_per_sec(&self) -> u64 {
        self.rx_frames_per_sec.load(Ordering::Relaxed)
    }

    pub fn rx_frames_total(&self) -> u64 {
        self.rx_frames_total.load(Ordering::Relaxed)
    }

    pub fn inc_rx_empty(&self) {
        self.rx_empty_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rx_empty_total(&self) -> u64 {
        self.rx_empty_total.load(Ordering::Relaxed)
    }

    pub fn inc_transport_error(&self) {
        self.transport_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_errors_total(&self) -> u64 {
        self.transport_errors_total.load(Ordering::Relaxed)
    }

    pub fn inc_scan(&self) {
        self.scans_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scans_total(&self) -> u64 {
        self.scans_total.load(Ordering::Relaxed)
    }

    pub fn inc_track_iteration(&self) {
        self.track_iterations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn track_iterations_total(&self) -> u64 {
        self.track_iterations_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_resets_the_per_second_counter() {
        let m = Metrics::new();
        m.record_rx_frame();
        m.record_rx_frame();
        m.rollup();
        assert_eq!(m.rx_frames_per_sec(), 2);
        assert_eq!(m.rx_frames_total(), 2);
        m.rollup();
        assert_eq!(m.rx_frames_per_sec(), 0);
    }
}
