use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dsp::{
    self, coarse_scan_parallel, phase_to_theta, signal_bin_range, CachedDsp, Complex32, ScanResult,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::sdr::Sdr;
use crate::telemetry::{ReporterList, TrackSample};

/// The orchestrator: owns the steering-angle state, runs warm-up,
/// acquisition and the monopulse correction loop, and emits telemetry.
pub struct Tracker {
    cfg: Config,
    backend: Sdr,
    dsp: CachedDsp,
    reporters: Arc<ReporterList>,
    metrics: Arc<Metrics>,
    delay_deg: f64,
    bin_window: (usize, usize),
    iteration: u64,
}

impl Tracker {
    pub fn new(
        mut cfg: Config,
        backend: Sdr,
        reporters: Arc<ReporterList>,
        metrics: Arc<Metrics>,
    ) -> Tracker {
        // Sanity defaults for zeroed steps.
        if cfg.tracking.scan_step_deg <= 0.0 {
            cfg.tracking.scan_step_deg = dsp::DEFAULT_SCAN_STEP_DEG;
        }
        if cfg.tracking.phase_step_deg <= 0.0 {
            cfg.tracking.phase_step_deg = dsp::DEFAULT_PHASE_STEP_DEG;
        }
        let bin_window = signal_bin_range(
            cfg.tracking.fft_size,
            cfg.radio.sample_rate_hz,
            cfg.radio.tone_offset_hz,
        );
        let dsp = CachedDsp::new(cfg.tracking.fft_size);
        Tracker {
            cfg,
            backend,
            dsp,
            reporters,
            metrics,
            delay_deg: 0.0,
            bin_window,
            iteration: 0,
        }
    }

    pub fn delay_deg(&self) -> f64 {
        self.delay_deg
    }

    pub fn bin_window(&self) -> (usize, usize) {
        self.bin_window
    }

    pub fn backend_mut(&mut self) -> &mut Sdr {
        &mut self.backend
    }

    /// Warm-up, acquisition, then the tracking loop until cancelled or a
    /// transport error surfaces.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        self.warm_up(&cancel).await?;
        self.acquire(&cancel).await?;
        self.track(&cancel).await
    }

    /// Warm-up and acquisition only; reports and returns the acquired
    /// bearing.
    pub async fn run_once(&mut self, cancel: CancellationToken) -> Result<ScanResult> {
        self.warm_up(&cancel).await?;
        self.acquire(&cancel).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.backend.close().await
    }

    /// Read and discard the configured number of buffers so AGC and DC
    /// offsets settle before the scan.
    async fn warm_up(&mut self, cancel: &CancellationToken) -> Result<()> {
        for _ in 0..self.cfg.tracking.warmup_buffers {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let _ = self.backend.rx().await?;
            self.metrics.record_rx_frame();
        }
        Ok(())
    }

    async fn acquire(&mut self, cancel: &CancellationToken) -> Result<ScanResult> {
        let (rx0, rx1) = loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (rx0, rx1) = self.backend.rx().await?;
            self.metrics.record_rx_frame();
            if rx0.is_empty() || rx1.is_empty() {
                warn!("empty capture during acquisition, retrying");
                self.metrics.inc_rx_empty();
                continue;
            }
            break (rx0, rx1);
        };

        let (start, end) = self.bin_window;
        let t = &self.cfg.tracking;
        let result = if t.parallel_scan {
            coarse_scan_parallel(
                &self.dsp,
                &rx0,
                &rx1,
                t.phase_cal_deg,
                start,
                end,
                t.scan_step_deg,
                self.cfg.radio.lo_hz,
                t.spacing_wavelengths,
            )
        } else {
            self.dsp.coarse_scan(
                &rx0,
                &rx1,
                t.phase_cal_deg,
                start,
                end,
                t.scan_step_deg,
                self.cfg.radio.lo_hz,
                t.spacing_wavelengths,
            )
        };
        self.delay_deg = result.delay_deg;
        self.metrics.inc_scan();
        info!(
            "acquired: delay {:.1} deg, angle {:.2} deg, peak {:.1} dBFS",
            result.delay_deg, result.angle_deg, result.peak_dbfs
        );
        self.emit("acquire", result.angle_deg, result.peak_dbfs).await;
        Ok(result)
    }

    async fn track(&mut self, cancel: &CancellationToken) -> Result<()> {
        let pace = Duration::from_millis(self.cfg.tracking.pace_ms);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.backend.rx().await {
                Ok((rx0, rx1)) => {
                    self.metrics.record_rx_frame();
                    if rx0.is_empty() || rx1.is_empty() {
                        warn!("empty capture, skipping iteration");
                        self.metrics.inc_rx_empty();
                    } else {
                        self.step(&rx0, &rx1).await;
                    }
                }
                // Negative server status is transient; the next cycle may
                // succeed. Anything else takes the tracker down.
                Err(Error::Status { op, dev, code }) => {
                    warn!("transient rx status {code} (op {op}, dev {dev}), retrying");
                    self.metrics.inc_transport_error();
                }
                Err(err) => {
                    self.metrics.inc_transport_error();
                    return Err(err);
                }
            }

            if pace > Duration::ZERO {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(pace) => {}
                }
            } else {
                // The mock backend completes without suspending; keep the
                // loop cooperative.
                tokio::task::yield_now().await;
            }
        }
    }

    async fn step(&mut self, rx0: &[Complex32], rx1: &[Complex32]) {
        let (start, end) = self.bin_window;
        let t = &self.cfg.tracking;
        let (delay, peak) = self.dsp.monopulse_track(
            self.delay_deg,
            rx0,
            rx1,
            t.phase_cal_deg,
            start,
            end,
            t.phase_step_deg,
            t.deadband_deg,
        );
        self.delay_deg = delay;
        self.metrics.inc_track_iteration();
        let angle = phase_to_theta(delay, self.cfg.radio.lo_hz, t.spacing_wavelengths);
        self.emit("track", angle, peak).await;
    }

    async fn emit(&mut self, stage: &'static str, angle_deg: f64, peak_dbfs: f64) {
        self.iteration += 1;
        let sample = TrackSample::now(stage, self.iteration, angle_deg, self.delay_deg, peak_dbfs);
        self.reporters.report(&sample).await;
    }
}
