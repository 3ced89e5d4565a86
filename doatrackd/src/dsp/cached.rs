use std::sync::{Arc, Mutex, RwLock};

use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use super::{
    apply_window, fft_shift, hamming, phase_to_theta, scan_grid, scan_with, track_with, bin_dbfs,
    Candidate, Complex32, ScanBuffers, ScanResult,
};

struct Plan {
    size: usize,
    window: Vec<f32>,
    window_sum: f32,
    fft: Arc<dyn Fft<f32>>,
}

impl Plan {
    fn build(size: usize) -> Plan {
        let window = hamming(size);
        let window_sum = window.iter().sum();
        let fft = FftPlanner::new().plan_fft_forward(size);
        Plan {
            size,
            window,
            window_sum,
            fft,
        }
    }
}

/// Pre-built Hamming window, window sum, and one reusable FFT plan for a
/// fixed transform size. The window and sum are immutable after
/// construction; concurrent callers serialize over the plan's scratch.
/// Inputs of any other length fall back to the uncached path.
pub struct CachedDsp {
    plan: RwLock<Arc<Plan>>,
    scratch: Mutex<Vec<Complex32>>,
}

impl CachedDsp {
    pub fn new(size: usize) -> CachedDsp {
        CachedDsp {
            plan: RwLock::new(Arc::new(Plan::build(size))),
            scratch: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.plan.read().unwrap().size
    }

    /// Atomically rebuild the window and plan for a new transform size.
    pub fn update_size(&self, size: usize) {
        let plan = Arc::new(Plan::build(size));
        *self.plan.write().unwrap() = plan;
        self.scratch.lock().unwrap().clear();
    }

    /// Cached counterpart of [`super::windowed_fft`].
    pub fn windowed_fft(&self, samples: &[Complex32]) -> Vec<Complex32> {
        let plan = Arc::clone(&self.plan.read().unwrap());
        if samples.len() != plan.size {
            return super::windowed_fft(samples);
        }
        if samples.is_empty() {
            return Vec::new();
        }
        let mut bins = apply_window(samples, &plan.window);
        {
            let mut scratch = self.scratch.lock().unwrap();
            let needed = plan.fft.get_inplace_scratch_len();
            if scratch.len() < needed {
                scratch.resize(needed, Complex32::new(0.0, 0.0));
            }
            plan.fft.process_with_scratch(&mut bins, &mut scratch[..needed]);
        }
        for bin in &mut bins {
            *bin /= plan.window_sum;
        }
        fft_shift(&bins)
    }

    pub fn fft_and_dbfs(&self, samples: &[Complex32]) -> Vec<f32> {
        self.windowed_fft(samples)
            .into_iter()
            .map(bin_dbfs)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn coarse_scan(
        &self,
        rx0: &[Complex32],
        rx1: &[Complex32],
        phase_cal: f64,
        start_bin: usize,
        end_bin: usize,
        step_deg: f64,
        freq_hz: f64,
        spacing_wavelengths: f64,
    ) -> ScanResult {
        scan_with(
            &|s| self.windowed_fft(s),
            rx0,
            rx1,
            phase_cal,
            start_bin,
            end_bin,
            step_deg,
            freq_hz,
            spacing_wavelengths,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn monopulse_track(
        &self,
        last_delay: f64,
        rx0: &[Complex32],
        rx1: &[Complex32],
        phase_cal: f64,
        start_bin: usize,
        end_bin: usize,
        phase_step_deg: f64,
        deadband_deg: f64,
    ) -> (f64, f64) {
        track_with(
            &|s| self.windowed_fft(s),
            last_delay,
            rx0,
            rx1,
            phase_cal,
            start_bin,
            end_bin,
            phase_step_deg,
            deadband_deg,
        )
    }
}

/// Coarse scan with the phase grid partitioned across the rayon pool (one
/// worker per host CPU). Each worker owns its scratch beams; the reduction
/// applies the same peak-then-|mono| ordering as the sequential scan.
#[allow(clippy::too_many_arguments)]
pub fn coarse_scan_parallel(
    dsp: &CachedDsp,
    rx0: &[Complex32],
    rx1: &[Complex32],
    phase_cal: f64,
    start_bin: usize,
    end_bin: usize,
    step_deg: f64,
    freq_hz: f64,
    spacing_wavelengths: f64,
) -> ScanResult {
    let fft = |s: &[Complex32]| dsp.windowed_fft(s);
    let best = scan_grid(step_deg)
        .par_iter()
        .map_init(
            || ScanBuffers::new(rx0.len()),
            |bufs, &phase| {
                let (mono, peak) = super::evaluate_phase(
                    &fft,
                    rx0,
                    rx1,
                    phase + phase_cal,
                    start_bin,
                    end_bin,
                    bufs,
                );
                Candidate {
                    delay_deg: phase,
                    mono_deg: mono,
                    peak_dbfs: peak,
                }
            },
        )
        .reduce_with(|a, b| if b.better_than(&a) { b } else { a });

    let best = best.unwrap_or(Candidate {
        delay_deg: 0.0,
        mono_deg: 0.0,
        peak_dbfs: f64::NEG_INFINITY,
    });
    ScanResult {
        delay_deg: best.delay_deg,
        angle_deg: phase_to_theta(best.delay_deg, freq_hz, spacing_wavelengths),
        peak_dbfs: best.peak_dbfs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::tests::tone;
    use crate::dsp::{coarse_scan, signal_bin_range};

    #[test]
    fn cached_spectrum_matches_uncached() {
        let samples = tone(256, 25.6, 10.0);
        let dsp = CachedDsp::new(256);
        let cached = dsp.windowed_fft(&samples);
        let plain = crate::dsp::windowed_fft(&samples);
        for (a, b) in cached.iter().zip(&plain) {
            assert!((a - b).norm() < 1e-6);
        }
    }

    #[test]
    fn size_mismatch_falls_back() {
        let samples = tone(128, 12.8, 0.0);
        let dsp = CachedDsp::new(256);
        let out = dsp.windowed_fft(&samples);
        assert_eq!(out.len(), 128);
    }

    #[test]
    fn update_size_rebuilds_the_plan() {
        let dsp = CachedDsp::new(256);
        dsp.update_size(512);
        assert_eq!(dsp.size(), 512);
        let out = dsp.windowed_fft(&tone(512, 51.2, 0.0));
        assert_eq!(out.len(), 512);
    }

    #[test]
    fn parallel_scan_agrees_with_sequential() {
        let n = 512;
        let rx0 = tone(n, 51.2, 0.0);
        let rx1 = tone(n, 51.2, 30.0);
        let (start, end) = signal_bin_range(n, 2e6, 200e3);
        let dsp = CachedDsp::new(n);

        let seq = coarse_scan(&rx0, &rx1, 0.0, start, end, 2.0, 2.3e9, 0.5);
        let par = coarse_scan_parallel(&dsp, &rx0, &rx1, 0.0, start, end, 2.0, 2.3e9, 0.5);
        assert_eq!(seq.delay_deg, par.delay_deg);
        assert!((seq.peak_dbfs - par.peak_dbfs).abs() < 1e-6);
    }
}
