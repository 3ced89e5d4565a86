pub mod cached;

use num_complex::Complex;
use rustfft::FftPlanner;

pub use cached::{coarse_scan_parallel, CachedDsp};

pub type Complex32 = Complex<f32>;

const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// dBFS reference for a 12-bit signed ADC (2^11).
pub const DBFS_REF: f32 = 2048.0;

pub const DEFAULT_SCAN_STEP_DEG: f64 = 2.0;
pub const DEFAULT_PHASE_STEP_DEG: f64 = 1.0;
pub const DEFAULT_DEADBAND_DEG: f64 = 0.5;

/// Hamming window: `0.54 - 0.46*cos(2*pi*i/(n-1))`.
pub fn hamming(n: usize) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        _ => (0..n)
            .map(|i| {
                0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32).cos()
            })
            .collect(),
    }
}

/// Elementwise complex-by-real multiply. Length mismatch yields empty.
pub fn apply_window(samples: &[Complex32], win: &[f32]) -> Vec<Complex32> {
    if samples.len() != win.len() {
        return Vec::new();
    }
    samples.iter().zip(win).map(|(s, w)| s * *w).collect()
}

/// Rotate by floor(n/2) so the DC bin sits at the center.
pub fn fft_shift<T: Clone>(x: &[T]) -> Vec<T> {
    let half = x.len() / 2;
    let mut out = Vec::with_capacity(x.len());
    out.extend_from_slice(&x[half..]);
    out.extend_from_slice(&x[..half]);
    out
}

/// Windowed, window-sum-normalized, center-shifted complex spectrum.
pub fn windowed_fft(samples: &[Complex32]) -> Vec<Complex32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let win = hamming(samples.len());
    let win_sum: f32 = win.iter().sum();
    let mut bins = apply_window(samples, &win);
    FftPlanner::new()
        .plan_fft_forward(bins.len())
        .process(&mut bins);
    for bin in &mut bins {
        *bin /= win_sum;
    }
    fft_shift(&bins)
}

pub fn bin_dbfs(bin: Complex32) -> f32 {
    let mag = bin.norm();
    if mag == 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * (mag / DBFS_REF).log10()
    }
}

/// Per-bin magnitude spectrum in dBFS. Empty input gives empty output and
/// a zero-magnitude bin gives negative infinity; no bin is ever NaN.
pub fn fft_and_dbfs(samples: &[Complex32]) -> Vec<f32> {
    windowed_fft(samples).into_iter().map(bin_dbfs).collect()
}

/// Electrical phase difference (degrees) to steering angle (degrees) for a
/// two-element array with `spacing_wavelengths` element spacing.
pub fn phase_to_theta(phase_deg: f64, freq_hz: f64, spacing_wavelengths: f64) -> f64 {
    if freq_hz == 0.0 || spacing_wavelengths == 0.0 {
        return 0.0;
    }
    let d = spacing_wavelengths * SPEED_OF_LIGHT / freq_hz;
    let arg = phase_deg.to_radians() * SPEED_OF_LIGHT
        / (2.0 * std::f64::consts::PI * freq_hz * d);
    arg.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Exact inverse of [`phase_to_theta`].
pub fn theta_to_phase(theta_deg: f64, freq_hz: f64, spacing_wavelengths: f64) -> f64 {
    if freq_hz == 0.0 || spacing_wavelengths == 0.0 {
        return 0.0;
    }
    (theta_deg.to_radians().sin() * 2.0 * std::f64::consts::PI * spacing_wavelengths)
        .to_degrees()
}

/// Bin window around the calibration tone in a center-shifted spectrum,
/// clamped to `[0, n]`.
pub fn signal_bin_range(n: usize, sample_rate: f64, tone_offset: f64) -> (usize, usize) {
    if n == 0 || sample_rate <= 0.0 {
        return (0, n);
    }
    let n_f = n as f64;
    let start = (n_f * (sample_rate / 2.0 + tone_offset / 2.0) / sample_rate) as usize;
    let end = (n_f * (sample_rate / 2.0 + 2.0 * tone_offset) / sample_rate) as usize;
    (start.min(n), end.min(n))
}

/// Monopulse error from the sum/delta correlation over the bin window:
/// `arg(sum conj(S[i]) * D[i])` in degrees. An empty window yields zero.
pub fn monopulse_phase(sum: &[Complex32], delta: &[Complex32], start: usize, end: usize) -> f64 {
    let end = end.min(sum.len()).min(delta.len());
    if start >= end {
        return 0.0;
    }
    let mut acc = Complex32::new(0.0, 0.0);
    for i in start..end {
        acc += sum[i].conj() * delta[i];
    }
    (acc.arg() as f64).to_degrees()
}

/// Weighted-ratio monopulse variant: the |S|-weighted mean of D/S over
/// bins with non-negligible sum energy.
pub fn monopulse_phase_ratio(
    sum: &[Complex32],
    delta: &[Complex32],
    start: usize,
    end: usize,
) -> f64 {
    let end = end.min(sum.len()).min(delta.len());
    if start >= end {
        return 0.0;
    }
    let mut acc = Complex32::new(0.0, 0.0);
    let mut weight_sum = 0.0f32;
    for i in start..end {
        let w = sum[i].norm();
        if w < 1e-12 {
            continue;
        }
        acc += (delta[i] / sum[i]) * w;
        weight_sum += w;
    }
    if weight_sum == 0.0 {
        return 0.0;
    }
    ((acc / weight_sum).arg() as f64).to_degrees()
}

#[derive(Debug, Clone, Copy)]
pub struct ScanResult {
    pub delay_deg: f64,
    pub angle_deg: f64,
    pub peak_dbfs: f64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub delay_deg: f64,
    pub mono_deg: f64,
    pub peak_dbfs: f64,
}

impl Candidate {
    /// Ranking: highest peak first, smallest |monopulse error| on ties.
    pub(crate) fn better_than(&self, other: &Candidate) -> bool {
        if self.peak_dbfs != other.peak_dbfs {
            return self.peak_dbfs > other.peak_dbfs;
        }
        self.mono_deg.abs() < other.mono_deg.abs()
    }
}

pub(crate) struct ScanBuffers {
    adjusted: Vec<Complex32>,
    sum: Vec<Complex32>,
    delta: Vec<Complex32>,
}

impl ScanBuffers {
    pub(crate) fn new(n: usize) -> ScanBuffers {
        ScanBuffers {
            adjusted: vec![Complex32::new(0.0, 0.0); n],
            sum: vec![Complex32::new(0.0, 0.0); n],
            delta: vec![Complex32::new(0.0, 0.0); n],
        }
    }
}

/// Highest dBFS bin inside the window; the full band when the window is
/// empty.
fn band_peak(spectrum: &[Complex32], start: usize, end: usize) -> f64 {
    let end = end.min(spectrum.len());
    let band = if start < end {
        &spectrum[start..end]
    } else {
        spectrum
    };
    band.iter()
        .map(|b| bin_dbfs(*b) as f64)
        .fold(f64::NEG_INFINITY, f64::max)
}

/// Evaluate one phase hypothesis: shift channel one, form sum and delta
/// beams, and measure the monopulse error and sum-band peak.
pub(crate) fn evaluate_phase(
    fft: &dyn Fn(&[Complex32]) -> Vec<Complex32>,
    rx0: &[Complex32],
    rx1: &[Complex32],
    shift_deg: f64,
    start: usize,
    end: usize,
    bufs: &mut ScanBuffers,
) -> (f64, f64) {
    let rot = Complex32::from_polar(1.0, shift_deg.to_radians() as f32);
    let n = rx0.len().min(rx1.len());
    bufs.adjusted.resize(n, Complex32::new(0.0, 0.0));
    bufs.sum.resize(n, Complex32::new(0.0, 0.0));
    bufs.delta.resize(n, Complex32::new(0.0, 0.0));
    for i in 0..n {
        bufs.adjusted[i] = rx1[i] * rot;
    }
    for i in 0..n {
        bufs.sum[i] = rx0[i] + bufs.adjusted[i];
        bufs.delta[i] = rx0[i] - bufs.adjusted[i];
    }
    let sum_fft = fft(&bufs.sum);
    let delta_fft = fft(&bufs.delta);
    let mono = monopulse_phase(&sum_fft, &delta_fft, start, end);
    let peak = band_peak(&sum_fft, start, end);
    (mono, peak)
}

pub(crate) fn scan_grid(step_deg: f64) -> Vec<f64> {
    let step = if step_deg <= 0.0 {
        DEFAULT_SCAN_STEP_DEG
    } else {
        step_deg
    };
    let mut phases = Vec::new();
    let mut phase = -180.0;
    while phase < 180.0 {
        phases.push(phase);
        phase += step;
    }
    phases
}

pub(crate) fn scan_with(
    fft: &dyn Fn(&[Complex32]) -> Vec<Complex32>,
    rx0: &[Complex32],
    rx1: &[Complex32],
    phase_cal: f64,
    start: usize,
    end: usize,
    step_deg: f64,
    freq_hz: f64,
    spacing_wavelengths: f64,
) -> ScanResult {
    let mut bufs = ScanBuffers::new(rx0.len());
    let mut best: Option<Candidate> = None;
    for phase in scan_grid(step_deg) {
        let (mono, peak) = evaluate_phase(fft, rx0, rx1, phase + phase_cal, start, end, &mut bufs);
        let candidate = Candidate {
            delay_deg: phase,
            mono_deg: mono,
            peak_dbfs: peak,
        };
        if best.map_or(true, |b| candidate.better_than(&b)) {
            best = Some(candidate);
        }
    }
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

/// Sweep phase hypotheses over [-180, 180) and return the best delay, its
/// steering angle, and the sum-band peak level.
#[allow(clippy::too_many_arguments)]
pub fn coarse_scan(
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
        &windowed_fft,
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

pub(crate) fn track_with(
    fft: &dyn Fn(&[Complex32]) -> Vec<Complex32>,
    last_delay: f64,
    rx0: &[Complex32],
    rx1: &[Complex32],
    phase_cal: f64,
    start: usize,
    end: usize,
    phase_step_deg: f64,
    deadband_deg: f64,
) -> (f64, f64) {
    let step = if phase_step_deg <= 0.0 {
        DEFAULT_PHASE_STEP_DEG
    } else {
        phase_step_deg
    };
    let deadband = if deadband_deg <= 0.0 {
        DEFAULT_DEADBAND_DEG
    } else {
        deadband_deg
    };
    let mut bufs = ScanBuffers::new(rx0.len());
    let (mono, peak) = evaluate_phase(fft, rx0, rx1, last_delay + phase_cal, start, end, &mut bufs);
    let delay = if mono > deadband {
        last_delay + step
    } else if mono < -deadband {
        last_delay - step
    } else {
        // Inside the deadband: hold to avoid jitter at lock.
        last_delay
    };
    (delay, peak)
}

/// One monopulse tracking step: nudge the delay by `phase_step_deg` in the
/// direction that nulls the error, holding inside the deadband. Returns
/// the new delay and the observed sum-band peak.
#[allow(clippy::too_many_arguments)]
pub fn monopulse_track(
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
        &windowed_fft,
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
