use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::dsp::Complex32;

/// Synthetic two-channel source: the calibration tone on both channels,
/// channel one shifted by a settable phase delta, plus additive Gaussian
/// noise at the configured SNR. Lets the whole tracking loop run without a
/// radio attached.
pub struct MockSdr {
    samples: usize,
    cycles_per_buffer: f64,
    phase_delta_deg: f64,
    noise_sigma: f32,
    phase_acc: f64,
    rng: StdRng,
}

impl MockSdr {
    pub fn from_config(cfg: &Config) -> MockSdr {
        MockSdr::new(
            cfg.tracking.fft_size,
            cfg.radio.sample_rate_hz,
            cfg.radio.tone_offset_hz,
            cfg.backend.mock_phase_delta_deg,
            cfg.backend.mock_snr_db,
        )
    }

    pub fn new(
        samples: usize,
        sample_rate_hz: f64,
        tone_offset_hz: f64,
        phase_delta_deg: f64,
        snr_db: f64,
    ) -> MockSdr {
        let cycles_per_buffer = if sample_rate_hz > 0.0 {
            tone_offset_hz / sample_rate_hz * samples as f64
        } else {
            0.0
        };
        // Unit-power tone; noise power from the SNR, split evenly over the
        // real and imaginary parts.
        let noise_power = 10f64.powf(-snr_db / 10.0);
        MockSdr {
            samples,
            cycles_per_buffer,
            phase_delta_deg,
            noise_sigma: (noise_power / 2.0).sqrt() as f32,
            phase_acc: 0.0,
            rng: StdRng::seed_from_u64(0x50_44_4f_41),
        }
    }

    pub fn set_phase_delta(&mut self, deg: f64) {
        self.phase_delta_deg = deg;
    }

    pub fn phase_delta(&self) -> f64 {
        self.phase_delta_deg
    }

    fn gaussian(&mut self) -> f32 {
        // Box-Muller transform over two uniform draws.
        let u1: f32 = self.rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }

    pub fn rx(&mut self) -> (Vec<Complex32>, Vec<Complex32>) {
        let n = self.samples;
        let mut ch0 = Vec::with_capacity(n);
        let mut ch1 = Vec::with_capacity(n);
        let delta = self.phase_delta_deg.to_radians();
        for k in 0..n {
            let arg = 2.0 * std::f64::consts::PI * self.cycles_per_buffer * k as f64 / n as f64
                + self.phase_acc;
            let s0 = Complex32::from_polar(1.0, arg as f32);
            let s1 = Complex32::from_polar(1.0, (arg + delta) as f32);
            let n0 = Complex32::new(self.gaussian(), self.gaussian()) * self.noise_sigma;
            let n1 = Complex32::new(self.gaussian(), self.gaussian()) * self.noise_sigma;
            ch0.push(s0 + n0);
            ch1.push(s1 + n1);
        }
        // Keep the tone phase-continuous across buffers.
        self.phase_acc = (self.phase_acc
            + 2.0 * std::f64::consts::PI * self.cycles_per_buffer)
            % (2.0 * std::f64::consts::PI);
        (ch0, ch1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::{coarse_scan, signal_bin_range};

    #[test]
    fn mock_channels_carry_the_configured_shift() {
        let mut sdr = MockSdr::new(1024, 2e6, 200e3, 30.0, 30.0);
        let (rx0, rx1) = sdr.rx();
        assert_eq!(rx0.len(), 1024);
        let (start, end) = signal_bin_range(1024, 2e6, 200e3);
        let result = coarse_scan(&rx0, &rx1, 0.0, start, end, 2.0, 2.3e9, 0.5);
        assert!(
            (result.delay_deg + 30.0).abs() <= 3.0,
            "delay {}",
            result.delay_deg
        );
    }

    #[test]
    fn phase_delta_is_settable() {
        let mut sdr = MockSdr::new(256, 2e6, 200e3, 10.0, 40.0);
        sdr.set_phase_delta(-45.0);
        assert_eq!(sdr.phase_delta(), -45.0);
        let (rx0, rx1) = sdr.rx();
        let (start, end) = signal_bin_range(256, 2e6, 200e3);
        let result = coarse_scan(&rx0, &rx1, 0.0, start, end, 1.0, 2.3e9, 0.5);
        assert!(
            (result.delay_deg - 45.0).abs() <= 3.0,
            "delay {}",
            result.delay_deg
        );
    }
}
