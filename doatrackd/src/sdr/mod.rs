pub mod mock;
pub mod pluto;

use crate::config::Config;
use crate::dsp::Complex32;
use crate::error::{Error, Result};

/// int16 full scale used when converting to and from complex samples.
pub const IQ_SCALE: f32 = 32768.0;

/// Split an interleaved `[i0, q0, i1, q1, ...]` int16 stream into the two
/// receive channels, scaled to unit full scale.
pub fn deinterleave_iq(raw: &[i16]) -> (Vec<Complex32>, Vec<Complex32>) {
    let frames = raw.len() / 4;
    let mut ch0 = Vec::with_capacity(frames);
    let mut ch1 = Vec::with_capacity(frames);
    for chunk in raw.chunks_exact(4) {
        ch0.push(Complex32::new(
            chunk[0] as f32 / IQ_SCALE,
            chunk[1] as f32 / IQ_SCALE,
        ));
        ch1.push(Complex32::new(
            chunk[2] as f32 / IQ_SCALE,
            chunk[3] as f32 / IQ_SCALE,
        ));
    }
    (ch0, ch1)
}

fn quantize(x: f32) -> i16 {
    (x * IQ_SCALE).round().clamp(-32768.0, 32767.0) as i16
}

/// Inverse of [`deinterleave_iq`]; truncates to the shorter channel.
pub fn interleave_iq(ch0: &[Complex32], ch1: &[Complex32]) -> Vec<i16> {
    let frames = ch0.len().min(ch1.len());
    let mut out = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        out.push(quantize(ch0[i].re));
        out.push(quantize(ch0[i].im));
        out.push(quantize(ch1[i].re));
        out.push(quantize(ch1[i].im));
    }
    out
}

pub fn bytes_to_i16_le(raw: &[u8]) -> Vec<i16> {
    raw.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn i16_to_bytes_le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// SDR backend. A tagged variant is all the dispatch this needs: the mock
/// synthesizes two tones with a settable phase delta, the pluto variant is
/// the real radio.
pub enum Sdr {
    Mock(mock::MockSdr),
    Pluto(pluto::PlutoSdr),
}

impl Sdr {
    pub async fn init(cfg: &Config) -> Result<Sdr> {
        match cfg.backend.kind.as_str() {
            "mock" => Ok(Sdr::Mock(mock::MockSdr::from_config(cfg))),
            "pluto" => Ok(Sdr::Pluto(pluto::PlutoSdr::init(cfg).await?)),
            other => Err(Error::Config(format!("unknown backend {other:?}"))),
        }
    }

    /// One synchronized capture of both receive channels.
    pub async fn rx(&mut self) -> Result<(Vec<Complex32>, Vec<Complex32>)> {
        match self {
            Sdr::Mock(mock) => Ok(mock.rx()),
            Sdr::Pluto(pluto) => pluto.rx().await,
        }
    }

    pub async fn tx(&mut self, ch0: &[Complex32], ch1: &[Complex32]) -> Result<()> {
        match self {
            Sdr::Mock(_) => Ok(()),
            Sdr::Pluto(pluto) => pluto.tx(ch0, ch1).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Sdr::Mock(_) => Ok(()),
            Sdr::Pluto(pluto) => pluto.close().await,
        }
    }

    pub fn set_phase_delta(&mut self, deg: f64) {
        if let Sdr::Mock(mock) = self {
            mock.set_phase_delta(deg);
        }
    }

    pub fn phase_delta(&self) -> f64 {
        match self {
            Sdr::Mock(mock) => mock.phase_delta(),
            Sdr::Pluto(_) => 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Sdr::Mock(_) => "mock",
            Sdr::Pluto(_) => "pluto",
        }
    }
}
