use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};

const DEFAULT_CONFIG_PATH: &str = "/etc/doatrack/doatrack.toml";
const ENV_CONFIG_PATH: &str = "DOATRACK_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `DOATRACK_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Reject inconsistent scalars before any hardware is touched.
    pub fn validate(&self) -> Result<()> {
        let t = &self.tracking;
        if t.fft_size == 0 || !t.fft_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "fft_size must be a power of two, got {}",
                t.fft_size
            )));
        }
        if self.radio.sample_rate_hz <= 0.0 {
            return Err(Error::Config("sample_rate_hz must be positive".into()));
        }
        if self.radio.tone_offset_hz.abs() >= self.radio.sample_rate_hz / 2.0 {
            return Err(Error::Config(
                "tone_offset_hz must sit inside the Nyquist band".into(),
            ));
        }
        if t.spacing_wavelengths <= 0.0 {
            return Err(Error::Config("spacing_wavelengths must be positive".into()));
        }
        if self.backend.kind != "mock" && self.backend.kind != "pluto" {
            return Err(Error::Config(format!(
                "backend kind must be mock or pluto, got {:?}",
                self.backend.kind
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    #[serde(default = "default_lo")]
    pub lo_hz: f64,
    #[serde(default = "default_tone_offset")]
    pub tone_offset_hz: f64,
    #[serde(default = "default_rx_gain")]
    pub rx_gain_db: f64,
    #[serde(default = "default_tx_gain")]
    pub tx_gain_db: f64,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_hz: f64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            sample_rate_hz: default_sample_rate(),
            lo_hz: default_lo(),
            tone_offset_hz: default_tone_offset(),
            rx_gain_db: default_rx_gain(),
            tx_gain_db: default_tx_gain(),
            bandwidth_hz: default_bandwidth(),
        }
    }
}

fn default_uri() -> String {
    "192.168.2.1:30431".to_string()
}
fn default_sample_rate() -> f64 {
    2_000_000.0
}
fn default_lo() -> f64 {
    2_300_000_000.0
}
fn default_tone_offset() -> f64 {
    200_000.0
}
fn default_rx_gain() -> f64 {
    40.0
}
fn default_tx_gain() -> f64 {
    -20.0
}
fn default_bandwidth() -> f64 {
    1_000_000.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_track_length")]
    pub track_length: usize,
    #[serde(default = "default_phase_step")]
    pub phase_step_deg: f64,
    #[serde(default = "default_scan_step")]
    pub scan_step_deg: f64,
    #[serde(default)]
    pub phase_cal_deg: f64,
    #[serde(default = "default_spacing")]
    pub spacing_wavelengths: f64,
    #[serde(default = "default_warmup_buffers")]
    pub warmup_buffers: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_deadband")]
    pub deadband_deg: f64,
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
    #[serde(default)]
    pub parallel_scan: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            track_length: default_track_length(),
            phase_step_deg: default_phase_step(),
            scan_step_deg: default_scan_step(),
            phase_cal_deg: 0.0,
            spacing_wavelengths: default_spacing(),
            warmup_buffers: default_warmup_buffers(),
            history_limit: default_history_limit(),
            deadband_deg: default_deadband(),
            pace_ms: default_pace_ms(),
            parallel_scan: false,
        }
    }
}

fn default_fft_size() -> usize {
    1024
}
fn default_track_length() -> usize {
    1024
}
fn default_phase_step() -> f64 {
    1.0
}
fn default_scan_step() -> f64 {
    2.0
}
fn default_spacing() -> f64 {
    0.5
}
fn default_warmup_buffers() -> usize {
    4
}
fn default_history_limit() -> usize {
    1024
}
fn default_deadband() -> f64 {
    0.5
}
fn default_pace_ms() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    /// Inter-channel phase shift the mock applies to channel one.
    #[serde(default = "default_mock_phase_delta")]
    pub mock_phase_delta_deg: f64,
    #[serde(default = "default_mock_snr")]
    pub mock_snr_db: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            mock_phase_delta_deg: default_mock_phase_delta(),
            mock_snr_db: default_mock_snr(),
        }
    }
}

fn default_backend_kind() -> String {
    "mock".to_string()
}
fn default_mock_phase_delta() -> f64 {
    30.0
}
fn default_mock_snr() -> f64 {
    25.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ssh_host")]
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ssh_host: default_ssh_host(),
            ssh_port: default_ssh_port(),
            ssh_user: default_ssh_user(),
            ssh_password: None,
            ssh_key_file: None,
            sysfs_root: default_sysfs_root(),
        }
    }
}

fn default_ssh_host() -> String {
    "192.168.2.1".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_ssh_user() -> String {
    "root".to_string()
}
fn default_sysfs_root() -> String {
    "/sys/bus/iio/devices".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[radio]
uri = "10.1.1.9:30431"
sample_rate_hz = 4000000.0
[tracking]
fft_size = 4096
parallel_scan = true
[backend]
kind = "pluto"
[fallback]
enabled = true
ssh_password = "analog"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.radio.uri, "10.1.1.9:30431");
        assert_eq!(cfg.radio.sample_rate_hz, 4_000_000.0);
        assert_eq!(cfg.radio.lo_hz, 2_300_000_000.0);
        assert_eq!(cfg.tracking.fft_size, 4096);
        assert!(cfg.tracking.parallel_scan);
        assert_eq!(cfg.tracking.spacing_wavelengths, 0.5);
        assert_eq!(cfg.tracking.deadband_deg, 0.5);
        assert_eq!(cfg.backend.kind, "pluto");
        assert!(cfg.fallback.enabled);
        assert_eq!(cfg.fallback.ssh_password.as_deref(), Some("analog"));
        assert_eq!(cfg.fallback.sysfs_root, "/sys/bus/iio/devices");
        assert_eq!(cfg.session.timeout_ms, 5000);
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_rejects_bad_scalars() {
        let mut cfg = Config::default();
        cfg.tracking.fft_size = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.radio.tone_offset_hz = 1_500_000.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.backend.kind = "hackrf".into();
        assert!(cfg.validate().is_err());

        Config::default().validate().unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load_from(&PathBuf::from("/nonexistent/doatrack.toml"));
        assert_eq!(cfg.backend.kind, "mock");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[backend]\nkind = \"pluto\"").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, file.path());
        let cfg = Config::load();
        assert_eq!(cfg.backend.kind, "pluto");
        std::env::remove_var(ENV_CONFIG_PATH);
    }
}
