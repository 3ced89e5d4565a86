use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::dsp::Complex32;
use crate::error::{Error, Result};
use crate::iiod::attr::{read_compat, write_compat};
use crate::iiod::context::ContextIndex;
use crate::iiod::stream::{Block, Buffer};
use crate::iiod::sysfs::{SshConfig, SysfsWriter};
use crate::iiod::Session;
use crate::sdr::{bytes_to_i16_le, deinterleave_iq, i16_to_bytes_le, interleave_iq};

/// Bytes per composite sample on the streaming devices: two channels, each
/// an int16 I/Q pair.
const FRAME_BYTES: usize = 8;

struct DeviceRef {
    index: usize,
    id: String,
    key: String,
}

/// The real radio: an AD9361-class device reached through one IIOD session.
pub struct PlutoSdr {
    session: Arc<Mutex<Session>>,
    index: ContextIndex,
    sysfs: Option<SysfsWriter>,
    phy: DeviceRef,
    rx_dev: DeviceRef,
    tx_dev: DeviceRef,
    rx_buffer: Buffer,
    rx_block: Arc<Block>,
    tx_buffer: Buffer,
    tx_block: Arc<Block>,
    rx_scratch: Vec<u8>,
}

impl PlutoSdr {
    /// Bring the radio up: session, context index, device identification,
    /// attribute programming, streaming buffers, and the calibration tone.
    /// Failure here is fatal for the caller.
    pub async fn init(cfg: &Config) -> Result<PlutoSdr> {
        let timeout = Duration::from_millis(cfg.session.timeout_ms);
        let mut session = Session::connect(&cfg.radio.uri, timeout).await?;
        let xml = session.context_xml().await?;
        let index = ContextIndex::parse(&xml)?;
        info!(
            "context: {} devices, {} channels, server {}.{}",
            index.device_count,
            index.channel_count,
            session.version().major,
            session.version().minor
        );

        let (phy, rx_dev, tx_dev) = identify_devices(&index)?;
        debug!(
            "identified phy={} rx={} tx={}",
            phy.key, rx_dev.key, tx_dev.key
        );

        let mut sysfs = if cfg.fallback.enabled {
            Some(SysfsWriter::new(SshConfig {
                host: cfg.fallback.ssh_host.clone(),
                port: cfg.fallback.ssh_port,
                user: cfg.fallback.ssh_user.clone(),
                password: cfg.fallback.ssh_password.clone(),
                key_file: cfg.fallback.ssh_key_file.clone(),
                sysfs_root: cfg.fallback.sysfs_root.clone(),
            }))
        } else {
            None
        };

        program_radio(&mut session, &index, sysfs.as_mut(), cfg, &phy, &rx_dev, &tx_dev).await?;

        let samples = cfg.tracking.fft_size;
        let mut rx_buffer = session
            .create_buffer(rx_dev.index as u8, &[0, 1], false)
            .await?;
        let rx_block = session
            .create_block(&mut rx_buffer, (samples * FRAME_BYTES) as u64)
            .await?;
        session.enable_buffer(&rx_buffer).await?;

        let mut tx_buffer = session
            .create_buffer(tx_dev.index as u8, &[0, 1], true)
            .await?;
        let tx_block = session
            .create_block(&mut tx_buffer, (samples * FRAME_BYTES) as u64)
            .await?;
        session.enable_buffer(&tx_buffer).await?;

        let mut pluto = PlutoSdr {
            session: Arc::new(Mutex::new(session)),
            index,
            sysfs,
            phy,
            rx_dev,
            tx_dev,
            rx_buffer,
            rx_block: Arc::new(rx_block),
            tx_buffer,
            tx_block: Arc::new(tx_block),
            rx_scratch: vec![0u8; samples * FRAME_BYTES],
        };
        pluto.transmit_tone(cfg).await;
        Ok(pluto)
    }

    /// Start the calibration tone: one block of the offset tone, replayed
    /// cyclically by the server. Best effort; tracking can still run
    /// against an external source.
    async fn transmit_tone(&mut self, cfg: &Config) {
        let n = cfg.tracking.fft_size;
        let cycles = cfg.radio.tone_offset_hz / cfg.radio.sample_rate_hz * n as f64;
        let tone: Vec<Complex32> = (0..n)
            .map(|k| {
                let arg = 2.0 * std::f64::consts::PI * cycles * k as f64 / n as f64;
                Complex32::from_polar(0.9, arg as f32)
            })
            .collect();
        if let Err(err) = self.tx(&tone, &tone).await {
            warn!("calibration tone transmit failed: {err}");
            return;
        }
        let mut session = self.session.lock().await;
        if let Err(err) = session.enqueue_block_cyclic(&self.tx_block).await {
            warn!("cyclic tone enqueue failed: {err}");
        }
    }

    /// One capture: transfer the RX block, parse interleaved int16, split
    /// into the two channels. A status error here is transient; the caller
    /// may retry on the next cycle.
    pub async fn rx(&mut self) -> Result<(Vec<Complex32>, Vec<Complex32>)> {
        let n = {
            let mut session = self.session.lock().await;
            session
                .transfer_block(&self.rx_block, &mut self.rx_scratch)
                .await?
        };
        let n = n.min(self.rx_scratch.len());
        let raw = bytes_to_i16_le(&self.rx_scratch[..n]);
        Ok(deinterleave_iq(&raw))
    }

    pub async fn tx(&mut self, ch0: &[Complex32], ch1: &[Complex32]) -> Result<()> {
        let data = i16_to_bytes_le(&interleave_iq(ch0, ch1));
        let mut session = self.session.lock().await;
        session.transfer_tx_block(&self.tx_block, &data).await
    }

    /// Shut down in order: TX block and buffer, RX block and buffer, then
    /// the session.
    pub async fn close(&mut self) -> Result<()> {
        let mut session = self.session.lock().await;
        session.free_block(&self.tx_block).await.ok();
        session.free_buffer(&self.tx_buffer).await.ok();
        session.free_block(&self.rx_block).await.ok();
        session.free_buffer(&self.rx_buffer).await.ok();
        session.close();
        Ok(())
    }

    /// Runtime attribute write on the phy, with the sysfs fallback when
    /// the server rejects wire writes.
    pub async fn write_phy_attr(&mut self, channel: &str, attr: &str, value: &str) -> Result<()> {
        let mut session = self.session.lock().await;
        write_compat(
            &mut session,
            &self.index,
            self.sysfs.as_mut(),
            &self.phy.key,
            channel,
            attr,
            value,
        )
        .await
    }

    pub async fn read_phy_attr(&mut self, channel: &str, attr: &str) -> Result<String> {
        let mut session = self.session.lock().await;
        read_compat(&mut session, &self.index, &self.phy.key, channel, attr).await
    }

    pub fn rx_device(&self) -> &str {
        &self.rx_dev.id
    }

    pub fn tx_device(&self) -> &str {
        &self.tx_dev.id
    }

    pub fn phy_device(&self) -> &str {
        &self.phy.id
    }

    pub fn index(&self) -> &ContextIndex {
        &self.index
    }
}

fn device_ref(index: &ContextIndex, di: usize) -> DeviceRef {
    let dev = index.device(di);
    DeviceRef {
        index: di,
        id: dev.id.clone(),
        key: dev.key().to_string(),
    }
}

/// Find the phy, RX streaming, and TX streaming devices. Canonical names
/// first; otherwise the phy is the device with an LO channel and no scan
/// elements, RX is the device with input scan channels, TX the one with
/// output scan channels.
fn identify_devices(index: &ContextIndex) -> Result<(DeviceRef, DeviceRef, DeviceRef)> {
    let mut phy = index.find_device("ad9361-phy");
    let mut rx = index.find_device("cf-ad9361-lpc");
    let mut tx = index.find_device("cf-ad9361-dds-core-lpc");

    for di in 0..index.device_count {
        let dev = index.device(di);
        let has_scan_input = dev
            .channels
            .iter()
            .any(|c| c.scan_element.is_some() && !c.is_output());
        let has_scan_output = dev
            .channels
            .iter()
            .any(|c| c.scan_element.is_some() && c.is_output());
        let has_lo = dev.channels.iter().any(|c| c.id.starts_with("altvoltage"));

        if phy.is_none() && has_lo && !has_scan_input && !has_scan_output {
            phy = Some(di);
        }
        if rx.is_none() && has_scan_input {
            rx = Some(di);
        }
        if tx.is_none() && has_scan_output {
            tx = Some(di);
        }
    }

    match (phy, rx, tx) {
        (Some(p), Some(r), Some(t)) => Ok((
            device_ref(index, p),
            device_ref(index, r),
            device_ref(index, t),
        )),
        _ => Err(Error::Config(
            "context does not look like an AD9361: missing phy or streaming devices".into(),
        )),
    }
}

/// Program carrier, rate, bandwidth and gains through the attribute
/// façade. Streaming-channel enables are best effort.
async fn program_radio(
    session: &mut Session,
    index: &ContextIndex,
    mut sysfs: Option<&mut SysfsWriter>,
    cfg: &Config,
    phy: &DeviceRef,
    rx_dev: &DeviceRef,
    tx_dev: &DeviceRef,
) -> Result<()> {
    let phy_key = phy.key.as_str();
    let writes: Vec<(&str, String, String, String)> = vec![
        (phy_key, "voltage0".into(), "sampling_frequency".into(), format!("{}", cfg.radio.sample_rate_hz as u64)),
        (phy_key, "voltage0".into(), "rf_bandwidth".into(), format!("{}", cfg.radio.bandwidth_hz as u64)),
        // Carrier configuration: RX LO on altvoltage0, TX LO on altvoltage1.
        (phy_key, "altvoltage0".into(), "frequency".into(), format!("{}", cfg.radio.lo_hz as u64)),
        (phy_key, "altvoltage1".into(), "frequency".into(), format!("{}", cfg.radio.lo_hz as u64)),
        (phy_key, "voltage0".into(), "gain_control_mode".into(), "manual".into()),
        (phy_key, "voltage1".into(), "gain_control_mode".into(), "manual".into()),
        (phy_key, "voltage0".into(), "hardwaregain".into(), format!("{}", cfg.radio.rx_gain_db)),
        (phy_key, "voltage1".into(), "hardwaregain".into(), format!("{}", cfg.radio.rx_gain_db)),
        (phy_key, "out_voltage0".into(), "hardwaregain".into(), format!("{}", cfg.radio.tx_gain_db)),
    ];
    for (device, channel, attr, value) in &writes {
        write_compat(session, index, sysfs.as_deref_mut(), device, channel, attr, value).await?;
    }

    // Streaming-channel enables; older firmware lacks these outright.
    for (device, channel) in [
        (rx_dev.key.as_str(), "voltage0"),
        (rx_dev.key.as_str(), "voltage1"),
        (tx_dev.key.as_str(), "voltage0"),
        (tx_dev.key.as_str(), "voltage1"),
    ] {
        if let Err(err) =
            write_compat(session, index, sysfs.as_deref_mut(), device, channel, "en", "1").await
        {
            debug!("channel enable {device}/{channel} skipped: {err}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_the_pluto_trio() {
        let index =
            ContextIndex::parse(crate::iiod::context::tests::SAMPLE_XML.as_bytes()).unwrap();
        let (phy, rx, tx) = identify_devices(&index).unwrap();
        assert_eq!(phy.key, "ad9361-phy");
        assert_eq!(rx.key, "cf-ad9361-lpc");
        assert_eq!(tx.key, "cf-ad9361-dds-core-lpc");
    }

    #[test]
    fn identification_fails_without_streaming_devices() {
        let xml = r#"<context name="x"><device id="iio:device0" name="misc"><channel id="voltage0" type="input"/></device></context>"#;
        let index = ContextIndex::parse(xml.as_bytes()).unwrap();
        assert!(identify_devices(&index).is_err());
    }
}
