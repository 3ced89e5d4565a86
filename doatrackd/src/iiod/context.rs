use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Context description tree, unmarshalled from the server's PRINT XML.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextXml {
    #[serde(rename = "@name", default)]
    pub name: Option<String>,
    #[serde(rename = "@description", default)]
    pub description: Option<String>,
    #[serde(rename = "context-attribute", default)]
    pub attributes: Vec<ContextAttribute>,
    #[serde(rename = "device", default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextAttribute {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@value", default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@label", default)]
    pub label: String,
    #[serde(rename = "channel", default)]
    pub channels: Vec<Channel>,
    #[serde(rename = "attribute", default)]
    pub attributes: Vec<Attribute>,
    #[serde(rename = "debug-attribute", default)]
    pub debug_attributes: Vec<Attribute>,
    #[serde(rename = "buffer-attribute", default)]
    pub buffer_attributes: Vec<Attribute>,
}

impl Device {
    /// Indexing key: name when present, id otherwise.
    pub fn key(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@type", default)]
    pub direction: String,
    #[serde(rename = "scan-element", default)]
    pub scan_element: Option<ScanElement>,
    #[serde(rename = "attribute", default)]
    pub attributes: Vec<Attribute>,
}

impl Channel {
    pub fn key(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn is_output(&self) -> bool {
        self.direction == "output"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanElement {
    #[serde(rename = "@index")]
    pub index: i64,
    #[serde(rename = "@format")]
    pub format: String,
    #[serde(rename = "@scale", default)]
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attribute {
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@filename", default)]
    pub filename: String,
    #[serde(rename = "@value", default)]
    pub value: Option<String>,
}

/// Parsed scan-element format string, e.g. `le:s12/16>>4` or
/// `be:S16/32X2>>0`. Uppercase sign characters mark the fully-defined ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFormat {
    pub big_endian: bool,
    pub signed: bool,
    pub fully_defined: bool,
    pub bits: u32,
    pub length: u32,
    pub repeat: u32,
    pub shift: u32,
}

impl ScanFormat {
    pub fn parse(raw: &str) -> Result<ScanFormat> {
        let bad = || Error::Framing(format!("bad scan format {raw:?}"));
        let (endian, rest) = raw.split_once(':').ok_or_else(bad)?;
        let big_endian = match endian {
            "le" => false,
            "be" => true,
            _ => return Err(bad()),
        };
        let sign = rest.chars().next().ok_or_else(bad)?;
        let (signed, fully_defined) = match sign {
            's' => (true, false),
            'S' => (true, true),
            'u' => (false, false),
            'U' => (false, true),
            _ => return Err(bad()),
        };
        let (bits_str, rest) = rest[1..].split_once('/').ok_or_else(bad)?;
        let (len_part, shift_str) = rest.split_once(">>").ok_or_else(bad)?;
        let (length_str, repeat) = match len_part.split_once('X') {
            Some((l, r)) => (l, r.parse::<u32>().map_err(|_| bad())?),
            None => (len_part, 1),
        };
        Ok(ScanFormat {
            big_endian,
            signed,
            fully_defined,
            bits: bits_str.parse().map_err(|_| bad())?,
            length: length_str.parse().map_err(|_| bad())?,
            repeat,
            shift: shift_str.parse().map_err(|_| bad())?,
        })
    }

    /// Bytes one sample of this channel occupies on the wire.
    pub fn sample_bytes(&self) -> usize {
        ((self.length as usize * self.repeat as usize) + 7) / 8
    }
}

/// Lookup tables derived from the context tree. Immutable for the lifetime
/// of the session that fetched it.
pub struct ContextIndex {
    pub context: ContextXml,
    devices_by_id: HashMap<String, usize>,
    devices_by_name: HashMap<String, usize>,
    /// device key -> channel key -> channel position within the device
    channels: HashMap<String, HashMap<String, usize>>,
    /// device key -> channel key ("" for device-level) -> attr -> sysfs filename
    attr_files: HashMap<String, HashMap<String, HashMap<String, String>>>,
    scan_formats: HashMap<(usize, usize), ScanFormat>,
    pub device_count: usize,
    pub channel_count: usize,
}

impl ContextIndex {
    pub fn parse(xml: &[u8]) -> Result<ContextIndex> {
        let text = std::str::from_utf8(xml)
            .map_err(|_| Error::Framing("context XML is not UTF-8".into()))?;
        let context: ContextXml = quick_xml::de::from_str(text)
            .map_err(|e| Error::Framing(format!("context XML: {e}")))?;
        Self::build(context)
    }

    pub fn build(context: ContextXml) -> Result<ContextIndex> {
        let mut devices_by_id = HashMap::new();
        let mut devices_by_name = HashMap::new();
        let mut channels: HashMap<String, HashMap<String, usize>> = HashMap::new();
        let mut attr_files: HashMap<String, HashMap<String, HashMap<String, String>>> =
            HashMap::new();
        let mut scan_formats = HashMap::new();
        let mut channel_count = 0;

        for (di, dev) in context.devices.iter().enumerate() {
            devices_by_id.insert(dev.id.clone(), di);
            if !dev.name.is_empty() {
                devices_by_name.insert(dev.name.clone(), di);
            }
            let dev_key = dev.key().to_string();
            let files = attr_files.entry(dev_key.clone()).or_default();
            let dev_files = files.entry(String::new()).or_default();
            for attr in &dev.attributes {
                let filename = if attr.filename.is_empty() {
                    attr.name.clone()
                } else {
                    attr.filename.clone()
                };
                dev_files.insert(attr.name.clone(), filename);
            }

            let chn_map = channels.entry(dev_key.clone()).or_default();
            for (ci, chn) in dev.channels.iter().enumerate() {
                channel_count += 1;
                chn_map.insert(chn.key().to_string(), ci);
                let chn_files = files.entry(chn.key().to_string()).or_default();
                for attr in &chn.attributes {
                    let filename = if attr.filename.is_empty() {
                        // Reconstructed the way the kernel names them.
                        let prefix = if chn.is_output() { "out" } else { "in" };
                        format!("{prefix}_{}_{}", chn.id, attr.name)
                    } else {
                        attr.filename.clone()
                    };
                    chn_files.insert(attr.name.clone(), filename);
                }
                if let Some(scan) = &chn.scan_element {
                    scan_formats.insert((di, ci), ScanFormat::parse(&scan.format)?);
                }
            }
        }

        let device_count = context.devices.len();
        Ok(ContextIndex {
            context,
            devices_by_id,
            devices_by_name,
            channels,
            attr_files,
            scan_formats,
            device_count,
            channel_count,
        })
    }

    /// Look a device up by id first, then by name.
    pub fn find_device(&self, key: &str) -> Option<usize> {
        self.devices_by_id
            .get(key)
            .or_else(|| self.devices_by_name.get(key))
            .copied()
    }

    pub fn device(&self, index: usize) -> &Device {
        &self.context.devices[index]
    }

    pub fn find_channel(&self, device: &str, channel: &str) -> Option<(usize, usize)> {
        let di = self.find_device(device)?;
        let dev = self.device(di);
        let ci = self.channels.get(dev.key())?.get(channel)?;
        Some((di, *ci))
    }

    pub fn scan_format(&self, device: usize, channel: usize) -> Option<&ScanFormat> {
        self.scan_formats.get(&(device, channel))
    }

    pub fn attr_filename(&self, device: &str, channel: &str, attr: &str) -> Option<&str> {
        self.attr_files
            .get(device)?
            .get(channel)?
            .get(attr)
            .map(|s| s.as_str())
    }

    /// Aggregate wire size of one sample across the enabled channels of a
    /// device (channel positions, not scan indexes).
    pub fn device_sample_size(&self, device: usize, enabled: &[u32]) -> usize {
        enabled
            .iter()
            .filter_map(|&ci| self.scan_formats.get(&(device, ci as usize)))
            .map(|f| f.sample_bytes())
            .sum()
    }

    /// Best-effort attribute resolution: exact, case-insensitive, known
    /// prefixes stripped, then substring. `channel` may be empty for
    /// device-level attributes.
    pub fn resolve_attr<'a>(
        &'a self,
        device: &str,
        channel: &str,
        attr: &str,
    ) -> Result<&'a Attribute> {
        let unresolved = || Error::AttrUnresolved {
            device: device.to_string(),
            channel: channel.to_string(),
            attr: attr.to_string(),
        };
        let di = self.find_device(device).ok_or_else(unresolved)?;
        let dev = self.device(di);
        let candidates: &[Attribute] = if channel.is_empty() {
            &dev.attributes
        } else {
            let (_, ci) = self.find_channel(device, channel).ok_or_else(unresolved)?;
            &dev.channels[ci].attributes
        };

        if let Some(found) = candidates.iter().find(|a| a.name == attr) {
            return Ok(found);
        }
        if let Some(found) = candidates
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(attr))
        {
            return Ok(found);
        }
        let wanted = strip_known_prefixes(attr);
        if let Some(found) = candidates
            .iter()
            .find(|a| strip_known_prefixes(&a.name) == wanted)
        {
            return Ok(found);
        }
        if let Some(found) = candidates
            .iter()
            .find(|a| a.name.contains(attr) || attr.contains(a.name.as_str()))
        {
            return Ok(found);
        }
        Err(unresolved())
    }
}

fn strip_known_prefixes(mut s: &str) -> &str {
    for prefix in ["in_", "out_", "voltage_", "altvoltage_"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    s
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<context name="network" description="pluto test bench">
  <context-attribute name="hw_model" value="Analog Devices PlutoSDR" />
  <device id="iio:device0" name="ad9361-phy">
    <channel id="altvoltage0" name="RX_LO" type="output">
      <attribute name="frequency" filename="out_altvoltage0_RX_LO_frequency" />
    </channel>
    <channel id="altvoltage1" name="TX_LO" type="output">
      <attribute name="frequency" filename="out_altvoltage1_TX_LO_frequency" />
    </channel>
    <channel id="voltage0" type="input">
      <attribute name="hardwaregain" filename="in_voltage0_hardwaregain" />
      <attribute name="gain_control_mode" filename="in_voltage0_gain_control_mode" />
      <attribute name="sampling_frequency" filename="in_voltage0_sampling_frequency" />
      <attribute name="rf_bandwidth" filename="in_voltage0_rf_bandwidth" />
    </channel>
    <channel id="voltage1" type="input">
      <attribute name="hardwaregain" filename="in_voltage1_hardwaregain" />
      <attribute name="gain_control_mode" filename="in_voltage1_gain_control_mode" />
    </channel>
    <channel id="voltage0" name="TX_GAIN" type="output">
      <attribute name="hardwaregain" filename="out_voltage0_hardwaregain" />
    </channel>
    <attribute name="trx_rate_governor" />
    <debug-attribute name="loopback" />
  </device>
  <device id="iio:device1" name="cf-ad9361-lpc">
    <channel id="voltage0" type="input">
      <scan-element index="0" format="le:s12/16X2&gt;&gt;4" />
      <attribute name="en" filename="in_voltage0_en" />
    </channel>
    <channel id="voltage1" type="input">
      <scan-element index="1" format="le:s12/16X2&gt;&gt;4" />
      <attribute name="en" filename="in_voltage1_en" />
    </channel>
    <buffer-attribute name="watermark" />
  </device>
  <device id="iio:device2" name="cf-ad9361-dds-core-lpc">
    <channel id="voltage0" type="output">
      <scan-element index="0" format="le:s16/16X2&gt;&gt;0" />
      <attribute name="en" filename="out_voltage0_en" />
    </channel>
    <channel id="voltage1" type="output">
      <scan-element index="1" format="le:s16/16X2&gt;&gt;0" />
      <attribute name="en" filename="out_voltage1_en" />
    </channel>
  </device>
</context>
"#;

    #[test]
    fn parses_and_indexes_sample_context() {
        let index = ContextIndex::parse(SAMPLE_XML.as_bytes()).unwrap();
        assert_eq!(index.device_count, 3);
        assert_eq!(index.channel_count, 9);
        assert_eq!(index.find_device("iio:device1"), index.find_device("cf-ad9361-lpc"));
        let (di, ci) = index.find_channel("ad9361-phy", "RX_LO").unwrap();
        assert_eq!(index.device(di).channels[ci].id, "altvoltage0");
        assert_eq!(
            index.attr_filename("ad9361-phy", "voltage0", "hardwaregain"),
            Some("in_voltage0_hardwaregain")
        );
    }

    #[test]
    fn scan_format_grammar() {
        let f = ScanFormat::parse("le:s12/16>>4").unwrap();
        assert!(!f.big_endian && f.signed && !f.fully_defined);
        assert_eq!((f.bits, f.length, f.repeat, f.shift), (12, 16, 1, 4));
        assert_eq!(f.sample_bytes(), 2);

        let f = ScanFormat::parse("be:S16/32X2>>0").unwrap();
        assert!(f.big_endian && f.signed && f.fully_defined);
        assert_eq!((f.length, f.repeat), (32, 2));
        assert_eq!(f.sample_bytes(), 8);

        let f = ScanFormat::parse("le:u10/16>>6").unwrap();
        assert!(!f.signed);
        assert_eq!(f.sample_bytes(), 2);

        for bad in ["xe:s12/16>>4", "le:q12/16>>4", "le:s12-16>>4", "le:s12/16"] {
            assert!(ScanFormat::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn sample_size_is_ceil_of_bits() {
        for (fmt, bytes) in [
            ("le:s12/16>>4", 2),
            ("le:s24/24>>0", 3),
            ("be:u1/8X3>>0", 3),
            ("le:S16/16X2>>0", 4),
        ] {
            assert_eq!(ScanFormat::parse(fmt).unwrap().sample_bytes(), bytes, "{fmt}");
        }
    }

    #[test]
    fn aggregate_sample_size_sums_enabled_channels() {
        let index = ContextIndex::parse(SAMPLE_XML.as_bytes()).unwrap();
        let di = index.find_device("cf-ad9361-lpc").unwrap();
        assert_eq!(index.device_sample_size(di, &[0, 1]), 8);
        assert_eq!(index.device_sample_size(di, &[0]), 4);
    }

    #[test]
    fn attr_resolution_fallbacks() {
        let index = ContextIndex::parse(SAMPLE_XML.as_bytes()).unwrap();
        // Exact.
        assert_eq!(
            index
                .resolve_attr("ad9361-phy", "voltage0", "hardwaregain")
                .unwrap()
                .name,
            "hardwaregain"
        );
        // Case-insensitive.
        assert_eq!(
            index
                .resolve_attr("ad9361-phy", "voltage0", "HardwareGain")
                .unwrap()
                .name,
            "hardwaregain"
        );
        // Prefix-stripped.
        assert_eq!(
            index
                .resolve_attr("ad9361-phy", "voltage0", "in_hardwaregain")
                .unwrap()
                .name,
            "hardwaregain"
        );
        // Substring.
        assert_eq!(
            index
                .resolve_attr("ad9361-phy", "voltage0", "gain_control")
                .unwrap()
                .name,
            "gain_control_mode"
        );
        // Misses name the full triple.
        match index.resolve_attr("ad9361-phy", "voltage0", "nonsense") {
            Err(Error::AttrUnresolved { device, channel, attr }) => {
                assert_eq!(device, "ad9361-phy");
                assert_eq!(channel, "voltage0");
                assert_eq!(attr, "nonsense");
            }
            other => panic!("expected unresolved, got {other:?}"),
        }
    }
}
