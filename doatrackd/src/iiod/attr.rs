use crate::error::Result;
use crate::iiod::binary::{self, Opcode};
use crate::iiod::context::ContextIndex;
use crate::iiod::sysfs::SysfsWriter;
use crate::iiod::text::{self, Qualifier};
use crate::iiod::{Session, Transport};

/// Attribute scope. Channel attributes carry the channel key and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Device,
    Channel { channel: String, output: bool },
    Debug,
    Buffer,
}

impl Scope {
    fn read_op(&self) -> Opcode {
        match self {
            Scope::Device => Opcode::ReadAttr,
            Scope::Channel { .. } => Opcode::ReadChnAttr,
            Scope::Debug => Opcode::ReadDbgAttr,
            Scope::Buffer => Opcode::ReadBufAttr,
        }
    }

    fn write_op(&self) -> Opcode {
        match self {
            Scope::Device => Opcode::WriteAttr,
            Scope::Channel { .. } => Opcode::WriteChnAttr,
            Scope::Debug => Opcode::WriteDbgAttr,
            Scope::Buffer => Opcode::WriteBufAttr,
        }
    }

    fn qualifier(&self) -> Qualifier {
        match self {
            Scope::Device => Qualifier::Device,
            Scope::Channel { channel, output } => {
                if *output {
                    Qualifier::Output(channel.clone())
                } else {
                    Qualifier::Input(channel.clone())
                }
            }
            Scope::Debug => Qualifier::Debug,
            Scope::Buffer => Qualifier::Buffer,
        }
    }
}

impl Session {
    /// Read an attribute in the given scope. `dev` is the binary device
    /// handle; `device` the textual id the text transport uses.
    pub async fn read_attr(
        &mut self,
        dev: u8,
        device: &str,
        scope: &Scope,
        attr: &str,
    ) -> Result<String> {
        match self.transport() {
            Transport::Binary => {
                let mut payload = Vec::new();
                let mut code = 0;
                if let Scope::Channel { channel, output } = scope {
                    binary::put_name_value(&mut payload, channel, attr);
                    code = *output as i32;
                } else {
                    binary::put_lp_string(&mut payload, attr);
                }
                let raw = binary::roundtrip_vec(
                    &mut self.framer,
                    self.client_id,
                    scope.read_op(),
                    dev,
                    code,
                    &payload,
                )
                .await?;
                let value = String::from_utf8_lossy(&raw).into_owned();
                Ok(value.trim_end_matches(['\0', '\n']).to_string())
            }
            Transport::Text => {
                text::read_attr(&mut self.framer, device, &scope.qualifier(), attr).await
            }
        }
    }

    /// Write an attribute in the given scope. Servers below the
    /// write-support threshold get the sentinel without touching the wire.
    pub async fn write_attr(
        &mut self,
        dev: u8,
        device: &str,
        scope: &Scope,
        attr: &str,
        value: &str,
    ) -> Result<()> {
        if !self.write_supported() {
            return Err(self.write_unsupported_err());
        }
        match self.transport() {
            Transport::Binary => {
                let mut payload = Vec::new();
                let mut code = 0;
                if let Scope::Channel { channel, output } = scope {
                    binary::put_name_value(&mut payload, channel, attr);
                    binary::put_lp_string(&mut payload, value);
                    code = *output as i32;
                } else {
                    binary::put_name_value(&mut payload, attr, value);
                }
                binary::roundtrip(
                    &mut self.framer,
                    self.client_id,
                    scope.write_op(),
                    dev,
                    code,
                    &payload,
                    &mut [],
                )
                .await?;
                Ok(())
            }
            Transport::Text => {
                text::write_attr(&mut self.framer, device, &scope.qualifier(), attr, value).await
            }
        }
    }
}

/// Scope and direction chosen from the context index: empty channel means a
/// device attribute, otherwise direction follows the channel descriptor.
pub fn compat_scope(index: &ContextIndex, device: &str, channel: &str) -> Scope {
    if channel.is_empty() {
        return Scope::Device;
    }
    let output = index
        .find_channel(device, channel)
        .map(|(di, ci)| index.device(di).channels[ci].is_output())
        // Unknown channels fall back to the sysfs naming rule.
        .unwrap_or_else(|| channel.starts_with("altvoltage") || channel.starts_with("out_"));
    Scope::Channel {
        channel: channel.to_string(),
        output,
    }
}

/// Compat write used by the radio façade: resolves the attribute through
/// the index, picks scope and direction, and falls back to the sysfs
/// writer when the server rejects wire writes.
pub async fn write_compat(
    session: &mut Session,
    index: &ContextIndex,
    sysfs: Option<&mut SysfsWriter>,
    device: &str,
    channel: &str,
    attr: &str,
    value: &str,
) -> Result<()> {
    let resolved = index
        .resolve_attr(device, channel, attr)
        .map(|a| a.name.clone())
        .unwrap_or_else(|_| attr.to_string());
    let dev = index.find_device(device).unwrap_or(0) as u8;
    let scope = compat_scope(index, device, channel);

    match session.write_attr(dev, device, &scope, &resolved, value).await {
        Err(err) if err.is_write_unsupported() => match sysfs {
            Some(writer) => {
                writer.warn_fallback_once();
                writer.write_attr(device, channel, &resolved, value).await
            }
            None => Err(err),
        },
        other => other,
    }
}

/// Compat read; reads never fall back.
pub async fn read_compat(
    session: &mut Session,
    index: &ContextIndex,
    device: &str,
    channel: &str,
    attr: &str,
) -> Result<String> {
    let resolved = index
        .resolve_attr(device, channel, attr)
        .map(|a| a.name.clone())
        .unwrap_or_else(|_| attr.to_string());
    let dev = index.find_device(device).unwrap_or(0) as u8;
    let scope = compat_scope(index, device, channel);
    session.read_attr(dev, device, &scope, &resolved).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iiod::context::ContextIndex;

    fn index() -> ContextIndex {
        ContextIndex::parse(crate::iiod::context::tests::SAMPLE_XML.as_bytes()).unwrap()
    }

    #[test]
    fn compat_scope_picks_direction_from_the_index() {
        let idx = index();
        assert_eq!(compat_scope(&idx, "ad9361-phy", ""), Scope::Device);
        assert_eq!(
            compat_scope(&idx, "ad9361-phy", "voltage0"),
            Scope::Channel {
                channel: "voltage0".into(),
                output: false
            }
        );
        assert_eq!(
            compat_scope(&idx, "ad9361-phy", "RX_LO"),
            Scope::Channel {
                channel: "RX_LO".into(),
                output: true
            }
        );
        // Channels missing from the index follow the naming rule.
        assert_eq!(
            compat_scope(&idx, "ad9361-phy", "altvoltage7"),
            Scope::Channel {
                channel: "altvoltage7".into(),
                output: true
            }
        );
    }
}
