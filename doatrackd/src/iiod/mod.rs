pub mod attr;
pub mod binary;
pub mod context;
pub mod framer;
pub mod stream;
pub mod sysfs;
pub mod text;

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};
use binary::Opcode;
use framer::Framer;

/// Oldest server protocol version whose attribute writes we trust. Anything
/// older gets the WriteNotSupported sentinel and the sysfs fallback.
pub const WRITE_SUPPORT_MIN: (u16, u16) = (0, 25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Text,
    Binary,
}

#[derive(Debug, Clone, Default)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub git: String,
}

/// One IIOD connection: exclusive owner of the socket, fixed transport mode
/// after the first successful probe, at most one request in flight.
pub struct Session {
    pub(crate) framer: Framer,
    pub(crate) client_id: u16,
    transport: Transport,
    version: ProtocolVersion,
    timeout: Duration,
    next_buffer_id: u16,
    cached_xml: Option<Vec<u8>>,
}

impl Session {
    /// Dial and negotiate. The binary VERSION probe runs first on a fresh
    /// connection; if the reply is not a well-formed binary response the
    /// endpoint is redialed and probed with a text PRINT instead.
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Session> {
        let client_id: u16 = rand::random();

        let mut framer = Framer::connect(endpoint, timeout).await?;
        // Keep the probe snappy against text-only servers that just sit on
        // the unparsable header bytes.
        framer.set_timeout(timeout.min(Duration::from_secs(2)));
        match probe_binary(&mut framer, client_id).await {
            Ok(version) => {
                framer.set_timeout(timeout);
                debug!(
                    "iiod {endpoint}: binary transport, server {}.{} {}",
                    version.major, version.minor, version.git
                );
                return Ok(Session {
                    framer,
                    client_id,
                    transport: Transport::Binary,
                    version,
                    timeout,
                    next_buffer_id: 0,
                    cached_xml: None,
                });
            }
            Err(err) => debug!("iiod {endpoint}: binary probe failed ({err}), trying text"),
        }

        let mut framer = Framer::connect(endpoint, timeout).await?;
        let xml = text::print(&mut framer).await?;
        if !xml.trim_ascii_start().starts_with(b"<?xml") && !xml.trim_ascii_start().starts_with(b"<")
        {
            return Err(Error::Framing("text probe did not return XML".into()));
        }
        let (major, minor, git) = text::version(&mut framer).await?;
        debug!("iiod {endpoint}: text transport, server {major}.{minor} {git}");
        Ok(Session {
            framer,
            client_id,
            transport: Transport::Text,
            version: ProtocolVersion { major, minor, git },
            timeout,
            next_buffer_id: 0,
            cached_xml: Some(xml),
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn version(&self) -> &ProtocolVersion {
        &self.version
    }

    pub fn is_connected(&self) -> bool {
        self.framer.is_connected()
    }

    /// Whether the server is recent enough for attribute writes over the
    /// wire. Reads are always available.
    pub fn write_supported(&self) -> bool {
        (self.version.major, self.version.minor) >= WRITE_SUPPORT_MIN
    }

    pub(crate) fn write_unsupported_err(&self) -> Error {
        Error::WriteNotSupported {
            major: self.version.major,
            minor: self.version.minor,
        }
    }

    /// Fetch the context description XML; the copy obtained during text
    /// negotiation is reused.
    pub async fn context_xml(&mut self) -> Result<Vec<u8>> {
        if let Some(xml) = &self.cached_xml {
            return Ok(xml.clone());
        }
        let xml = match self.transport {
            Transport::Binary => {
                binary::roundtrip_vec(&mut self.framer, self.client_id, Opcode::Print, 0, 0, &[])
                    .await?
            }
            Transport::Text => text::print(&mut self.framer).await?,
        };
        self.cached_xml = Some(xml.clone());
        Ok(xml)
    }

    /// Push the transaction deadline to the server and adopt it locally.
    pub async fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        let millis = timeout.as_millis() as u64;
        match self.transport {
            Transport::Binary => {
                binary::roundtrip(
                    &mut self.framer,
                    self.client_id,
                    Opcode::Timeout,
                    0,
                    millis as i32,
                    &[],
                    &mut [],
                )
                .await?;
            }
            Transport::Text => text::set_timeout(&mut self.framer, millis).await?,
        }
        self.timeout = timeout;
        self.framer.set_timeout(timeout);
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn alloc_buffer_id(&mut self) -> u16 {
        let id = self.next_buffer_id;
        self.next_buffer_id = self.next_buffer_id.wrapping_add(1);
        id
    }

    pub async fn get_trigger(&mut self, dev: u8, device: &str) -> Result<Option<String>> {
        match self.transport {
            Transport::Binary => {
                let raw = binary::roundtrip_vec(
                    &mut self.framer,
                    self.client_id,
                    Opcode::GetTrig,
                    dev,
                    0,
                    &[],
                )
                .await?;
                if raw.is_empty() {
                    return Ok(None);
                }
                let (name, _) = binary::read_lp_string_from(&raw)?;
                Ok(Some(name))
            }
            Transport::Text => text::get_trigger(&mut self.framer, device).await,
        }
    }

    pub async fn set_trigger(
        &mut self,
        dev: u8,
        device: &str,
        trigger: Option<&str>,
    ) -> Result<()> {
        match self.transport {
            Transport::Binary => {
                let mut payload = Vec::new();
                if let Some(t) = trigger {
                    binary::put_lp_string(&mut payload, t);
                }
                binary::roundtrip(
                    &mut self.framer,
                    self.client_id,
                    Opcode::SetTrig,
                    dev,
                    0,
                    &payload,
                    &mut [],
                )
                .await?;
                Ok(())
            }
            Transport::Text => text::set_trigger(&mut self.framer, device, trigger).await,
        }
    }

    /// Open a server-side event stream for a device.
    pub async fn create_evstream(&mut self, dev: u8) -> Result<u16> {
        let mut raw = [0u8; 2];
        let declared = binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::CreateEvstream,
            dev,
            0,
            &[],
            &mut raw,
        )
        .await?;
        if declared < 2 {
            return Err(Error::Framing("short CREATE_EVSTREAM reply".into()));
        }
        Ok(u16::from_be_bytes(raw))
    }

    pub async fn free_evstream(&mut self, dev: u8, stream_id: u16) -> Result<()> {
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::FreeEvstream,
            dev,
            stream_id as i32,
            &[],
            &mut [],
        )
        .await
        .map(|_| ())
    }

    /// Block for the next event on the stream; returns its raw payload.
    pub async fn read_event(&mut self, dev: u8, stream_id: u16) -> Result<Vec<u8>> {
        binary::roundtrip_vec(
            &mut self.framer,
            self.client_id,
            Opcode::ReadEvent,
            dev,
            stream_id as i32,
            &[],
        )
        .await
    }

    pub fn close(&mut self) {
        self.framer.close();
    }
}

async fn probe_binary(framer: &mut Framer, client_id: u16) -> Result<ProtocolVersion> {
    let payload =
        binary::roundtrip_vec(framer, client_id, Opcode::Version, 0, 0, &[]).await?;
    parse_binary_version(&payload)
}

/// VERSION payload: `[major:u16 BE][minor:u16 BE][git lpString]`.
fn parse_binary_version(payload: &[u8]) -> Result<ProtocolVersion> {
    if payload.len() < 4 {
        return Err(Error::Framing("short VERSION payload".into()));
    }
    let major = BigEndian::read_u16(&payload[0..2]);
    let minor = BigEndian::read_u16(&payload[2..4]);
    let git = if payload.len() > 4 {
        binary::read_lp_string_from(&payload[4..])?.0
    } else {
        String::new()
    };
    Ok(ProtocolVersion { major, minor, git })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_version_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&26u16.to_be_bytes());
        binary::put_lp_string(&mut payload, "v0.26-g1a2b");
        let v = parse_binary_version(&payload).unwrap();
        assert_eq!((v.major, v.minor), (0, 26));
        assert_eq!(v.git, "v0.26-g1a2b");
    }

    #[test]
    fn write_support_threshold() {
        let v = ProtocolVersion {
            major: 0,
            minor: 24,
            git: String::new(),
        };
        assert!((v.major, v.minor) < WRITE_SUPPORT_MIN);
        let v = ProtocolVersion {
            major: 0,
            minor: 25,
            git: String::new(),
        };
        assert!((v.major, v.minor) >= WRITE_SUPPORT_MIN);
    }
}
