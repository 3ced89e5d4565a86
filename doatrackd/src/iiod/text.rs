use crate::error::{Error, Result};
use crate::iiod::framer::Framer;

/// Channel qualifier for READ/WRITE verb forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    Device,
    Debug,
    Buffer,
    Input(String),
    Output(String),
}

impl Qualifier {
    /// The tokens inserted between the device id and the attribute name.
    pub fn tokens(&self) -> String {
        match self {
            Qualifier::Device => String::new(),
            Qualifier::Debug => "DEBUG ".to_string(),
            Qualifier::Buffer => "BUFFER ".to_string(),
            Qualifier::Input(chn) => format!("INPUT {chn} "),
            Qualifier::Output(chn) => format!("OUTPUT {chn} "),
        }
    }
}

async fn read_status(framer: &mut Framer) -> Result<i32> {
    let line = framer.read_line().await?;
    line.trim()
        .parse::<i32>()
        .map_err(|_| Error::Framing(format!("malformed status line {line:?}")))
}

/// Read a declared-length payload. A trailing LF inside the declared length
/// is stripped; anything short of the declared length fails loudly as a
/// framing error, never as a status error.
async fn read_payload(framer: &mut Framer, len: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; len];
    if len > 0 {
        framer.read_exact(&mut out).await?;
    }
    if out.last() == Some(&b'\n') {
        out.pop();
    }
    Ok(out)
}

/// Send one read-style command line and collect its payload.
pub async fn request(framer: &mut Framer, line: &str) -> Result<Vec<u8>> {
    framer.write_all(format!("{line}\r\n").as_bytes()).await?;
    let status = read_status(framer).await?;
    if status < 0 {
        return Err(Error::Status {
            op: 0,
            dev: 0,
            code: status,
        });
    }
    read_payload(framer, status as usize).await
}

/// Send a write-style command: the value length is appended to the command
/// line and the raw value follows with no trailing newline.
pub async fn request_write(framer: &mut Framer, line: &str, value: &[u8]) -> Result<Vec<u8>> {
    let mut wire = format!("{line} {}\r\n", value.len()).into_bytes();
    wire.extend_from_slice(value);
    framer.write_all(&wire).await?;
    let status = read_status(framer).await?;
    if status < 0 {
        return Err(Error::Status {
            op: 0,
            dev: 0,
            code: status,
        });
    }
    read_payload(framer, status as usize).await
}

pub async fn version(framer: &mut Framer) -> Result<(u16, u16, String)> {
    let raw = request(framer, "VERSION").await?;
    let text = String::from_utf8_lossy(&raw);
    let mut parts = text.split_whitespace();
    let major = parts.next().and_then(|p| p.parse().ok());
    let minor = parts.next().and_then(|p| p.parse().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => {
            let git = parts.next().unwrap_or("").to_string();
            Ok((major, minor, git))
        }
        _ => Err(Error::Framing(format!("malformed VERSION reply {text:?}"))),
    }
}

pub async fn print(framer: &mut Framer) -> Result<Vec<u8>> {
    request(framer, "PRINT").await
}

pub async fn set_timeout(framer: &mut Framer, millis: u64) -> Result<()> {
    request(framer, &format!("TIMEOUT {millis}")).await.map(|_| ())
}

pub async fn list_devices(framer: &mut Framer) -> Result<Vec<String>> {
    let raw = request(framer, "LIST_DEVICES").await?;
    Ok(split_lines(&raw))
}

pub async fn list_channels(framer: &mut Framer, device: &str) -> Result<Vec<String>> {
    let raw = request(framer, &format!("LIST_CHANNELS {device}")).await?;
    Ok(split_lines(&raw))
}

pub async fn read_attr(
    framer: &mut Framer,
    device: &str,
    qual: &Qualifier,
    attr: &str,
) -> Result<String> {
    let raw = request(framer, &format!("READ {device} {}{attr}", qual.tokens())).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

pub async fn write_attr(
    framer: &mut Framer,
    device: &str,
    qual: &Qualifier,
    attr: &str,
    value: &str,
) -> Result<()> {
    request_write(
        framer,
        &format!("WRITE {device} {}{attr}", qual.tokens()),
        value.as_bytes(),
    )
    .await
    .map(|_| ())
}

pub async fn open(framer: &mut Framer, device: &str, samples: usize, mask: u32, cyclic: bool) -> Result<()> {
    let cyclic = if cyclic { " CYCLIC" } else { "" };
    request(framer, &format!("OPEN {device} {samples} {mask:08x}{cyclic}"))
        .await
        .map(|_| ())
}

pub async fn close(framer: &mut Framer, device: &str) -> Result<()> {
    request(framer, &format!("CLOSE {device}")).await.map(|_| ())
}

pub async fn readbuf(framer: &mut Framer, device: &str, bytes: usize) -> Result<Vec<u8>> {
    request(framer, &format!("READBUF {device} {bytes}")).await
}

pub async fn writebuf(framer: &mut Framer, device: &str, data: &[u8]) -> Result<()> {
    request_write(framer, &format!("WRITEBUF {device}"), data)
        .await
        .map(|_| ())
}

pub async fn get_trigger(framer: &mut Framer, device: &str) -> Result<Option<String>> {
    let raw = request(framer, &format!("GETTRIG {device}")).await?;
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

pub async fn set_trigger(framer: &mut Framer, device: &str, trigger: Option<&str>) -> Result<()> {
    let line = match trigger {
        Some(t) => format!("SETTRIG {device} {t}"),
        None => format!("SETTRIG {device}"),
    };
    request(framer, &line).await.map(|_| ())
}

fn split_lines(raw: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, run a scripted exchange, and assert on the
    /// request bytes the client produced.
    async fn scripted(script: Vec<(Vec<u8>, Vec<u8>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            for (expect, reply) in script {
                let mut got = vec![0u8; expect.len()];
                sock.read_exact(&mut got).await.unwrap();
                assert_eq!(got, expect, "unexpected request bytes");
                sock.write_all(&reply).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn read_attr_strips_trailing_newline() {
        let addr = scripted(vec![(
            b"READ iio:device0 INPUT voltage0 hardwaregain\r\n".to_vec(),
            b"6\n-12.5\n".to_vec(),
        )])
        .await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let value = read_attr(
            &mut framer,
            "iio:device0",
            &Qualifier::Input("voltage0".into()),
            "hardwaregain",
        )
        .await
        .unwrap();
        assert_eq!(value, "-12.5");
    }

    #[tokio::test]
    async fn write_attr_sends_length_and_raw_value() {
        let addr = scripted(vec![(
            b"WRITE ad9361-phy OUTPUT voltage0 hardwaregain 3\r\n-20".to_vec(),
            b"0\n".to_vec(),
        )])
        .await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        write_attr(
            &mut framer,
            "ad9361-phy",
            &Qualifier::Output("voltage0".into()),
            "hardwaregain",
            "-20",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn negative_status_is_typed() {
        let addr = scripted(vec![(b"PRINT\r\n".to_vec(), b"-22\n".to_vec())]).await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        match print(&mut framer).await {
            Err(Error::Status { code: -22, .. }) => {}
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_payload_fails_loudly() {
        // Declares ten bytes but delivers four and closes.
        let addr = scripted(vec![(b"PRINT\r\n".to_vec(), b"10\nxml".to_vec())]).await;
        let mut framer = Framer::connect(&addr, Duration::from_millis(200)).await.unwrap();
        match print(&mut framer).await {
            Err(Error::Io(_)) => {}
            other => panic!("expected i/o error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffer_verbs_wire_format() {
        let addr = scripted(vec![
            (
                b"OPEN iio:device1 1024 00000003\r\n".to_vec(),
                b"0\n".to_vec(),
            ),
            (b"READBUF iio:device1 4\r\n".to_vec(), b"4\nABCD".to_vec()),
            (b"WRITEBUF iio:device1 4\r\nABCD".to_vec(), b"0\n".to_vec()),
            (b"CLOSE iio:device1\r\n".to_vec(), b"0\n".to_vec()),
        ])
        .await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        open(&mut framer, "iio:device1", 1024, 0b11, false).await.unwrap();
        let data = readbuf(&mut framer, "iio:device1", 4).await.unwrap();
        assert_eq!(data, b"ABCD");
        writebuf(&mut framer, "iio:device1", b"ABCD").await.unwrap();
        close(&mut framer, "iio:device1").await.unwrap();
    }

    #[tokio::test]
    async fn listings_and_triggers() {
        let addr = scripted(vec![
            (
                b"LIST_DEVICES\r\n".to_vec(),
                b"23\niio:device0\niio:device1".to_vec(),
            ),
            (
                b"LIST_CHANNELS iio:device1\r\n".to_vec(),
                b"17\nvoltage0\nvoltage1".to_vec(),
            ),
            (b"GETTRIG iio:device0\r\n".to_vec(), b"0\n".to_vec()),
            (
                b"SETTRIG iio:device0 trigger0\r\n".to_vec(),
                b"0\n".to_vec(),
            ),
        ])
        .await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let devices = list_devices(&mut framer).await.unwrap();
        assert_eq!(devices, vec!["iio:device0", "iio:device1"]);
        let channels = list_channels(&mut framer, "iio:device1").await.unwrap();
        assert_eq!(channels, vec!["voltage0", "voltage1"]);
        assert_eq!(get_trigger(&mut framer, "iio:device0").await.unwrap(), None);
        set_trigger(&mut framer, "iio:device0", Some("trigger0"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn version_triplet() {
        let addr = scripted(vec![(
            b"VERSION\r\n".to_vec(),
            b"12\n0 25 v0.25-g".to_vec(),
        )])
        .await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let (major, minor, git) = version(&mut framer).await.unwrap();
        assert_eq!((major, minor), (0, 25));
        assert_eq!(git, "v0.25-g");
    }
}
