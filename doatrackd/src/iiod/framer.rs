use std::io;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

const DISCARD_CHUNK: usize = 8192;

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline elapsed")
}

/// Byte-level framing over the one TCP connection a session owns.
///
/// The framer is the only reader and the only writer of the socket. Reads
/// go through a buffered reader so headers split across TCP segments are
/// reassembled transparently; discards reuse one scratch buffer so skipping
/// an oversized payload never allocates. Any read or write failure
/// (including a deadline) closes the socket; there is no silent retry.
pub struct Framer {
    stream: Option<BufReader<TcpStream>>,
    scratch: BytesMut,
    timeout: Duration,
}

impl Framer {
    pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Io(timed_out()))??;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream: Some(BufReader::new(stream)),
            scratch: BytesMut::zeroed(DISCARD_CHUNK),
            timeout,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    fn fail(&mut self, err: io::Error) -> Error {
        self.stream = None;
        Error::Io(err)
    }

    /// Read exactly `dst.len()` bytes into the caller's buffer.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let res = match tokio::time::timeout(timeout, stream.read_exact(dst)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        };
        res.map_err(|e| self.fail(e))
    }

    /// Consume and drop exactly `n` bytes, keeping the stream aligned for
    /// the next header even when a payload exceeds the caller's destination.
    pub async fn discard(&mut self, mut n: usize) -> Result<()> {
        let timeout = self.timeout;
        let res: io::Result<()> = {
            let Framer {
                stream, scratch, ..
            } = self;
            let stream = match stream.as_mut() {
                Some(s) => s,
                None => return Err(Error::NotConnected),
            };
            let mut out = Ok(());
            while n > 0 {
                let take = n.min(scratch.len());
                match tokio::time::timeout(timeout, stream.read_exact(&mut scratch[..take])).await
                {
                    Ok(Ok(_)) => n -= take,
                    Ok(Err(e)) => {
                        out = Err(e);
                        break;
                    }
                    Err(_) => {
                        out = Err(timed_out());
                        break;
                    }
                }
            }
            out
        };
        res.map_err(|e| self.fail(e))
    }

    /// Read one LF-terminated line, stripping the terminator (and a CR if
    /// the server sent CRLF). Used by the text transport's status lines.
    pub async fn read_line(&mut self) -> Result<String> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut line = String::new();
        let res = match tokio::time::timeout(timeout, stream.read_line(&mut line)).await {
            Ok(Ok(0)) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        };
        res.map_err(|e| self.fail(e))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    pub async fn write_all(&mut self, src: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let res = match tokio::time::timeout(timeout, async {
            stream.write_all(src).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(timed_out()),
        };
        res.map_err(|e| self.fail(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn serve_chunks(chunks: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            for chunk in chunks {
                sock.write_all(&chunk).await.unwrap();
                sock.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            // Hold the socket open so the client side decides when to stop.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        addr
    }

    #[tokio::test]
    async fn reassembles_one_byte_chunks() {
        let payload: Vec<u8> = (0..64u8).collect();
        let chunks = payload.iter().map(|b| vec![*b]).collect();
        let addr = serve_chunks(chunks).await;

        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let mut dst = vec![0u8; 64];
        framer.read_exact(&mut dst).await.unwrap();
        assert_eq!(dst, payload);
    }

    #[tokio::test]
    async fn discard_keeps_alignment() {
        let mut payload = vec![0xAAu8; 10];
        payload.extend_from_slice(b"HELLO");
        // Split at an offset that straddles the discard boundary.
        let chunks = vec![payload[..7].to_vec(), payload[7..].to_vec()];
        let addr = serve_chunks(chunks).await;

        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        framer.discard(10).await.unwrap();
        let mut dst = vec![0u8; 5];
        framer.read_exact(&mut dst).await.unwrap();
        assert_eq!(&dst, b"HELLO");
    }

    #[tokio::test]
    async fn read_deadline_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut framer = Framer::connect(&addr, Duration::from_millis(50)).await.unwrap();
        let mut dst = [0u8; 4];
        let err = framer.read_exact(&mut dst).await.unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!framer.is_connected());
    }

    #[tokio::test]
    async fn line_strips_crlf() {
        let addr = serve_chunks(vec![b"-32\r\n".to_vec()]).await;
        let mut framer = Framer::connect(&addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(framer.read_line().await.unwrap(), "-32");
    }
}
