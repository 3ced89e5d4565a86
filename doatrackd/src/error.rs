use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between the socket and the tracker.
///
/// DSP edge cases (empty input, length mismatch) are not errors; the kernels
/// degrade to empty output or a zero phase instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing: {0}")]
    Framing(String),

    /// Negative status returned by the server. For text-mode responses the
    /// opcode and device are zero; the code is the status line value.
    #[error("server status {code} (op {op}, dev {dev})")]
    Status { op: u8, dev: u8, code: i32 },

    /// Sentinel: the connected server's protocol version predates binary
    /// attribute writes. Recoverable through the sysfs fallback.
    #[error("attribute writes unsupported by server protocol {major}.{minor}")]
    WriteNotSupported { major: u16, minor: u16 },

    #[error("attribute `{attr}` not found on {device}/{channel}")]
    AttrUnresolved {
        device: String,
        channel: String,
        attr: String,
    },

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// Queue closed by the producer or consumer; remaining frames drained.
    #[error("stream closed")]
    StreamClosed,

    /// Queue closed by the stop signal.
    #[error("stream stopped")]
    StreamStopped,

    #[error("not connected")]
    NotConnected,

    #[error("operation requires the binary transport")]
    BinaryOnly,

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::StreamStopped)
    }

    pub fn is_write_unsupported(&self) -> bool {
        matches!(self, Error::WriteNotSupported { .. })
    }
}
