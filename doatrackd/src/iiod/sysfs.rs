use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use russh::client;

use crate::error::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub sysfs_root: String,
}

/// Writes attribute values straight to sysfs over a remote shell, for
/// firmware whose IIOD predates binary attribute writes. The SSH client is
/// dialed on first use and reused across writes.
pub struct SysfsWriter {
    cfg: SshConfig,
    client: Option<client::Handle<AcceptAll>>,
    warned: bool,
}

struct AcceptAll;

impl client::Handler for AcceptAll {
    type Error = russh::Error;

    // Pluto-class devices regenerate their host key per firmware image;
    // verification is intentionally permissive for LAN use.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

fn ssh_err(e: impl std::error::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

impl SysfsWriter {
    pub fn new(cfg: SshConfig) -> SysfsWriter {
        SysfsWriter {
            cfg,
            client: None,
            warned: false,
        }
    }

    /// Log the downgrade exactly once per writer.
    pub fn warn_fallback_once(&mut self) {
        if !self.warned {
            warn!(
                "server rejects attribute writes; falling back to sysfs over ssh ({}@{})",
                self.cfg.user, self.cfg.host
            );
            self.warned = true;
        }
    }

    async fn client(&mut self) -> Result<&mut client::Handle<AcceptAll>> {
        if self.client.is_none() {
            let config = Arc::new(client::Config {
                inactivity_timeout: Some(Duration::from_secs(60)),
                ..Default::default()
            });
            let addr = (self.cfg.host.as_str(), self.cfg.port);
            let mut handle =
                tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, addr, AcceptAll))
                    .await
                    .map_err(|_| {
                        Error::Io(io::Error::new(io::ErrorKind::TimedOut, "ssh dial deadline"))
                    })?
                    .map_err(ssh_err)?;

            let authed = if let Some(key_path) = &self.cfg.key_file {
                let key = russh::keys::load_secret_key(key_path, None).map_err(ssh_err)?;
                handle
                    .authenticate_publickey(
                        self.cfg.user.clone(),
                        russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(ssh_err)?
                    .success()
            } else if let Some(password) = &self.cfg.password {
                handle
                    .authenticate_password(self.cfg.user.clone(), password.clone())
                    .await
                    .map_err(ssh_err)?
                    .success()
            } else {
                return Err(Error::Config(
                    "sysfs fallback requires an ssh password or key".into(),
                ));
            };
            if !authed {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "ssh authentication failed",
                )));
            }
            debug!("ssh session to {}@{} established", self.cfg.user, self.cfg.host);
            self.client = Some(handle);
        }
        Ok(self.client.as_mut().unwrap())
    }

    /// Write one attribute value to its sysfs file.
    pub async fn write_attr(
        &mut self,
        device: &str,
        channel: &str,
        attr: &str,
        value: &str,
    ) -> Result<()> {
        let path = sysfs_path(&self.cfg.sysfs_root, device, channel, attr);
        let command = format!("printf %s '{}' > {}", escape_single_quoted(value), path);
        let res = self.run(&command).await;
        if res.is_err() {
            // Force a redial on the next write.
            self.client = None;
        }
        res
    }

    async fn run(&mut self, command: &str) -> Result<()> {
        let client = self.client().await?;
        let mut channel = client.channel_open_session().await.map_err(ssh_err)?;
        channel.exec(true, command).await.map_err(ssh_err)?;
        let mut exit = None;
        while let Some(msg) = channel.wait().await {
            if let russh::ChannelMsg::ExitStatus { exit_status } = msg {
                exit = Some(exit_status);
            }
        }
        match exit {
            Some(0) => Ok(()),
            Some(code) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("remote shell exited with {code}"),
            ))),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "remote shell closed without an exit status",
            ))),
        }
    }
}

/// Sysfs file for an IIO attribute triple. Device-level attributes keep the
/// raw name; channel attributes get the kernel's `in_`/`out_` prefix, where
/// DDS and `out_`-style channels live on the output side.
pub fn sysfs_path(root: &str, device: &str, channel: &str, attr: &str) -> String {
    if channel.is_empty() {
        return format!("{root}/{device}/{attr}");
    }
    let (prefix, channel) = if let Some(rest) = channel.strip_prefix("out_") {
        ("out", rest)
    } else if channel.starts_with("altvoltage") {
        ("out", channel)
    } else {
        ("in", channel)
    };
    format!("{root}/{device}/{prefix}_{channel}_{attr}")
}

/// Wrap-safe single-quoted payload: each embedded quote closes the quoted
/// span, emits an escaped quote, and reopens it.
fn escape_single_quoted(value: &str) -> String {
    value.replace('\'', r"'\''")
}
