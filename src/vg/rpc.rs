use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::PathBuf;

use crate::vg::config::MasterConfig;
use crate::vg::tls::ClientTlsOpts;
use crate::vg::transport::{Family, SocketKind, Transport};

const NET_TIMEOUT_MS: u64 = 5000;
const LINE_MAX: usize = 512;

/// Where and how the CLI reaches the running daemon.
#[derive(Debug, Clone)]
pub struct ClientTarget {
    unix: Option<PathBuf>,
    host: String,
    port: u16,
    tls: Option<ClientTlsOpts>,
    credential: Option<String>,
}

impl ClientTarget {
    pub fn from_config(cfg: &MasterConfig) -> anyhow::Result<ClientTarget> {
        let cc = &cfg.channel;
        anyhow::ensure!(
            cc.enabled,
            "the control channel is disabled; enable control_channel in the configuration"
        );
        let tls = if cc.tls.enabled {
            // The daemon's autogenerated identity is self-signed; the local
            // client trusts the connection and relies on the credential.
            Some(ClientTlsOpts::default())
        } else {
            None
        };
        Ok(ClientTarget {
            unix: cc.unix_socket.clone(),
            host: if cc.bind == "0.0.0.0" || cc.bind == "::" {
                "localhost".to_string()
            } else {
                cc.bind.clone()
            },
            port: cc.port,
            tls,
            credential: cc.auth.client_credential(),
        })
    }

    async fn connect(&self) -> anyhow::Result<Transport> {
        match &self.unix {
            Some(path) => Transport::connect_unix(path, SocketKind::Tcp, NET_TIMEOUT_MS)
                .await
                .map_err(|e| anyhow::anyhow!("cannot connect to the vigild daemon ({e:#}); is it running with the control channel enabled?")),
            None => Transport::connect(
                &self.host,
                self.port,
                SocketKind::Tcp,
                Family::Auto,
                self.tls.as_ref(),
                NET_TIMEOUT_MS,
            )
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to the vigild daemon ({e:#}); is it running with the control channel enabled?")),
        }
    }

    fn auth_header(&self) -> String {
        match &self.credential {
            Some(cred) => format!("Authorization: Basic {}\r\n", BASE64.encode(cred.as_bytes())),
            None => String::new(),
        }
    }

    /// Send an action for a service and interpret the HTTP/1.0-shape reply.
    /// A status of 300 or above is a failure; its human message sits between
    /// `</h2>` and `<p>` in the body.
    pub async fn call_action(&self, service: &str, action: &str) -> anyhow::Result<()> {
        let mut t = self.connect().await?;
        let body = format!("action={action}");
        let request = format!(
            "POST /{service} HTTP/1.0\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: {}\r\n\
             {}\r\n\
             {body}",
            body.len(),
            self.auth_header()
        );
        t.print(request).await?;

        let status_line = t.read_line(LINE_MAX).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("cannot parse status in response: {status_line}"))?;

        if status >= 300 {
            let mut content_length: usize = 0;
            loop {
                let line = t.read_line(LINE_MAX).await?;
                if line.is_empty() {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(v) = lower.strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap_or(0);
                }
            }
            let mut message = None;
            if content_length > 0 && content_length < 1024 {
                let mut body = vec![0u8; content_length];
                let mut got = 0;
                while got < content_length {
                    match t.read_bytes(&mut body[got..]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => got += n,
                    }
                }
                let text = String::from_utf8_lossy(&body[..got]).into_owned();
                if let Some(after) = text.split("</h2>").nth(1) {
                    let msg = after.split("<p>").next().unwrap_or("").trim();
                    if !msg.is_empty() {
                        message = Some(msg.to_string());
                    }
                }
            }
            anyhow::bail!(
                "Action failed -- {}",
                message.as_deref().unwrap_or("unable to parse response")
            );
        }
        Ok(())
    }

    /// Fetch a plain-text resource (status/summary tables).
    pub async fn fetch_text(&self, path: &str) -> anyhow::Result<String> {
        let mut t = self.connect().await?;
        let request = format!(
            "GET {path} HTTP/1.0\r\n\
             Accept: text/plain\r\n\
             {}\r\n",
            self.auth_header()
        );
        t.print(request).await?;

        let status_line = t.read_line(LINE_MAX).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("cannot parse status in response: {status_line}"))?;
        anyhow::ensure!(status < 300, "daemon replied {status} for {path}");

        // Skip headers.
        loop {
            let line = t.read_line(LINE_MAX).await?;
            if line.is_empty() {
                break;
            }
        }
        // Body until end of stream.
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match t.read_bytes(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// POST to a built-in path (e.g. `/_validate`).
    pub async fn post_path(&self, path: &str) -> anyhow::Result<()> {
        let mut t = self.connect().await?;
        let request = format!(
            "POST {path} HTTP/1.0\r\n\
             Content-Length: 0\r\n\
             {}\r\n",
            self.auth_header()
        );
        t.print(request).await?;
        let status_line = t.read_line(LINE_MAX).await?;
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("cannot parse status in response: {status_line}"))?;
        anyhow::ensure!(status < 300, "daemon replied {status} for {path}");
        Ok(())
    }
}
