use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpStream, UdpSocket, UnixStream};
use tokio::time::timeout;

use crate::vg::tls::{self, ClientTlsOpts, TlsPeerInfo};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Auto,
    V4,
    V6,
}

#[derive(Debug)]
enum Inner {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsSrv(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    Unix(UnixStream),
    Udp(UdpSocket),
    Closed,
}

/// A connected, deadline-bounded byte stream over TCP, UDP, UNIX or TLS.
///
/// Every blocking call respects the transport's current timeout. Hard I/O and
/// protocol failures are returned as errors; probes additionally record soft
/// failures via `set_error` so a check can degrade without tearing the
/// connection down.
#[derive(Debug)]
pub struct Transport {
    inner: Inner,
    timeout: Duration,
    rdbuf: VecDeque<u8>,
    last_error: Option<String>,
    remote_host: String,
    remote_port: u16,
    tls_peer: Option<TlsPeerInfo>,
}

impl Transport {
    /// Resolve, connect and (optionally) complete a TLS handshake against
    /// host:port, all within `timeout_ms`.
    pub async fn connect(
        host: &str,
        port: u16,
        kind: SocketKind,
        family: Family,
        tls_opts: Option<&ClientTlsOpts>,
        timeout_ms: u64,
    ) -> anyhow::Result<Transport> {
        let deadline = Duration::from_millis(timeout_ms);
        let addrs = resolve(host, port, family, deadline).await?;

        let mut last_err: Option<anyhow::Error> = None;
        for addr in addrs {
            match connect_addr(host, addr, kind, tls_opts, deadline).await {
                Ok(t) => return Ok(t),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("resolve {host}: no addresses")))
    }

    /// Connect to a UNIX-domain socket path. Datagram sockets are not
    /// supported on this path; `kind` must be `Tcp` (stream).
    pub async fn connect_unix(path: &Path, kind: SocketKind, timeout_ms: u64) -> anyhow::Result<Transport> {
        anyhow::ensure!(
            kind == SocketKind::Tcp,
            "unix transport supports stream sockets only"
        );
        let deadline = Duration::from_millis(timeout_ms);
        let stream = timeout(deadline, UnixStream::connect(path))
            .await
            .map_err(|_| anyhow::anyhow!("timeout connecting to {}", path.display()))?
            .with_context(|| format!("connect {}", path.display()))?;
        Ok(Transport {
            inner: Inner::Unix(stream),
            timeout: deadline,
            rdbuf: VecDeque::new(),
            last_error: None,
            remote_host: path.display().to_string(),
            remote_port: 0,
            tls_peer: None,
        })
    }

    /// Wrap an accepted TCP connection, optionally completing a server-side
    /// TLS handshake first.
    pub async fn from_accepted(
        stream: TcpStream,
        peer: SocketAddr,
        acceptor: Option<&tokio_rustls::TlsAcceptor>,
        timeout_ms: u64,
    ) -> anyhow::Result<Transport> {
        let deadline = Duration::from_millis(timeout_ms);
        let inner = match acceptor {
            Some(a) => {
                let tls = timeout(deadline, a.accept(stream))
                    .await
                    .map_err(|_| anyhow::anyhow!("TLS accept timeout from {peer}"))?
                    .with_context(|| format!("TLS accept from {peer}"))?;
                Inner::TlsSrv(Box::new(tls))
            }
            None => Inner::Tcp(stream),
        };
        Ok(Transport {
            inner,
            timeout: deadline,
            rdbuf: VecDeque::new(),
            last_error: None,
            remote_host: peer.ip().to_string(),
            remote_port: peer.port(),
            tls_peer: None,
        })
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.timeout = Duration::from_millis(timeout_ms);
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.inner, Inner::Udp(_))
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.inner, Inner::Tls(_) | Inner::TlsSrv(_))
    }

    /// Peer certificate info captured at TLS handshake time.
    pub fn tls_peer(&self) -> Option<&TlsPeerInfo> {
        self.tls_peer.as_ref()
    }

    /// Record a soft protocol-level failure. The caller keeps the transport.
    pub fn set_error(&mut self, msg: impl Into<String>) {
        self.last_error = Some(msg.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Upgrade an already-connected TCP transport to TLS in place (STARTTLS).
    pub async fn switch_to_tls(&mut self, opts: &ClientTlsOpts) -> anyhow::Result<()> {
        match &self.inner {
            Inner::Tcp(_) => {}
            Inner::Udp(_) => anyhow::bail!("TLS is unsupported on UDP transports"),
            _ => anyhow::bail!("transport is not a plain TCP stream"),
        }
        let Inner::Tcp(stream) = std::mem::replace(&mut self.inner, Inner::Closed) else {
            unreachable!()
        };
        let (tls, peer) = tls::client_handshake(opts, &self.remote_host, stream, self.timeout).await?;
        self.inner = Inner::Tls(Box::new(tls));
        self.tls_peer = Some(peer);
        Ok(())
    }

    /// Write a text string.
    pub async fn print(&mut self, s: impl AsRef<str>) -> anyhow::Result<usize> {
        self.write_bytes(s.as_ref().as_bytes()).await
    }

    pub async fn write_bytes(&mut self, buf: &[u8]) -> anyhow::Result<usize> {
        let d = self.timeout;
        let r = match &mut self.inner {
            Inner::Tcp(s) => timeout(d, s.write_all(buf)).await,
            Inner::Tls(s) => timeout(d, s.write_all(buf)).await,
            Inner::TlsSrv(s) => timeout(d, s.write_all(buf)).await,
            Inner::Unix(s) => timeout(d, s.write_all(buf)).await,
            Inner::Udp(s) => {
                return match timeout(d, s.send(buf)).await {
                    Ok(Ok(n)) => Ok(n),
                    Ok(Err(e)) => Err(e).context("udp send"),
                    Err(_) => Err(anyhow::anyhow!("timeout writing to {}", self.remote_host)),
                };
            }
            Inner::Closed => anyhow::bail!("transport is closed"),
        };
        match r {
            Ok(Ok(())) => Ok(buf.len()),
            Ok(Err(e)) => Err(e).context("write"),
            Err(_) => Err(anyhow::anyhow!("timeout writing to {}", self.remote_host)),
        }
    }

    /// Read up to `buf.len()` bytes. Returns whatever a single receive made
    /// available by the deadline; 0 means end of stream. The caller decides
    /// whether a short read is a protocol failure.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.rdbuf.is_empty() {
            let n = buf.len().min(self.rdbuf.len());
            for b in buf.iter_mut().take(n) {
                *b = self.rdbuf.pop_front().unwrap();
            }
            return Ok(n);
        }
        let d = self.timeout;
        let host = self.remote_host.clone();
        let r = match &mut self.inner {
            Inner::Tcp(s) => timeout(d, s.read(buf)).await,
            Inner::Tls(s) => timeout(d, s.read(buf)).await,
            Inner::TlsSrv(s) => timeout(d, s.read(buf)).await,
            Inner::Unix(s) => timeout(d, s.read(buf)).await,
            Inner::Udp(s) => timeout(d, s.recv(buf)).await,
            Inner::Closed => anyhow::bail!("transport is closed"),
        };
        match r {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e).with_context(|| format!("read from {host}")),
            Err(_) => Err(anyhow::anyhow!("timeout reading from {host}")),
        }
    }

    /// Read a single byte, or None at end of stream.
    pub async fn read_byte(&mut self) -> anyhow::Result<Option<u8>> {
        if let Some(b) = self.rdbuf.pop_front() {
            return Ok(Some(b));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.read_bytes(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        self.rdbuf.extend(&chunk[..n]);
        Ok(self.rdbuf.pop_front())
    }

    /// Read a line of at most `max` bytes, stopping after `\n` (included) or
    /// at end of stream. Returns the line without the trailing `\r\n`.
    pub async fn read_line(&mut self, max: usize) -> anyhow::Result<String> {
        let mut out: Vec<u8> = Vec::new();
        while out.len() + 1 < max {
            match self.read_byte().await? {
                Some(b) => {
                    out.push(b);
                    if b == b'\n' {
                        break;
                    }
                }
                None => {
                    if out.is_empty() {
                        anyhow::bail!("end of stream from {}", self.remote_host);
                    }
                    break;
                }
            }
        }
        let mut s = String::from_utf8_lossy(&out).into_owned();
        while s.ends_with('\n') || s.ends_with('\r') {
            s.pop();
        }
        Ok(s)
    }

    /// True when buffered or in-flight data is available to read right away.
    pub async fn is_ready(&mut self) -> bool {
        if !self.rdbuf.is_empty() {
            return true;
        }
        let probe = match &self.inner {
            Inner::Tcp(s) => timeout(Duration::from_millis(0), s.ready(Interest::READABLE)).await,
            Inner::Tls(s) => {
                let (io, _) = s.get_ref();
                timeout(Duration::from_millis(0), io.ready(Interest::READABLE)).await
            }
            Inner::TlsSrv(s) => {
                let (io, _) = s.get_ref();
                timeout(Duration::from_millis(0), io.ready(Interest::READABLE)).await
            }
            Inner::Unix(s) => timeout(Duration::from_millis(0), s.ready(Interest::READABLE)).await,
            Inner::Udp(s) => timeout(Duration::from_millis(0), s.ready(Interest::READABLE)).await,
            Inner::Closed => return false,
        };
        matches!(probe, Ok(Ok(_)))
    }

    /// Drop any buffered input.
    pub fn reset(&mut self) {
        self.rdbuf.clear();
    }

    /// Shut down the writing side of a stream transport.
    pub async fn shutdown_write(&mut self) -> anyhow::Result<()> {
        match &mut self.inner {
            Inner::Tcp(s) => s.shutdown().await.context("shutdown"),
            Inner::Tls(s) => s.shutdown().await.context("shutdown"),
            Inner::TlsSrv(s) => s.shutdown().await.context("shutdown"),
            Inner::Unix(s) => s.shutdown().await.context("shutdown"),
            Inner::Udp(_) => anyhow::bail!("shutdown is unsupported on UDP transports"),
            Inner::Closed => anyhow::bail!("transport is closed"),
        }
    }

    pub fn set_nodelay(&mut self) -> anyhow::Result<()> {
        match &self.inner {
            Inner::Tcp(s) => s.set_nodelay(true).context("set_nodelay"),
            Inner::Tls(s) => s.get_ref().0.set_nodelay(true).context("set_nodelay"),
            Inner::TlsSrv(s) => s.get_ref().0.set_nodelay(true).context("set_nodelay"),
            _ => Ok(()),
        }
    }
}

async fn resolve(host: &str, port: u16, family: Family, d: Duration) -> anyhow::Result<Vec<SocketAddr>> {
    let lookup = timeout(d, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| anyhow::anyhow!("timeout resolving {host}"))?
        .with_context(|| format!("resolve {host}"))?;
    let addrs: Vec<SocketAddr> = lookup
        .filter(|a| match family {
            Family::Auto => true,
            Family::V4 => a.is_ipv4(),
            Family::V6 => a.is_ipv6(),
        })
        .collect();
    anyhow::ensure!(!addrs.is_empty(), "resolve {host}: no address for requested family");
    Ok(addrs)
}

async fn connect_addr(
    host: &str,
    addr: SocketAddr,
    kind: SocketKind,
    tls_opts: Option<&ClientTlsOpts>,
    d: Duration,
) -> anyhow::Result<Transport> {
    match kind {
        SocketKind::Tcp => {
            let stream = timeout(d, TcpStream::connect(addr))
                .await
                .map_err(|_| anyhow::anyhow!("timeout connecting to {host}:{}", addr.port()))?
                .with_context(|| format!("connect {host}:{}", addr.port()))?;
            let mut t = Transport {
                inner: Inner::Tcp(stream),
                timeout: d,
                rdbuf: VecDeque::new(),
                last_error: None,
                remote_host: host.to_string(),
                remote_port: addr.port(),
                tls_peer: None,
            };
            if let Some(opts) = tls_opts {
                t.switch_to_tls(opts).await?;
            }
            Ok(t)
        }
        SocketKind::Udp => {
            anyhow::ensure!(tls_opts.is_none(), "TLS is unsupported on UDP transports");
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let sock = UdpSocket::bind(bind).await.context("bind udp")?;
            sock.connect(addr)
                .await
                .with_context(|| format!("connect {host}:{}", addr.port()))?;
            Ok(Transport {
                inner: Inner::Udp(sock),
                timeout: d,
                rdbuf: VecDeque::new(),
                last_error: None,
                remote_host: host.to_string(),
                remote_port: addr.port(),
                tls_peer: None,
            })
        }
    }
}
