use serde::{Deserialize, Serialize};

use crate::vg::tls::ClientTlsOpts;
use crate::vg::transport::Transport;

pub mod default;
pub mod dns;
pub mod ftp;
pub mod gps;
pub mod http;
pub mod imap;
pub mod ldap3;
pub mod memcache;
pub mod mysql;
pub mod ntp3;
pub mod pop;
pub mod postgresql;
pub mod radius;
pub mod redis;
pub mod rsync;
pub mod sieve;
pub mod sip;
pub mod smtp;
pub mod ssh;
pub mod websocket;

/// Buffer cap for single protocol lines.
pub(crate) const LINE_MAX: usize = 512;

/// Application-protocol liveness checks. A probe drives the transport through
/// a handshake and reports failure with a descriptive message; it never
/// closes the transport. Probes negotiating STARTTLS receive the connection
/// rule's TLS options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum Protocol {
    Default {
        #[serde(default)]
        send: Option<String>,
        #[serde(default)]
        expect: Option<String>,
    },
    Http {
        #[serde(default = "default_path")]
        path: String,
    },
    Imap,
    Smtp {
        #[serde(default)]
        starttls: bool,
    },
    Pop,
    Ftp,
    Ssh,
    Ntp3,
    Radius {
        #[serde(default = "default_radius_secret")]
        secret: String,
    },
    Rsync,
    Gps,
    Redis,
    Memcache,
    Sieve,
    Dns,
    Mysql,
    Postgresql,
    Ldap3,
    Sip {
        #[serde(default)]
        target: Option<String>,
    },
    Websocket {
        #[serde(default = "default_path")]
        path: String,
    },
}

fn default_path() -> String {
    "/".to_string()
}

fn default_radius_secret() -> String {
    "testing123".to_string()
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Default { .. } => "default",
            Protocol::Http { .. } => "http",
            Protocol::Imap => "imap",
            Protocol::Smtp { .. } => "smtp",
            Protocol::Pop => "pop",
            Protocol::Ftp => "ftp",
            Protocol::Ssh => "ssh",
            Protocol::Ntp3 => "ntp3",
            Protocol::Radius { .. } => "radius",
            Protocol::Rsync => "rsync",
            Protocol::Gps => "gps",
            Protocol::Redis => "redis",
            Protocol::Memcache => "memcache",
            Protocol::Sieve => "sieve",
            Protocol::Dns => "dns",
            Protocol::Mysql => "mysql",
            Protocol::Postgresql => "postgresql",
            Protocol::Ldap3 => "ldap3",
            Protocol::Sip { .. } => "sip",
            Protocol::Websocket { .. } => "websocket",
        }
    }

    pub async fn check(&self, t: &mut Transport, starttls: Option<&ClientTlsOpts>) -> anyhow::Result<()> {
        match self {
            Protocol::Default { send, expect } => default::check(t, send.as_deref(), expect.as_deref()).await,
            Protocol::Http { path } => http::check(t, path).await,
            Protocol::Imap => imap::check(t).await,
            Protocol::Smtp { starttls: tls } => smtp::check(t, *tls, starttls).await,
            Protocol::Pop => pop::check(t).await,
            Protocol::Ftp => ftp::check(t).await,
            Protocol::Ssh => ssh::check(t).await,
            Protocol::Ntp3 => ntp3::check(t).await,
            Protocol::Radius { secret } => radius::check(t, secret).await,
            Protocol::Rsync => rsync::check(t).await,
            Protocol::Gps => gps::check(t).await,
            Protocol::Redis => redis::check(t).await,
            Protocol::Memcache => memcache::check(t).await,
            Protocol::Sieve => sieve::check(t).await,
            Protocol::Dns => dns::check(t).await,
            Protocol::Mysql => mysql::check(t).await,
            Protocol::Postgresql => postgresql::check(t).await,
            Protocol::Ldap3 => ldap3::check(t).await,
            Protocol::Sip { target } => sip::check(t, target.as_deref()).await,
            Protocol::Websocket { path } => websocket::check(t, path).await,
        }
    }
}

pub(crate) fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    let (line, prefix) = (line.as_bytes(), prefix.as_bytes());
    line.len() >= prefix.len() && line[..prefix.len()].eq_ignore_ascii_case(prefix)
}
