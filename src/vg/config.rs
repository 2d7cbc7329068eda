use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::vg::service::{parse_service_yaml, validate_graph, Service};
use crate::vg::tls::ServerTlsOpts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Validator cycle length in seconds.
    pub polltime: u64,
    /// Hostname reported in events and exec environments; defaults to the
    /// system hostname.
    pub hostname: Option<String>,
    pub config_directory: PathBuf,
    pub statefile: PathBuf,
    pub pidfile: PathBuf,
    pub logfile: Option<PathBuf>,
    /// Verbosity from repeated -v; at >=1 child output is drained into the
    /// debug log.
    pub debug: u8,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Serve on a UNIX socket path instead of TCP.
    pub unix_socket: Option<PathBuf>,
    pub tls: ChannelTlsConfig,
    pub auth: ChannelAuthConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelTlsConfig {
    pub enabled: bool,
    /// Certificate chain + private key, single PEM file. Auto-generated
    /// self-signed material is written here when the file is missing.
    pub pemfile: Option<PathBuf>,
    pub client_ca: Option<PathBuf>,
    pub allow_self_signed: bool,
}

impl ChannelTlsConfig {
    pub fn server_opts(&self) -> Option<ServerTlsOpts> {
        if !self.enabled {
            return None;
        }
        Some(ServerTlsOpts {
            pemfile: self.pemfile.clone().unwrap_or_else(|| PathBuf::from("vigild.pem")),
            client_ca: self.client_ca.clone(),
            allow_self_signed: self.allow_self_signed,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelAuthConfig {
    /// htpasswd-style entries: `user:$2b$...` (bcrypt) or `user:password`
    /// (cleartext, required for the in-binary CLI client).
    pub users: Vec<String>,
    /// Credential the CLI client presents, `user:password`. Defaults to the
    /// first cleartext entry in `users`.
    pub credential: Option<String>,
}

impl ChannelAuthConfig {
    /// Resolve the credential the CLI uses against the running daemon.
    pub fn client_credential(&self) -> Option<String> {
        if let Some(c) = &self.credential {
            return Some(c.clone());
        }
        self.users
            .iter()
            .map(|u| u.trim())
            .find(|u| {
                u.split_once(':')
                    .is_some_and(|(user, pass)| !user.is_empty() && !pass.starts_with("$2"))
            })
            .map(|u| u.to_string())
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    #[serde(default)]
    global: Option<GlobalConfigFile>,
    #[serde(default)]
    control_channel: Option<ChannelConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    #[serde(default = "default_polltime")]
    polltime: u64,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    config_directory: Option<PathBuf>,
    #[serde(default)]
    statefile: Option<PathBuf>,
    #[serde(default)]
    pidfile: Option<PathBuf>,
    #[serde(default)]
    logfile: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelConfigFile {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    unix_socket: Option<PathBuf>,
    #[serde(default)]
    tls: Option<ChannelTlsConfigFile>,
    #[serde(default)]
    auth: Option<ChannelAuthConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelTlsConfigFile {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    pemfile: Option<PathBuf>,
    #[serde(default)]
    client_ca: Option<PathBuf>,
    #[serde(default)]
    allow_self_signed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChannelAuthConfigFile {
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    credential: Option<String>,
}

fn default_polltime() -> u64 {
    30
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2812
}

fn default_config_directory() -> PathBuf {
    "config.d".into()
}

fn default_statefile() -> PathBuf {
    "vigild.state".into()
}

fn default_pidfile() -> PathBuf {
    "vigild.pid".into()
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: MasterConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    // Start from defaults and overlay provided groups.
    let mut cfg = MasterConfig {
        polltime: default_polltime(),
        hostname: None,
        config_directory: default_config_directory(),
        statefile: default_statefile(),
        pidfile: default_pidfile(),
        logfile: None,
        debug: 0,
        channel: ChannelConfig {
            enabled: false,
            bind: default_bind(),
            port: default_port(),
            unix_socket: None,
            tls: ChannelTlsConfig::default(),
            auth: ChannelAuthConfig::default(),
        },
    };

    if let Some(gl) = file_cfg.global {
        anyhow::ensure!(gl.polltime > 0, "global.polltime must be positive");
        cfg.polltime = gl.polltime;
        cfg.hostname = gl.hostname.map(|h| h.trim().to_string()).filter(|h| !h.is_empty());
        if let Some(cd) = gl.config_directory {
            cfg.config_directory = cd;
        }
        if let Some(p) = gl.statefile {
            cfg.statefile = p;
        }
        if let Some(p) = gl.pidfile {
            cfg.pidfile = p;
        }
        cfg.logfile = gl.logfile;
    }

    if let Some(cc) = file_cfg.control_channel {
        cfg.channel.enabled = cc.enabled;
        cfg.channel.bind = cc.bind;
        cfg.channel.port = cc.port;
        cfg.channel.unix_socket = cc.unix_socket;
        if let Some(tls) = cc.tls {
            cfg.channel.tls.enabled = tls.enabled;
            cfg.channel.tls.pemfile = tls.pemfile;
            cfg.channel.tls.client_ca = tls.client_ca;
            cfg.channel.tls.allow_self_signed = tls.allow_self_signed;
        }
        if let Some(auth) = cc.auth {
            cfg.channel.auth.users = auth.users;
            cfg.channel.auth.credential = auth.credential;
        }
    }

    validate_channel(&cfg)?;

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    let resolve = |p: &mut PathBuf| {
        if p.is_relative() {
            *p = base.join(&*p);
        }
    };
    resolve(&mut cfg.config_directory);
    resolve(&mut cfg.statefile);
    resolve(&mut cfg.pidfile);
    if let Some(p) = &mut cfg.logfile {
        resolve(p);
    }
    if let Some(p) = &mut cfg.channel.unix_socket {
        resolve(p);
    }
    if let Some(p) = &mut cfg.channel.tls.pemfile {
        resolve(p);
    }
    if let Some(p) = &mut cfg.channel.tls.client_ca {
        resolve(p);
    }

    Ok(cfg)
}

fn validate_channel(cfg: &MasterConfig) -> anyhow::Result<()> {
    let cc = &cfg.channel;
    if !cc.enabled {
        return Ok(());
    }
    if cc.unix_socket.is_none() {
        let _addr: std::net::SocketAddr = format!("{}:{}", cc.bind, cc.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("control_channel bind/port invalid: {e}"))?;
    }
    anyhow::ensure!(
        !cc.auth.users.is_empty(),
        "control_channel.enabled=true but control_channel.auth.users is empty"
    );
    for u in &cc.auth.users {
        let t = u.trim();
        anyhow::ensure!(
            t.split_once(':').is_some_and(|(user, pass)| !user.is_empty() && !pass.is_empty()),
            "invalid control_channel.auth.users entry (expected 'user:hash' or 'user:password'): {t:?}"
        );
    }
    if let Some(c) = &cc.auth.credential {
        anyhow::ensure!(
            c.split_once(':').is_some_and(|(user, pass)| !user.is_empty() && !pass.is_empty()),
            "invalid control_channel.auth.credential (expected 'user:password')"
        );
    }
    if cc.tls.enabled {
        anyhow::ensure!(
            cc.unix_socket.is_none(),
            "control_channel TLS is only supported on TCP, not unix_socket"
        );
    }
    Ok(())
}

/// The daemon hostname: configured value or the system one.
pub fn effective_hostname(cfg: &MasterConfig) -> String {
    if let Some(h) = &cfg.hostname {
        return h.clone();
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Load every service definition under the config directory (`*.yaml` /
/// `*.yml`, sorted), enforce unique names and validate the dependency graph.
pub fn load_services(cfg: &MasterConfig) -> anyhow::Result<BTreeMap<String, Service>> {
    let dir = &cfg.config_directory;
    let mut files: Vec<PathBuf> = Vec::new();
    let rd = std::fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("failed to read config directory {}: {e}", dir.display()))?;
    for ent in rd {
        let ent = ent?;
        let p = ent.path();
        let is_yaml = p
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "yaml" | "yml"))
            .unwrap_or(false);
        if ent.file_type()?.is_file() && is_yaml {
            files.push(p);
        }
    }
    files.sort();

    let mut services: BTreeMap<String, Service> = BTreeMap::new();
    for f in files {
        let text = std::fs::read_to_string(&f)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", f.display()))?;
        let svc = parse_service_yaml(&text, &f)?;
        if let Some(prev) = services.get(&svc.name) {
            anyhow::bail!(
                "duplicate service name {:?} in {} and {}",
                svc.name,
                prev.source_file.as_deref().unwrap_or(Path::new("?")).display(),
                f.display()
            );
        }
        services.insert(svc.name.clone(), svc);
    }

    validate_graph(&services)?;
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(dir: &Path, text: &str) -> PathBuf {
        let path = dir.join("vigild.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_apply_and_paths_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "global:\n  polltime: 10\n");
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.polltime, 10);
        assert_eq!(cfg.config_directory, dir.path().join("config.d"));
        assert_eq!(cfg.statefile, dir.path().join("vigild.state"));
        assert!(!cfg.channel.enabled);
        assert_eq!(cfg.channel.port, 2812);
    }

    #[test]
    fn channel_requires_users() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "control_channel:\n  enabled: true\n",
        );
        let err = load_master_config(&path).unwrap_err();
        assert!(err.to_string().contains("users is empty"), "{err}");
    }

    #[test]
    fn channel_auth_entries_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "control_channel:\n  enabled: true\n  auth:\n    users: [\"broken\"]\n",
        );
        let err = load_master_config(&path).unwrap_err();
        assert!(err.to_string().contains("user:hash"), "{err}");
    }

    #[test]
    fn client_credential_prefers_explicit_then_cleartext() {
        let auth = ChannelAuthConfig {
            users: vec![
                "ops:$2b$10$abcdefghijklmnopqrstuv".to_string(),
                "cli:swordfish".to_string(),
            ],
            credential: None,
        };
        assert_eq!(auth.client_credential().as_deref(), Some("cli:swordfish"));

        let auth = ChannelAuthConfig {
            users: vec!["ops:$2b$10$abcdefghijklmnopqrstuv".to_string()],
            credential: Some("admin:secret".to_string()),
        };
        assert_eq!(auth.client_credential().as_deref(), Some("admin:secret"));

        let auth = ChannelAuthConfig {
            users: vec!["ops:$2b$10$abcdefghijklmnopqrstuv".to_string()],
            credential: None,
        };
        assert!(auth.client_credential().is_none());
    }

    #[test]
    fn services_load_from_config_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "global:\n  polltime: 5\n");
        let cfg = load_master_config(&path).unwrap();
        std::fs::create_dir_all(&cfg.config_directory).unwrap();
        std::fs::write(
            cfg.config_directory.join("a.yaml"),
            "service:\n  name: a\n  type: system\n",
        )
        .unwrap();
        std::fs::write(
            cfg.config_directory.join("b.yaml"),
            "service:\n  name: b\n  type: system\n  depends: [a]\n",
        )
        .unwrap();
        let services = load_services(&cfg).unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services["b"].depends, vec!["a"]);
    }

    #[test]
    fn duplicate_service_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "global: {polltime: 5}\n");
        let cfg = load_master_config(&path).unwrap();
        std::fs::create_dir_all(&cfg.config_directory).unwrap();
        for f in ["x.yaml", "y.yaml"] {
            std::fs::write(
                cfg.config_directory.join(f),
                "service:\n  name: same\n  type: system\n",
            )
            .unwrap();
        }
        let err = load_services(&cfg).unwrap_err();
        assert!(err.to_string().contains("duplicate service name"), "{err}");
    }
}
