use anyhow::Context as _;
use md5::{Digest as _, Md5};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Protocol version selector for outbound TLS. SSLv2/SSLv3 are rejected at
/// config parse time; rustls cannot speak them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsVersion {
    #[default]
    Auto,
    TlsV12,
    TlsV13,
}

impl TryFrom<String> for TlsVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(TlsVersion::Auto),
            "tlsv12" | "tlsv1.2" | "tls12" => Ok(TlsVersion::TlsV12),
            "tlsv13" | "tlsv1.3" | "tls13" => Ok(TlsVersion::TlsV13),
            "sslv2" | "sslv3" => Err(format!("{s} is not supported - use TLS")),
            other => Err(format!("unknown TLS version {other:?}")),
        }
    }
}

impl From<TlsVersion> for String {
    fn from(v: TlsVersion) -> String {
        match v {
            TlsVersion::Auto => "auto",
            TlsVersion::TlsV12 => "tlsv12",
            TlsVersion::TlsV13 => "tlsv13",
        }
        .to_string()
    }
}

/// Outbound TLS options, reusable per host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientTlsOpts {
    #[serde(default)]
    pub version: TlsVersion,
    /// Optional client certificate + key, single PEM file.
    #[serde(default)]
    pub client_pem: Option<PathBuf>,
    /// Trust anchors for chain verification. Absent means the chain is not
    /// verified; pair with `checksum` to pin the peer instead.
    #[serde(default)]
    pub ca_pem: Option<PathBuf>,
    /// Expected MD5 fingerprint of the peer leaf certificate (hex, optionally
    /// colon-separated, case-insensitive). Must cover the full digest.
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Server-side TLS material for the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerTlsOpts {
    /// Certificate chain + private key, single PEM file.
    pub pemfile: PathBuf,
    /// Client trust anchor: a CA bundle file or a directory of PEM files.
    /// Configured means client certificates are required (mTLS).
    #[serde(default)]
    pub client_ca: Option<PathBuf>,
    /// Accept self-signed client certificates, provided they are present in
    /// the trust store.
    #[serde(default)]
    pub allow_self_signed: bool,
}

/// Peer leaf certificate captured after the handshake.
#[derive(Debug, Clone)]
pub struct TlsPeerInfo {
    pub leaf_der: Vec<u8>,
    pub md5: [u8; 16],
}

impl TlsPeerInfo {
    pub fn md5_hex(&self) -> String {
        self.md5.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Normalize and decode a configured fingerprint. The hex string must cover
/// the full 16-byte digest; short prefixes are rejected.
pub fn decode_fingerprint(expected: &str) -> anyhow::Result<[u8; 16]> {
    let hex: String = expected
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    anyhow::ensure!(
        hex.len() == 32,
        "fingerprint must be 32 hex digits, got {} in {expected:?}",
        hex.len()
    );
    let mut out = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).unwrap();
        out[i] = u8::from_str_radix(s, 16)
            .map_err(|_| anyhow::anyhow!("invalid hex in fingerprint {expected:?}"))?;
    }
    Ok(out)
}

fn md5_of(der: &[u8]) -> [u8; 16] {
    let mut h = Md5::new();
    h.update(der);
    h.finalize().into()
}

static TLS12_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS12];
static TLS13_ONLY: [&rustls::SupportedProtocolVersion; 1] = [&rustls::version::TLS13];

fn protocol_versions(v: TlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match v {
        TlsVersion::Auto => rustls::ALL_VERSIONS,
        TlsVersion::TlsV12 => &TLS12_ONLY,
        TlsVersion::TlsV13 => &TLS13_ONLY,
    }
}

fn read_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut reader: &[u8] = &data;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "{} contains no certificates", path.display());
    Ok(certs)
}

fn read_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut reader: &[u8] = &data;
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("{} contains no private key", path.display()))
}

/// Load a single-PEM identity (certificate chain followed by the key).
pub fn load_pem_identity(path: &Path) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    Ok((read_certs(path)?, read_private_key(path)?))
}

/// Collect trust-anchor certificates from a CA bundle file or a directory of
/// PEM files.
fn read_trust_material(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let md = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if md.is_dir() {
        let mut out = Vec::new();
        for ent in std::fs::read_dir(path).with_context(|| format!("read_dir {}", path.display()))? {
            let ent = ent?;
            let p = ent.path();
            let is_pem = p
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "pem" | "crt" | "cer"))
                .unwrap_or(false);
            if ent.file_type()?.is_file() && is_pem {
                out.extend(read_certs(&p)?);
            }
        }
        anyhow::ensure!(!out.is_empty(), "{} contains no PEM certificates", path.display());
        Ok(out)
    } else {
        read_certs(path)
    }
}

fn supported_algorithms() -> rustls::crypto::WebPkiSupportedAlgorithms {
    rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms
}

/// Accepts any presented server chain. Used when no trust anchors are
/// configured; the caller is expected to pin the peer by fingerprint.
#[derive(Debug)]
struct AcceptAnyServerCert {
    supported: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Client certificate policy: the chain must verify against the trust store
/// (or be an allowed self-signed certificate), and the presented leaf must be
/// byte-present in the store.
#[derive(Debug)]
struct PinnedClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    trusted: HashSet<Vec<u8>>,
    allow_self_signed: bool,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let presented = self.trusted.contains(end_entity.as_ref());
        match self.inner.verify_client_cert(end_entity, intermediates, now) {
            Ok(v) => {
                if presented {
                    Ok(v)
                } else {
                    Err(rustls::Error::General(
                        "client certificate is not present in the trust store".to_string(),
                    ))
                }
            }
            Err(e) => {
                if self.allow_self_signed && presented && intermediates.is_empty() {
                    Ok(ClientCertVerified::assertion())
                } else {
                    Err(e)
                }
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Build the immutable client config for the given options.
pub fn build_client_config(opts: &ClientTlsOpts) -> anyhow::Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_protocol_versions(protocol_versions(opts.version));

    let builder = match &opts.ca_pem {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            for c in read_trust_material(ca)? {
                roots
                    .add(c)
                    .with_context(|| format!("add trust anchor from {}", ca.display()))?;
            }
            builder.with_root_certificates(roots)
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                supported: supported_algorithms(),
            })),
    };

    let cfg = match &opts.client_pem {
        Some(pem) => {
            let (chain, key) = load_pem_identity(pem)?;
            builder
                .with_client_auth_cert(chain, key)
                .with_context(|| format!("client identity {}", pem.display()))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(cfg))
}

/// Build the server config: single-PEM identity, optional mTLS trust store,
/// no session cache.
pub fn build_server_config(opts: &ServerTlsOpts) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let (chain, key) = load_pem_identity(&opts.pemfile)?;

    let verifier: Arc<dyn ClientCertVerifier> = match &opts.client_ca {
        None => WebPkiClientVerifier::no_client_auth(),
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            let mut trusted: HashSet<Vec<u8>> = HashSet::new();
            for c in read_trust_material(ca_path)? {
                trusted.insert(c.as_ref().to_vec());
                roots
                    .add(c)
                    .with_context(|| format!("add client CA from {}", ca_path.display()))?;
            }
            // The daemon's own identity is trusted too, so a local CLI client
            // can authenticate with the server PEM.
            for c in &chain {
                trusted.insert(c.as_ref().to_vec());
                let _ = roots.add(c.clone());
            }
            let inner = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow::anyhow!("build client verifier: {e}"))?;
            Arc::new(PinnedClientVerifier {
                inner,
                trusted,
                allow_self_signed: opts.allow_self_signed,
            })
        }
    };

    let mut cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("server certificate/key mismatch")?;
    cfg.session_storage = Arc::new(rustls::server::NoServerSessionStorage {});
    Ok(Arc::new(cfg))
}

/// Complete a client handshake over an already-connected TCP stream, capture
/// the peer leaf, and enforce the configured fingerprint pin.
pub async fn client_handshake(
    opts: &ClientTlsOpts,
    host: &str,
    stream: TcpStream,
    deadline: Duration,
) -> anyhow::Result<(tokio_rustls::client::TlsStream<TcpStream>, TlsPeerInfo)> {
    let config = build_client_config(opts)?;
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| anyhow::anyhow!("invalid TLS server name {host:?}"))?;

    let tls = timeout(deadline, connector.connect(server_name, stream))
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timeout with {host}"))?
        .with_context(|| format!("TLS handshake with {host}"))?;

    let leaf = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|c| c.first())
        .ok_or_else(|| anyhow::anyhow!("TLS peer {host} presented no certificate"))?;
    let peer = TlsPeerInfo {
        leaf_der: leaf.as_ref().to_vec(),
        md5: md5_of(leaf.as_ref()),
    };

    if let Some(expected) = &opts.checksum {
        let want = decode_fingerprint(expected)?;
        if want != peer.md5 {
            anyhow::bail!(
                "fingerprint mismatch for {host}: expected {expected}, peer has {}",
                peer.md5_hex()
            );
        }
    }

    Ok((tls, peer))
}

/// Generate a self-signed single-PEM identity (certificate then key) if the
/// file does not exist yet. Returns true when material was created.
pub fn ensure_server_pem(path: &Path, hostname: &str) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use time::{Duration as TimeDuration, OffsetDateTime};

    let key = KeyPair::generate().map_err(|e| anyhow::anyhow!("generate key: {e}"))?;
    let mut names = vec!["localhost".to_string()];
    if !hostname.trim().is_empty() && hostname != "localhost" {
        names.push(hostname.trim().to_ascii_lowercase());
    }
    let mut params = CertificateParams::new(names).map_err(|e| anyhow::anyhow!("cert params: {e}"))?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(std::net::IpAddr::from([127, 0, 0, 1])));
    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::days(1);
    params.not_after = now + TimeDuration::days(365 * 10);
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "vigild");
        dn
    };
    let cert = params
        .self_signed(&key)
        .map_err(|e| anyhow::anyhow!("self-sign certificate: {e}"))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pem = format!("{}{}", cert.pem(), key.serialize_pem());
    std::fs::write(path, pem.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_requires_full_length() {
        assert!(decode_fingerprint("d4:1d:8c:d9:8f:00:b2:04:e9:80:09:98:ec:f8:42:7e").is_ok());
        assert!(decode_fingerprint("D41D8CD98F00B204E9800998ECF8427E").is_ok());
        // Short prefixes are a config error, not a lenient match.
        assert!(decode_fingerprint("d41d8cd9").is_err());
        assert!(decode_fingerprint("").is_err());
        assert!(decode_fingerprint("zz1d8cd98f00b204e9800998ecf8427e").is_err());
    }

    #[test]
    fn fingerprint_is_case_insensitive() {
        let a = decode_fingerprint("D41D8CD98F00B204E9800998ECF8427E").unwrap();
        let b = decode_fingerprint("d41d8cd98f00b204e9800998ecf8427e").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sslv2_and_sslv3_are_rejected() {
        let err = TlsVersion::try_from("sslv2".to_string()).unwrap_err();
        assert!(err.contains("use TLS"), "{err}");
        let err = TlsVersion::try_from("sslv3".to_string()).unwrap_err();
        assert!(err.contains("use TLS"), "{err}");
        assert_eq!(TlsVersion::try_from("auto".to_string()).unwrap(), TlsVersion::Auto);
        assert_eq!(
            TlsVersion::try_from("tlsv1.2".to_string()).unwrap(),
            TlsVersion::TlsV12
        );
    }

    #[test]
    fn autogen_writes_single_pem_identity() {
        let dir = tempfile::tempdir().unwrap();
        let pem = dir.path().join("channel.pem");
        assert!(ensure_server_pem(&pem, "example.test").unwrap());
        assert!(!ensure_server_pem(&pem, "example.test").unwrap());
        let (chain, _key) = load_pem_identity(&pem).unwrap();
        assert_eq!(chain.len(), 1);
    }
}
