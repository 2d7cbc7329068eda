use axum::extract::{Form, Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{middleware, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::vg::config::ChannelConfig;
use crate::vg::control::{Action, Controller};
use crate::vg::event::{tasks, vg_event};
use crate::vg::service::{MonitorState, Service};
use crate::vg::tls::{build_server_config, ensure_server_pem};
use crate::vg::validator::ControlMsg;

const BODY_CAP: usize = 1024;

#[derive(Clone)]
struct ChannelState {
    ctl: Controller,
    users: Arc<HashMap<String, String>>,
    auth_cache: Arc<Mutex<AuthCache>>,
    wakeup: mpsc::Sender<ControlMsg>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct AuthCacheKey {
    user: String,
    expected: String,
    pass: String,
}

/// Bounded cache around bcrypt verification. The key includes the stored
/// hash, so a changed password invalidates cached results automatically.
struct AuthCache {
    entries: HashMap<AuthCacheKey, bool>,
    order: VecDeque<AuthCacheKey>,
}

impl AuthCache {
    const MAX_ENTRIES: usize = 1024;

    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &AuthCacheKey) -> Option<bool> {
        self.entries.get(key).copied()
    }

    fn put(&mut self, key: AuthCacheKey, val: bool) {
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, val);
        while self.entries.len() > Self::MAX_ENTRIES {
            if let Some(k) = self.order.pop_front() {
                self.entries.remove(&k);
            } else {
                break;
            }
        }
    }
}

/// Parse `user:secret` entries. Bcrypt hashes (`$2...`) are verified as
/// hashes; anything else is compared as cleartext so the local CLI can share
/// the credential.
fn parse_users(cfg: &ChannelConfig) -> anyhow::Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for entry in &cfg.auth.users {
        let t = entry.trim();
        if t.is_empty() {
            continue;
        }
        let (user, secret) = t
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("invalid auth entry (missing ':'): {t:?}"))?;
        let user = user.trim();
        let secret = secret.trim();
        anyhow::ensure!(!user.is_empty(), "invalid auth entry (empty username): {t:?}");
        anyhow::ensure!(!secret.is_empty(), "invalid auth entry (empty secret): {t:?}");
        // htpasswd -B emits $2y$...; bcrypt verify wants $2b$.
        let normalized = secret.replace("$2y$", "$2b$");
        out.insert(user.to_string(), normalized);
    }
    anyhow::ensure!(!out.is_empty(), "no control channel users configured");
    Ok(out)
}

fn verify_secret(stored: &str, pass: &str) -> bool {
    if stored.starts_with("$2") {
        bcrypt::verify(pass, stored).unwrap_or(false)
    } else {
        // Cleartext credential entry.
        stored.as_bytes() == pass.as_bytes()
    }
}

fn check_basic_auth(
    users: &HashMap<String, String>,
    auth_cache: &Arc<Mutex<AuthCache>>,
    headers: &axum::http::HeaderMap,
) -> Result<(), String> {
    let Some(v) = headers.get(header::AUTHORIZATION) else {
        return Err("missing Authorization header".to_string());
    };
    let Ok(s) = v.to_str() else {
        return Err("invalid Authorization header".to_string());
    };
    let s = s.trim();
    let Some(b64) = s.strip_prefix("Basic ").or_else(|| s.strip_prefix("basic ")) else {
        return Err("expected Basic authorization".to_string());
    };
    let decoded = BASE64
        .decode(b64.trim().as_bytes())
        .map_err(|_| "invalid base64 in Authorization".to_string())?;
    let decoded = String::from_utf8(decoded).map_err(|_| "invalid utf8 in Authorization".to_string())?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| "invalid basic auth payload".to_string())?;
    let Some(stored) = users.get(user) else {
        return Err("invalid credentials".to_string());
    };

    let key = AuthCacheKey {
        user: user.to_string(),
        expected: stored.clone(),
        pass: pass.to_string(),
    };
    if let Ok(mut c) = auth_cache.lock() {
        if let Some(cached) = c.get(&key) {
            return if cached { Ok(()) } else { Err("invalid credentials".to_string()) };
        }
        let ok = verify_secret(stored, pass);
        c.put(key, ok);
        return ok.then_some(()).ok_or_else(|| "invalid credentials".to_string());
    }

    verify_secret(stored, pass)
        .then_some(())
        .ok_or_else(|| "invalid credentials".to_string())
}

async fn basic_auth_middleware(
    State(st): State<ChannelState>,
    req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> impl IntoResponse {
    let headers = req.headers();
    match check_basic_auth(&st.users, &st.auth_cache, headers) {
        Ok(()) => next.run(req).await,
        Err(msg) => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, r#"Basic realm="vigild""#)],
            msg,
        )
            .into_response(),
    }
}

fn html_body(title: &str, message: &str) -> String {
    // The CLI client scrapes the message between `</h2>` and `<p>` and reads
    // at most 1024 bytes of body.
    let mut msg = message.replace('<', "(").replace('>', ")");
    let overhead = 96 + title.len() * 2;
    let cap = BODY_CAP.saturating_sub(overhead);
    if msg.len() > cap {
        msg.truncate(cap);
    }
    format!("<html><head><title>{title}</title></head><body><h2>{title}</h2>{msg}<p></p></body></html>")
}

#[derive(Debug, Deserialize)]
struct ActionForm {
    action: String,
}

async fn post_action(
    State(st): State<ChannelState>,
    AxumPath(service): AxumPath<String>,
    Form(form): Form<ActionForm>,
) -> AxumResponse {
    let Some(action) = Action::parse(&form.action) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(html_body("Action failed", &format!("invalid action {:?}", form.action))),
        )
            .into_response();
    };

    let exists = {
        let s = st.ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        s.services.contains_key(&service)
    };
    if !exists {
        return (
            StatusCode::NOT_FOUND,
            Html(html_body(
                "Action failed",
                &format!("there is no service named {service:?}"),
            )),
        )
            .into_response();
    }

    vg_event(
        "channel",
        Some(&service),
        format!("action={} requested", action.as_str()),
    );
    match st.ctl.control(&service, action).await {
        Ok(()) => (
            StatusCode::OK,
            Html(html_body("OK", &format!("{} {service} done", action.as_str()))),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Html(html_body("Action failed", &format!("{e:#}"))),
        )
            .into_response(),
    }
}

async fn post_validate(State(st): State<ChannelState>) -> AxumResponse {
    let _ = st.wakeup.send(ControlMsg::Wakeup).await;
    (StatusCode::OK, Html(html_body("OK", "validate scheduled"))).into_response()
}

async fn get_status(State(st): State<ChannelState>) -> AxumResponse {
    let body = {
        let s = st.ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        render_status_text(&s.services, false)
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

async fn get_summary(State(st): State<ChannelState>) -> AxumResponse {
    let body = {
        let s = st.ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        render_status_text(&s.services, true)
    };
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn fmt_uptime_secs(secs: u64) -> String {
    let mut s = secs;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let sec = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{sec:02}s")
    } else {
        format!("{sec}s")
    }
}

/// Render the plain-text service table served to the CLI.
pub fn render_status_text(services: &std::collections::BTreeMap<String, Service>, summary: bool) -> String {
    fn pad(s: &str, width: usize) -> String {
        if s.len() >= width {
            return s.to_string();
        }
        let mut out = String::with_capacity(width);
        out.push_str(s);
        out.push_str(&" ".repeat(width - s.len()));
        out
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('+');
        for w in widths {
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[String], widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('|');
        for (i, w) in widths.iter().enumerate() {
            let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(&pad(v, *w));
            out.push(' ');
            out.push('|');
        }
        out
    }

    if services.is_empty() {
        return "(no services)\n".to_string();
    }

    let headers: Vec<&str> = if summary {
        vec!["service", "type", "monitor", "status"]
    } else {
        vec!["service", "type", "monitor", "status", "pid", "uptime", "cpu", "memory"]
    };

    let mut rows: Vec<Vec<String>> = Vec::new();
    for (name, s) in services {
        let monitor = match s.monitor {
            MonitorState::Not => "no",
            MonitorState::Init => "init",
            MonitorState::Yes => "yes",
        };
        let status = if s.monitor == MonitorState::Not {
            "not monitored".to_string()
        } else {
            s.info.message.clone().unwrap_or_else(|| "ok".to_string())
        };
        let mut cols = vec![
            name.clone(),
            s.kind.type_name().to_string(),
            monitor.to_string(),
            status,
        ];
        if !summary {
            cols.push(s.info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()));
            cols.push(
                s.info
                    .uptime_secs
                    .map(fmt_uptime_secs)
                    .unwrap_or_else(|| "-".to_string()),
            );
            cols.push(
                s.info
                    .cpu_percent
                    .map(|c| format!("{c:.1}%"))
                    .unwrap_or_else(|| "-".to_string()),
            );
            cols.push(
                s.info
                    .memory_kb
                    .map(|m| format!("{m} kB"))
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
        rows.push(cols);
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for r in &rows {
        for (i, c) in r.iter().enumerate() {
            widths[i] = widths[i].max(c.len());
        }
    }

    let mut out = String::new();
    let top = border(&widths);
    out.push_str(&top);
    out.push('\n');
    out.push_str(&row_line(
        &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        &widths,
    ));
    out.push('\n');
    out.push_str(&top);
    out.push('\n');
    for r in &rows {
        out.push_str(&row_line(r, &widths));
        out.push('\n');
    }
    out.push_str(&top);
    out.push('\n');
    out
}

fn build_router(state: ChannelState) -> Router {
    let auth_state = state.clone();
    Router::new()
        .route("/_status", get(get_status))
        .route("/_summary", get(get_summary))
        .route("/_validate", post(post_validate))
        .route("/{service}", post(post_action))
        .with_state(state)
        .layer(middleware::from_fn_with_state(auth_state, basic_auth_middleware))
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("failed to create socket directory {}: {e}", parent.display())
            })?;
        }
    }
    if sock.exists() {
        // If something is already listening, fail. Otherwise remove the
        // stale socket.
        match StdUnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "vigild daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                std::fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

/// Start the control channel if enabled. Runs as a tracked background task.
pub fn start_channel(ctl: Controller, wakeup: mpsc::Sender<ControlMsg>) -> anyhow::Result<()> {
    let (cfg, hostname, shutting_down) = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        (
            st.cfg.channel.clone(),
            st.hostname.clone(),
            Arc::clone(&st.shutting_down),
        )
    };
    if !cfg.enabled {
        return Ok(());
    }

    let users = parse_users(&cfg)?;
    let state = ChannelState {
        ctl,
        users: Arc::new(users),
        auth_cache: Arc::new(Mutex::new(AuthCache::new())),
        wakeup,
    };
    let app = build_router(state);

    if let Some(sock) = cfg.unix_socket.clone() {
        prepare_socket(&sock)?;
        let listener = {
            let std_listener = std::os::unix::net::UnixListener::bind(&sock)
                .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;
            std_listener.set_nonblocking(true)?;
            tokio::net::UnixListener::from_std(std_listener)?
        };
        vg_event("channel", None, format!("listening sock={}", sock.display()));
        tasks().spawn(async move {
            let shutdown = async move {
                while !shutting_down.load(Ordering::Relaxed) {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                vg_event("channel", None, format!("stopped err={e}"));
            }
            let _ = std::fs::remove_file(&sock);
        });
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", cfg.bind, cfg.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("control_channel bind/port invalid: {e}"))?;

    if let Some(opts) = cfg.tls.server_opts() {
        if ensure_server_pem(&opts.pemfile, &hostname)? {
            vg_event(
                "channel",
                None,
                format!("tls_autogen complete pemfile={}", opts.pemfile.display()),
            );
        }
        let server_config = build_server_config(&opts)?;
        let rustls_cfg = axum_server::tls_rustls::RustlsConfig::from_config(server_config);
        vg_event(
            "channel",
            None,
            format!("listening addr={addr} tls=true mtls={}", opts.client_ca.is_some()),
        );
        tasks().spawn(async move {
            if let Err(e) = axum_server::bind_rustls(addr, rustls_cfg)
                .serve(app.into_make_service())
                .await
            {
                vg_event("channel", None, format!("stopped err={e}"));
            }
        });
        return Ok(());
    }

    vg_event("channel", None, format!("listening addr={addr} tls=false"));
    tasks().spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                vg_event("channel", None, format!("bind failed addr={addr} err={e}"));
                return;
            }
        };
        let shutdown = async move {
            while !shutting_down.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            vg_event("channel", None, format!("stopped err={e}"));
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vg::service::parse_service_yaml;

    #[test]
    fn secret_verification_handles_both_formats() {
        assert!(verify_secret("swordfish", "swordfish"));
        assert!(!verify_secret("swordfish", "wrong"));
        let hash = bcrypt::hash("opensesame", 4).unwrap();
        assert!(verify_secret(&hash, "opensesame"));
        assert!(!verify_secret(&hash, "wrong"));
    }

    #[test]
    fn html_body_is_scrapeable_and_bounded() {
        let body = html_body("Action failed", "service \"x\" <broke>");
        assert!(body.len() <= BODY_CAP);
        let after = body.split("</h2>").nth(1).unwrap();
        let msg = after.split("<p>").next().unwrap();
        assert_eq!(msg, "service \"x\" (broke)");

        let long = "y".repeat(4096);
        let body = html_body("Action failed", &long);
        assert!(body.len() <= BODY_CAP, "len={}", body.len());
    }

    #[test]
    fn status_table_lists_services() {
        let mut services = std::collections::BTreeMap::new();
        let mut svc = parse_service_yaml(
            "service:\n  name: web\n  type: system\n",
            Path::new("t.yaml"),
        )
        .unwrap();
        svc.info.uptime_secs = Some(3700);
        services.insert("web".to_string(), svc);
        let text = render_status_text(&services, false);
        assert!(text.contains("| web"), "{text}");
        assert!(text.contains("1h01m"), "{text}");
        let summary = render_status_text(&services, true);
        assert!(summary.contains("service"), "{summary}");
        assert!(!summary.contains("uptime"), "{summary}");
    }
}
