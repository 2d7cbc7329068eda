//! End-to-end control channel: authenticated action POSTs and status fetch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use vigild::vg::channel::start_channel;
use vigild::vg::config::{ChannelAuthConfig, ChannelConfig, ChannelTlsConfig, MasterConfig};
use vigild::vg::control::{Controller, DaemonState};
use vigild::vg::event::{init_tasks, new_ring};
use vigild::vg::rpc::ClientTarget;
use vigild::vg::service::parse_service_yaml;
use vigild::vg::validator::ControlMsg;

fn free_port() -> u16 {
    let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    l.local_addr().unwrap().port()
}

fn channel_config(dir: &Path, port: u16) -> MasterConfig {
    MasterConfig {
        polltime: 30,
        hostname: Some("testhost".to_string()),
        config_directory: dir.join("config.d"),
        statefile: dir.join("vigild.state"),
        pidfile: dir.join("vigild.pid"),
        logfile: None,
        debug: 0,
        channel: ChannelConfig {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port,
            unix_socket: None,
            tls: ChannelTlsConfig::default(),
            auth: ChannelAuthConfig {
                users: vec!["admin:secret".to_string()],
                credential: None,
            },
        },
    }
}

async fn start_test_daemon(dir: &Path) -> (MasterConfig, Controller, mpsc::Receiver<ControlMsg>) {
    init_tasks();
    let cfg = channel_config(dir, free_port());

    let svc = parse_service_yaml(
        concat!(
            "service:\n  name: web\n  type: system\n",
            "  start:\n    command: [\"/bin/true\"]\n    timeout: 5\n",
            "  stop:\n    command: [\"/bin/true\"]\n    timeout: 5\n"
        ),
        Path::new("web.yaml"),
    )
    .unwrap();
    let mut services = BTreeMap::new();
    services.insert("web".to_string(), svc);

    let state = Arc::new(Mutex::new(DaemonState {
        cfg: cfg.clone(),
        hostname: "testhost".to_string(),
        services,
        events: new_ring(),
        shutting_down: Arc::new(AtomicBool::new(false)),
    }));
    let ctl = Controller::new(state);

    let (tx, rx) = mpsc::channel(4);
    start_channel(ctl.clone(), tx).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    (cfg, ctl, rx)
}

#[tokio::test]
async fn authenticated_action_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, ctl, _rx) = start_test_daemon(dir.path()).await;

    let client = ClientTarget::from_config(&cfg).unwrap();
    client.call_action("web", "start").await.unwrap();

    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    assert!(
        q.iter()
            .any(|e| e.component == "exec" && e.message.ends_with(" started")),
        "{q:?}"
    );
}

#[tokio::test]
async fn unknown_service_yields_a_scraped_error_message() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, _ctl, _rx) = start_test_daemon(dir.path()).await;

    let client = ClientTarget::from_config(&cfg).unwrap();
    let err = client.call_action("ghost", "start").await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("Action failed --"), "{msg}");
    assert!(msg.contains("there is no service named"), "{msg}");
}

#[tokio::test]
async fn invalid_action_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, _ctl, _rx) = start_test_daemon(dir.path()).await;

    let client = ClientTarget::from_config(&cfg).unwrap();
    let err = client.call_action("web", "explode").await.unwrap_err();
    assert!(err.to_string().contains("Action failed"), "{err}");
}

#[tokio::test]
async fn wrong_credential_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (mut cfg, _ctl, _rx) = start_test_daemon(dir.path()).await;

    cfg.channel.auth.credential = Some("admin:wrong".to_string());
    cfg.channel.auth.users.clear();
    let client = ClientTarget::from_config(&cfg).unwrap();
    let err = client.call_action("web", "start").await.unwrap_err();
    assert!(err.to_string().contains("Action failed"), "{err}");
}

#[tokio::test]
async fn status_and_summary_tables_are_served() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, _ctl, _rx) = start_test_daemon(dir.path()).await;

    let client = ClientTarget::from_config(&cfg).unwrap();
    let status = client.fetch_text("/_status").await.unwrap();
    assert!(status.contains("web"), "{status}");
    assert!(status.contains("uptime"), "{status}");

    let summary = client.fetch_text("/_summary").await.unwrap();
    assert!(summary.contains("web"), "{summary}");
    assert!(!summary.contains("uptime"), "{summary}");
}

#[tokio::test]
async fn validate_request_wakes_the_validator() {
    let dir = tempfile::tempdir().unwrap();
    let (cfg, _ctl, mut rx) = start_test_daemon(dir.path()).await;

    let client = ClientTarget::from_config(&cfg).unwrap();
    client.post_path("/_validate").await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap();
    assert_eq!(msg, Some(ControlMsg::Wakeup));
}
