//! Validator cycles: rule counting, trigger points, recovery and the
//! built-in process liveness check.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use vigild::vg::config::{ChannelAuthConfig, ChannelConfig, ChannelTlsConfig, MasterConfig};
use vigild::vg::control::{Controller, DaemonState};
use vigild::vg::event::new_ring;
use vigild::vg::service::{parse_service_yaml, MonitorState, Service};
use vigild::vg::validator::run_cycle;

fn test_config(dir: &Path) -> MasterConfig {
    MasterConfig {
        polltime: 1,
        hostname: Some("testhost".to_string()),
        config_directory: dir.join("config.d"),
        statefile: dir.join("vigild.state"),
        pidfile: dir.join("vigild.pid"),
        logfile: None,
        debug: 0,
        channel: ChannelConfig {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 2812,
            unix_socket: None,
            tls: ChannelTlsConfig::default(),
            auth: ChannelAuthConfig::default(),
        },
    }
}

fn controller(dir: &Path, services: Vec<Service>) -> Controller {
    let mut map = BTreeMap::new();
    for s in services {
        map.insert(s.name.clone(), s);
    }
    let state = Arc::new(Mutex::new(DaemonState {
        cfg: test_config(dir),
        hostname: "testhost".to_string(),
        services: map,
        events: new_ring(),
        shutting_down: Arc::new(AtomicBool::new(false)),
    }));
    Controller::new(state)
}

fn events_matching(ctl: &Controller, component: &str, needle: &str) -> usize {
    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    q.iter()
        .filter(|e| e.component == component && e.message.contains(needle))
        .count()
}

#[tokio::test]
async fn checksum_change_fires_once_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let watched = dir.path().join("watched.conf");
    std::fs::write(&watched, b"v1").unwrap();

    let svc = parse_service_yaml(
        &format!(
            "service:\n  name: conf\n  type: file\n  path: {}\n  checks:\n    - check: checksum\n      algo: sha1\n      action: alert\n",
            watched.display()
        ),
        Path::new("conf.yaml"),
    )
    .unwrap();
    let ctl = controller(dir.path(), vec![svc]);

    // First cycle records the baseline; no event.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "checksum", "changed"), 0);
    {
        let st = ctl.state.lock().unwrap();
        assert_eq!(st.services["conf"].monitor, MonitorState::Yes);
        assert!(st.services["conf"].info.checksum.is_some());
    }

    // Content change: the rule fires.
    std::fs::write(&watched, b"v2").unwrap();
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "checksum", "checksum changed"), 1);

    // Stable again: a recovery event, and the trigger re-arms.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "checksum", "recovered"), 1);
    std::fs::write(&watched, b"v3").unwrap();
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "checksum", "checksum changed"), 2);
}

#[tokio::test]
async fn connection_rule_counts_cycles_before_firing() {
    let dir = tempfile::tempdir().unwrap();
    // Reserve a port with no listener behind it.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let svc = parse_service_yaml(
        &format!(
            "service:\n  name: api\n  type: remotehost\n  host: 127.0.0.1\n  checks:\n    - check: connection\n      port: {port}\n      timeout_ms: 500\n      cycles: 2\n      action: alert\n"
        ),
        Path::new("api.yaml"),
    )
    .unwrap();
    let ctl = controller(dir.path(), vec![svc]);

    // First failed cycle stays below the trigger.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "connection", "state=failed"), 0);
    {
        let st = ctl.state.lock().unwrap();
        assert_eq!(st.services["api"].rule_states[0].fails, 1);
        assert!(st.services["api"].info.message.is_some());
    }

    // Second failed cycle fires exactly once.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "connection", "state=failed"), 1);

    // Still failing: no duplicate event.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "connection", "state=failed"), 1);

    // A listener appears: the check recovers and counters reset.
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((_s, _)) = listener.accept().await else { break };
        }
    });
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "connection", "state=succeeded"), 1);
    {
        let st = ctl.state.lock().unwrap();
        assert_eq!(st.services["api"].rule_states[0].fails, 0);
        assert!(st.services["api"].info.message.is_none());
    }
}

#[tokio::test]
async fn dead_process_is_started_by_the_liveness_check() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("svc.pid");

    let svc = parse_service_yaml(
        &format!(
            "service:\n  name: workd\n  type: process\n  pidfile: {}\n  start:\n    command: [\"/bin/true\"]\n    timeout: 1\n",
            pidfile.display()
        ),
        Path::new("workd.yaml"),
    )
    .unwrap();
    let ctl = controller(dir.path(), vec![svc]);

    // Init state: the first cycle observes but does not act.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "existence", "not running"), 0);

    // Now fully monitored: the dead process triggers a start attempt.
    run_cycle(&ctl).await;
    assert_eq!(events_matching(&ctl, "existence", "not running"), 1);
    assert!(events_matching(&ctl, "exec", "") >= 1);
}

#[tokio::test]
async fn uptime_rule_uses_observed_facts() {
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("me.pid");
    // Watch this test process itself.
    std::fs::write(&pidfile, format!("{}\n", std::process::id())).unwrap();

    let svc = parse_service_yaml(
        &format!(
            "service:\n  name: me\n  type: process\n  pidfile: {}\n  checks:\n    - check: uptime\n      op: less\n      seconds: 86400\n      action: alert\n",
            pidfile.display()
        ),
        Path::new("me.yaml"),
    )
    .unwrap();
    let ctl = controller(dir.path(), vec![svc]);

    run_cycle(&ctl).await;
    // A fresh test process has been up well under a day, so the rule fires.
    assert_eq!(events_matching(&ctl, "uptime", "state=failed"), 1);
    let st = ctl.state.lock().unwrap();
    let info = &st.services["me"].info;
    assert_eq!(info.pid, Some(std::process::id() as i32));
    assert!(info.memory_kb.unwrap_or(0) > 0);
}
