//! Dependency-ordered lifecycle walks against real (tiny) child processes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vigild::vg::config::{ChannelAuthConfig, ChannelConfig, ChannelTlsConfig, MasterConfig};
use vigild::vg::control::{Action, Controller, DaemonState};
use vigild::vg::event::new_ring;
use vigild::vg::service::{parse_service_yaml, MonitorState, Service};

fn test_config(dir: &Path) -> MasterConfig {
    MasterConfig {
        polltime: 30,
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

fn service(yaml: &str) -> Service {
    parse_service_yaml(yaml, Path::new("test.yaml")).unwrap()
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

/// Services with trivially-succeeding lifecycle commands: C depends on B
/// depends on A.
fn chain(dir: &Path) -> Controller {
    let mk = |name: &str, deps: &str| {
        let lifecycle = concat!(
            "  start:\n    command: [\"/bin/true\"]\n    timeout: 5\n",
            "  stop:\n    command: [\"/bin/true\"]\n    timeout: 5\n"
        );
        service(&format!(
            "service:\n  name: {name}\n  type: system\n{deps}{lifecycle}"
        ))
    };
    controller(
        dir,
        vec![
            mk("a", ""),
            mk("b", "  depends: [a]\n"),
            mk("c", "  depends: [b]\n"),
        ],
    )
}

fn exec_sequence(ctl: &Controller, suffix: &str) -> Vec<String> {
    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    q.iter()
        .filter(|e| e.component == "exec" && e.message.ends_with(suffix))
        .filter_map(|e| e.service.clone())
        .collect()
}

fn clear_events(ctl: &Controller) {
    let st = ctl.state.lock().unwrap();
    st.events.lock().unwrap().clear();
}

fn monitor_of(ctl: &Controller, name: &str) -> MonitorState {
    let st = ctl.state.lock().unwrap();
    st.services[name].monitor
}

#[tokio::test]
async fn start_walks_prerequisites_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    ctl.control("c", Action::Start).await.unwrap();
    assert_eq!(exec_sequence(&ctl, " started"), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn stop_walks_dependants_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    ctl.control("a", Action::Stop).await.unwrap();
    assert_eq!(exec_sequence(&ctl, " stopped"), vec!["c", "b", "a"]);
    // Stop disables monitoring on the whole dependant chain.
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Not);
    }
}

#[tokio::test]
async fn no_service_is_started_twice_per_walk() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    ctl.control("c", Action::Start).await.unwrap();
    let seq = exec_sequence(&ctl, " started");
    for name in ["a", "b", "c"] {
        assert_eq!(seq.iter().filter(|s| s.as_str() == name).count(), 1, "{seq:?}");
    }
}

#[tokio::test]
async fn restart_without_restart_command_is_stop_then_start() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    clear_events(&ctl);
    ctl.control("b", Action::Restart).await.unwrap();

    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    let seq: Vec<(String, &str)> = q
        .iter()
        .filter(|e| e.component == "exec")
        .filter_map(|e| {
            let svc = e.service.clone()?;
            if e.message.ends_with(" stopped") {
                Some((svc, "stopped"))
            } else if e.message.ends_with(" started") {
                Some((svc, "started"))
            } else {
                None
            }
        })
        .collect();
    // Dependants of b stop first, then b stops, then the start side runs
    // prerequisites before b and its dependants.
    assert_eq!(
        seq,
        vec![
            ("c".to_string(), "stopped"),
            ("b".to_string(), "stopped"),
            ("a".to_string(), "started"),
            ("b".to_string(), "started"),
            ("c".to_string(), "started"),
        ]
    );
}

#[tokio::test]
async fn restart_skips_stop_for_a_process_that_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(concat!(
        "service:\n  name: flaky\n  type: process\n  pidfile: /nonexistent/flaky.pid\n",
        "  start:\n    command: [\"/bin/true\"]\n    timeout: 1\n",
        "  stop:\n    command: [\"/bin/false\"]\n    timeout: 1\n"
    ));
    let ctl = controller(dir.path(), vec![svc]);
    // The process is not running (no pidfile), so stop is skipped and the
    // restart proceeds to start.
    ctl.control("flaky", Action::Restart).await.unwrap();
    assert_ne!(monitor_of(&ctl, "flaky"), MonitorState::Not);
}

#[tokio::test]
async fn monitor_is_idempotent_and_covers_prerequisites() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    ctl.control("a", Action::Stop).await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Not);
    }

    ctl.control("c", Action::Monitor).await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Init, "{name}");
    }
    // Second call is a no-op.
    ctl.control("c", Action::Monitor).await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Init, "{name}");
    }
}

#[tokio::test]
async fn unmonitor_is_idempotent_and_covers_dependants() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    ctl.control("a", Action::Unmonitor).await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Not, "{name}");
    }
    ctl.control("a", Action::Unmonitor).await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(monitor_of(&ctl, name), MonitorState::Not, "{name}");
    }
    // Monitoring b alone re-enables its prerequisite a but not dependant c.
    ctl.control("b", Action::Monitor).await.unwrap();
    assert_eq!(monitor_of(&ctl, "a"), MonitorState::Init);
    assert_eq!(monitor_of(&ctl, "b"), MonitorState::Init);
    assert_eq!(monitor_of(&ctl, "c"), MonitorState::Not);
}

#[tokio::test]
async fn command_timeout_kills_the_child_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(concat!(
        "service:\n  name: slow\n  type: system\n",
        "  start:\n    command: [\"/bin/sleep\", \"10\"]\n    timeout: 1\n"
    ));
    let ctl = controller(dir.path(), vec![svc]);

    let begin = Instant::now();
    ctl.control("slow", Action::Start).await.unwrap();
    let elapsed = begin.elapsed();
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    let failed: Vec<_> = q
        .iter()
        .filter(|e| e.component == "exec" && e.message.contains("state=failed"))
        .collect();
    assert_eq!(failed.len(), 1, "{q:?}");
    assert!(failed[0].message.contains("timed out"), "{}", failed[0].message);
}

#[tokio::test]
async fn missing_program_posts_exec_failed() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(concat!(
        "service:\n  name: ghost\n  type: system\n",
        "  start:\n    command: [\"/no/such/binary\"]\n    timeout: 2\n"
    ));
    let ctl = controller(dir.path(), vec![svc]);
    ctl.control("ghost", Action::Start).await.unwrap();

    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    let failed: Vec<_> = q
        .iter()
        .filter(|e| e.component == "exec" && e.message.contains("state=failed"))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(
        failed[0].message.contains("Program /no/such/binary failed"),
        "{}",
        failed[0].message
    );
}

#[tokio::test]
async fn unknown_service_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = chain(dir.path());
    let err = ctl.control("ghost", Action::Start).await.unwrap_err();
    assert!(err.to_string().contains("does not exist"), "{err}");
}

#[tokio::test]
async fn command_output_is_captured_in_the_failure_message() {
    let dir = tempfile::tempdir().unwrap();
    let svc = service(concat!(
        "service:\n  name: noisy\n  type: process\n  pidfile: /nonexistent/noisy.pid\n",
        "  start:\n    command: [\"/bin/sh\", \"-c\", \"echo boom >&2; exit 3\"]\n    timeout: 2\n"
    ));
    let ctl = controller(dir.path(), vec![svc]);
    ctl.control("noisy", Action::Start).await.unwrap();

    let st = ctl.state.lock().unwrap();
    let q = st.events.lock().unwrap();
    // The process never appears (no pidfile), so the start fails; the
    // message carries the captured stderr.
    let failed: Vec<_> = q
        .iter()
        .filter(|e| e.component == "exec" && e.message.contains("state=failed"))
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].message.contains("boom"), "{}", failed[0].message);
}
