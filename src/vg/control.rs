use async_recursion::async_recursion;
use chrono::Local;
use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt as _;
use tokio::time::sleep;

use crate::vg::config::MasterConfig;
use crate::vg::event::{post_service_event, vg_event, EventKind, EventRing, EventState};
use crate::vg::facts;
use crate::vg::service::{Command, MonitorState, Service, ServiceKind};

const POLL_INTERVAL_MS: u64 = 100;
const MSG_CAP: usize = 512;
const DEBUG_DRAIN_CAP: usize = 2048;

/// Shared daemon state: configuration, the service graph and the event ring.
/// The mutex is held only for brief reads/writes, never across awaits.
#[derive(Debug)]
pub struct DaemonState {
    pub cfg: MasterConfig,
    pub hostname: String,
    pub services: BTreeMap<String, Service>,
    pub events: EventRing,
    pub shutting_down: Arc<AtomicBool>,
}

pub type SharedState = Arc<Mutex<DaemonState>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Monitor,
    Unmonitor,
}

impl Action {
    pub fn parse(s: &str) -> Option<Action> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Action::Start),
            "stop" => Some(Action::Stop),
            "restart" => Some(Action::Restart),
            "monitor" => Some(Action::Monitor),
            "unmonitor" => Some(Action::Unmonitor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Monitor => "monitor",
            Action::Unmonitor => "unmonitor",
        }
    }
}

/// Per-walk traversal marks. A fresh set per top-level `control` call keeps
/// the graph itself free of shared mutable flags, and guarantees the marks
/// are empty between any two operations.
#[derive(Debug, Default)]
struct Walk {
    visited: HashSet<String>,
    depend_visited: HashSet<String>,
}

#[derive(Debug, Clone)]
struct SvcSnapshot {
    name: String,
    kind: ServiceKind,
    start: Option<Command>,
    stop: Option<Command>,
    restart: Option<Command>,
    depends: Vec<String>,
    pid: Option<i32>,
    memory_kb: Option<u64>,
    children: Option<u32>,
    cpu_percent: Option<f64>,
}

impl SvcSnapshot {
    fn is_process(&self) -> bool {
        matches!(self.kind, ServiceKind::Process { .. })
    }

    fn running_pid(&self) -> Option<i32> {
        if let ServiceKind::Process { pidfile } = &self.kind {
            if let Ok(Some(pid)) = facts::read_pidfile(pidfile) {
                if facts::process_exists(pid) {
                    return Some(pid);
                }
            }
        }
        None
    }
}

#[derive(Debug)]
struct ExecOutcome {
    status: Option<i32>,
    message: String,
    remaining_ms: i64,
}

/// Dependency-aware action dispatcher. A global lock serializes top-level
/// walks; the validator and the control channel both dispatch through here.
#[derive(Clone)]
pub struct Controller {
    pub state: SharedState,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Controller {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Run a lifecycle action against a service and its dependency graph.
    pub async fn control(&self, name: &str, action: Action) -> anyhow::Result<()> {
        {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            anyhow::ensure!(st.services.contains_key(name), "service {name:?} does not exist");
        }

        let _guard = self.lock.lock().await;
        let mut walk = Walk::default();
        match action {
            Action::Start => {
                self.do_depend(&mut walk, name, Action::Stop, false).await;
                self.do_start(&mut walk, name).await;
                self.do_depend(&mut walk, name, Action::Start, false).await;
            }
            Action::Stop => {
                self.do_depend(&mut walk, name, Action::Stop, true).await;
                self.do_stop(&mut walk, name, true).await;
            }
            Action::Restart => {
                vg_event("control", Some(name), "trying to restart");
                self.do_depend(&mut walk, name, Action::Stop, false).await;
                let has_restart = {
                    let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
                    st.services.get(name).and_then(|s| s.restart.clone()).is_some()
                };
                if has_restart {
                    self.do_restart(name).await;
                    self.do_depend(&mut walk, name, Action::Start, false).await;
                } else if self.do_stop(&mut walk, name, false).await {
                    // Only start again if the stop actually succeeded.
                    self.do_start(&mut walk, name).await;
                    self.do_depend(&mut walk, name, Action::Start, false).await;
                } else {
                    // Re-arm monitoring so a later cycle can retry the restart.
                    self.monitor_set(name);
                }
            }
            Action::Monitor => {
                // Enable monitoring for the service and its prerequisites;
                // dependants keep their state.
                self.do_monitor(&mut walk, name).await;
            }
            Action::Unmonitor => {
                // Disable monitoring for the service and everything that
                // depends on it.
                self.do_depend(&mut walk, name, Action::Unmonitor, false).await;
                self.do_unmonitor(&mut walk, name);
            }
        }
        Ok(())
    }

    fn snapshot(&self, name: &str) -> Option<SvcSnapshot> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.services.get(name).map(|s| SvcSnapshot {
            name: s.name.clone(),
            kind: s.kind.clone(),
            start: s.start.clone(),
            stop: s.stop.clone(),
            restart: s.restart.clone(),
            depends: s.depends.clone(),
            pid: s.info.pid,
            memory_kb: s.info.memory_kb,
            children: s.info.children,
            cpu_percent: s.info.cpu_percent,
        })
    }

    fn events(&self) -> EventRing {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&st.events)
    }

    fn stopping(&self) -> Arc<AtomicBool> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&st.shutting_down)
    }

    fn hostname(&self) -> String {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.hostname.clone()
    }

    fn debug(&self) -> bool {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.cfg.debug > 0
    }

    fn monitor_set(&self, name: &str) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = st.services.get_mut(name) {
            if s.monitor == MonitorState::Not {
                s.monitor = MonitorState::Init;
                vg_event("control", Some(name), "monitoring enabled");
            }
        }
    }

    fn monitor_unset(&self, name: &str) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = st.services.get_mut(name) {
            if s.monitor != MonitorState::Not {
                s.monitor = MonitorState::Not;
                vg_event("control", Some(name), "monitoring disabled");
            }
            for rs in &mut s.rule_states {
                rs.fails = 0;
                rs.fired = false;
            }
        }
    }

    fn reset_info(&self, name: &str) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = st.services.get_mut(name) {
            s.info.reset();
        }
    }

    fn set_pid(&self, name: &str, pid: Option<i32>) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(s) = st.services.get_mut(name) {
            s.info.pid = pid;
        }
    }

    /// Post-fix: start everything the service depends on, then the service.
    #[async_recursion]
    async fn do_start(&self, walk: &mut Walk, name: &str) {
        if !walk.visited.insert(name.to_string()) {
            return;
        }
        let Some(snap) = self.snapshot(name) else { return };
        for dep in &snap.depends {
            self.do_start(walk, dep).await;
        }

        if let Some(start) = &snap.start {
            let running = snap.running_pid();
            if !snap.is_process() || running.is_none() {
                vg_event("control", Some(name), format!("start: {}", start.program()));
                let mut outcome = self.command_execute(&snap, start, "Started").await;
                let started = if snap.is_process() {
                    self.wait_start(&snap, &mut outcome.remaining_ms).await
                } else {
                    true
                };
                let events = self.events();
                if !started || outcome.status.is_none() {
                    post_service_event(
                        &events,
                        name,
                        EventKind::Exec,
                        EventState::Failed,
                        "alert",
                        format!(
                            "failed to start (exit status {}) -- {}",
                            outcome.status.unwrap_or(-1),
                            if outcome.message.is_empty() { "no output" } else { &outcome.message }
                        ),
                    );
                } else {
                    post_service_event(
                        &events,
                        name,
                        EventKind::Exec,
                        EventState::Succeeded,
                        "alert",
                        "started",
                    );
                }
            }
        } else {
            vg_event("control", Some(name), "start skipped -- method not defined");
        }
        self.monitor_set(name);
    }

    /// Stop one service. `disable` also switches monitoring off; a stop that
    /// is part of a restart only clears transient facts.
    async fn do_stop(&self, walk: &mut Walk, name: &str, disable: bool) -> bool {
        if !walk.depend_visited.insert(name.to_string()) {
            return true;
        }
        let Some(snap) = self.snapshot(name) else { return true };
        let mut rv = true;

        if let Some(stop) = &snap.stop {
            let running = snap.running_pid();
            if !snap.is_process() || running.is_some() {
                vg_event("control", Some(name), format!("stop: {}", stop.program()));
                let pid = running.unwrap_or(0);
                let mut outcome = self.command_execute(&snap, stop, "Stopped").await;
                let stopped = if snap.is_process() {
                    self.wait_stop(pid, &mut outcome.remaining_ms).await
                } else {
                    true
                };
                let events = self.events();
                if !stopped || outcome.status.is_none() {
                    rv = false;
                    post_service_event(
                        &events,
                        name,
                        EventKind::Exec,
                        EventState::Failed,
                        "alert",
                        format!(
                            "failed to stop (exit status {}) -- {}",
                            outcome.status.unwrap_or(-1),
                            if outcome.message.is_empty() { "no output" } else { &outcome.message }
                        ),
                    );
                } else {
                    self.set_pid(name, None);
                    post_service_event(
                        &events,
                        name,
                        EventKind::Exec,
                        EventState::Succeeded,
                        "alert",
                        "stopped",
                    );
                }
            }
        } else {
            vg_event("control", Some(name), "stop skipped -- method not defined");
        }

        if disable {
            self.monitor_unset(name);
        } else {
            self.reset_info(name);
        }
        rv
    }

    async fn do_restart(&self, name: &str) {
        let Some(snap) = self.snapshot(name) else { return };
        if let Some(restart) = &snap.restart {
            vg_event("control", Some(name), format!("restart: {}", restart.program()));
            self.reset_info(name);
            let mut outcome = self.command_execute(&snap, restart, "Restarted").await;
            let started = if snap.is_process() {
                self.wait_start(&snap, &mut outcome.remaining_ms).await
            } else {
                true
            };
            let events = self.events();
            if !started || outcome.status.is_none() {
                post_service_event(
                    &events,
                    name,
                    EventKind::Exec,
                    EventState::Failed,
                    "alert",
                    format!(
                        "failed to restart (exit status {}) -- {}",
                        outcome.status.unwrap_or(-1),
                        if outcome.message.is_empty() { "no output" } else { &outcome.message }
                    ),
                );
            } else {
                post_service_event(
                    &events,
                    name,
                    EventKind::Exec,
                    EventState::Succeeded,
                    "alert",
                    "restarted",
                );
            }
        } else {
            vg_event("control", Some(name), "restart skipped -- method not defined");
        }
        self.monitor_set(name);
    }

    /// Post-fix: enable monitoring for prerequisites, then the service.
    #[async_recursion]
    async fn do_monitor(&self, walk: &mut Walk, name: &str) {
        if !walk.visited.insert(name.to_string()) {
            return;
        }
        let Some(snap) = self.snapshot(name) else { return };
        for dep in &snap.depends {
            self.do_monitor(walk, dep).await;
        }
        self.monitor_set(name);
    }

    fn do_unmonitor(&self, walk: &mut Walk, name: &str) {
        if !walk.depend_visited.insert(name.to_string()) {
            return;
        }
        self.monitor_unset(name);
    }

    /// In-fix walk over the services that depend on `name`: starts and
    /// monitor-enables happen on the way down, stops and unmonitors on the
    /// way back up.
    #[async_recursion]
    async fn do_depend(&self, walk: &mut Walk, name: &str, action: Action, disable: bool) {
        let children: Vec<String> = {
            let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            st.services
                .values()
                .filter(|s| s.depends.iter().any(|d| d == name))
                .map(|s| s.name.clone())
                .collect()
        };
        for child in children {
            match action {
                Action::Start => self.do_start(walk, &child).await,
                Action::Monitor => self.do_monitor(walk, &child).await,
                _ => {}
            }
            self.do_depend(walk, &child, action, disable).await;
            match action {
                Action::Stop => {
                    self.do_stop(walk, &child, disable).await;
                }
                Action::Unmonitor => self.do_unmonitor(walk, &child),
                _ => {}
            }
        }
    }

    /// Spawn the command with the configured identity and environment, poll
    /// its exit status every 100 ms within the timeout, and capture its
    /// output (stderr preferred) as the reportable message.
    async fn command_execute(&self, snap: &SvcSnapshot, cmd: &Command, verb: &str) -> ExecOutcome {
        let debug = self.debug();
        let stopping = self.stopping();
        let program = cmd.program().to_string();

        let mut c = tokio::process::Command::new(&program);
        if cmd.command.len() > 1 {
            c.args(&cmd.command[1..]);
        }
        c.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        c.kill_on_drop(true);

        c.env("MONIT_DATE", Local::now().to_rfc2822());
        c.env("MONIT_SERVICE", &snap.name);
        c.env("MONIT_HOST", self.hostname());
        c.env("MONIT_EVENT", verb);
        c.env("MONIT_DESCRIPTION", verb);
        if snap.is_process() {
            c.env("MONIT_PROCESS_PID", snap.running_pid().or(snap.pid).unwrap_or(0).to_string());
            c.env("MONIT_PROCESS_MEMORY", snap.memory_kb.unwrap_or(0).to_string());
            c.env("MONIT_PROCESS_CHILDREN", snap.children.unwrap_or(0).to_string());
            c.env(
                "MONIT_PROCESS_CPU_PERCENT",
                format!("{:.0}", snap.cpu_percent.unwrap_or(0.0)),
            );
        }

        if let Err(e) = apply_run_as(&mut c, cmd) {
            return ExecOutcome {
                status: None,
                message: format!("Program {program} failed: {e}"),
                remaining_ms: cmd.timeout as i64 * 1000,
            };
        }

        let mut child = match c.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecOutcome {
                    status: None,
                    message: format!("Program {program} failed: {e}"),
                    remaining_ms: cmd.timeout as i64 * 1000,
                };
            }
        };

        // Drain stderr (preferred) and stdout into bounded buffers.
        let err_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let out_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let cap = if debug { DEBUG_DRAIN_CAP } else { MSG_CAP };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_into(stderr, Arc::clone(&err_buf), cap));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_into(stdout, Arc::clone(&out_buf), cap));
        }

        let mut remaining_ms = cmd.timeout as i64 * 1000;
        let mut status: Option<i32> = None;
        loop {
            match child.try_wait() {
                Ok(Some(st)) => {
                    status = st.code();
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    vg_event("control", Some(&snap.name), format!("wait error program={program} err={e}"));
                    break;
                }
            }
            if remaining_ms <= 0 || stopping.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            remaining_ms -= POLL_INTERVAL_MS as i64;
        }

        let timed_out = remaining_ms <= 0 && status.is_none();
        if timed_out {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_millis(1000), child.wait()).await;
        }

        // Give the pipe drains a beat to observe the tail of the output.
        sleep(Duration::from_millis(10)).await;
        let captured = {
            let e = err_buf.lock().unwrap_or_else(|p| p.into_inner());
            if e.is_empty() {
                let o = out_buf.lock().unwrap_or_else(|p| p.into_inner());
                o.clone()
            } else {
                e.clone()
            }
        };

        let mut message = String::new();
        if timed_out {
            message = format!("Program {program} timed out");
        }
        if !captured.is_empty() {
            let text = String::from_utf8_lossy(&captured[..captured.len().min(MSG_CAP)])
                .trim_end()
                .to_string();
            if debug {
                vg_event("control", Some(&snap.name), format!("output: {text}"));
            }
            message = if timed_out {
                format!("{program}: Program timed out -- {text}")
            } else {
                format!("{program}: {text}")
            };
        }

        ExecOutcome {
            status,
            message,
            remaining_ms,
        }
    }

    /// After a start command exits, watch for the process to come up. The
    /// poll interval doubles from 50 ms up to 1 s; liveness probing can be
    /// heavy and should not spin at full rate for slow starters.
    async fn wait_start(&self, snap: &SvcSnapshot, remaining_ms: &mut i64) -> bool {
        let stopping = self.stopping();
        let mut wait_ms: i64 = 50;
        loop {
            if let Some(pid) = snap.running_pid() {
                self.set_pid(&snap.name, Some(pid));
                return true;
            }
            if *remaining_ms <= 0 || stopping.load(Ordering::Relaxed) {
                return false;
            }
            sleep(Duration::from_millis(wait_ms as u64)).await;
            *remaining_ms -= wait_ms;
            wait_ms = (wait_ms * 2).min(1000);
        }
    }

    /// After a stop command exits, watch for the old pid to disappear.
    async fn wait_stop(&self, pid: i32, remaining_ms: &mut i64) -> bool {
        let stopping = self.stopping();
        loop {
            if facts::process_stopped(pid) {
                return true;
            }
            if *remaining_ms <= 0 || stopping.load(Ordering::Relaxed) {
                return false;
            }
            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            *remaining_ms -= POLL_INTERVAL_MS as i64;
        }
    }

    /// Run a rule's `exec` action command, fire-and-observe.
    pub async fn run_exec_action(&self, name: &str, argv: &[String]) {
        let Some(snap) = self.snapshot(name) else { return };
        let cmd = Command {
            command: argv.to_vec(),
            user: None,
            group: None,
            timeout: 30,
        };
        let outcome = self.command_execute(&snap, &cmd, "Exec").await;
        let events = self.events();
        match outcome.status {
            Some(0) => post_service_event(
                &events,
                name,
                EventKind::Exec,
                EventState::Succeeded,
                "exec",
                format!("executed {}", cmd.program()),
            ),
            st => post_service_event(
                &events,
                name,
                EventKind::Exec,
                EventState::Failed,
                "exec",
                format!(
                    "exec {} failed (exit status {}) -- {}",
                    cmd.program(),
                    st.unwrap_or(-1),
                    if outcome.message.is_empty() { "no output" } else { &outcome.message }
                ),
            ),
        }
    }
}

/// Resolve the run-as identity in the parent and drop gid before uid in the
/// child, right before exec.
fn apply_run_as(c: &mut tokio::process::Command, cmd: &Command) -> anyhow::Result<()> {
    let gid = match cmd.group.as_deref() {
        Some(gname) => Some(
            users::get_group_by_name(gname)
                .ok_or_else(|| anyhow::anyhow!("group not found: {gname}"))?
                .gid(),
        ),
        None => None,
    };
    let uid = match cmd.user.as_deref() {
        Some(uname) => Some(
            users::get_user_by_name(uname)
                .ok_or_else(|| anyhow::anyhow!("user not found: {uname}"))?
                .uid(),
        ),
        None => None,
    };
    if gid.is_none() && uid.is_none() {
        return Ok(());
    }
    unsafe {
        c.pre_exec(move || {
            if let Some(g) = gid {
                nix::unistd::setgid(nix::unistd::Gid::from_raw(g)).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("setgid failed: {e}"))
                })?;
            }
            if let Some(u) = uid {
                nix::unistd::setuid(nix::unistd::Uid::from_raw(u)).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, format!("setuid failed: {e}"))
                })?;
            }
            Ok(())
        });
    }
    Ok(())
}

async fn drain_into(mut src: impl tokio::io::AsyncRead + Unpin, buf: Arc<Mutex<Vec<u8>>>, cap: usize) {
    let mut chunk = [0u8; 1024];
    loop {
        match src.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut b = buf.lock().unwrap_or_else(|p| p.into_inner());
                let room = cap.saturating_sub(b.len());
                b.extend_from_slice(&chunk[..n.min(room)]);
                if room == 0 {
                    break;
                }
            }
        }
    }
}
