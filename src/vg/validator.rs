use chrono::Local;
use regex::Regex;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::vg::control::{Action, Controller};
use crate::vg::event::{post_service_event, vg_event, EventKind, EventState};
use crate::vg::facts;
use crate::vg::probe::Protocol;
use crate::vg::service::{
    ConnectionSpec, MonitorState, ResourceKind, RuleAction, RuleCheck, ServiceKind,
};
use crate::vg::state::save_state;
use crate::vg::transport::Transport;

/// Messages from the signal listener and the control channel to the
/// validator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// SIGTERM / SIGINT: drain and exit.
    Stop,
    /// SIGHUP: drain the cycle, save state, reload configuration.
    Reload,
    /// SIGUSR1 or an explicit validate request: run the next cycle now.
    Wakeup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    Reload,
}

/// The periodic evaluation loop. Returns when asked to stop or reload.
pub async fn run_validator(ctl: Controller, rx: &mut mpsc::Receiver<ControlMsg>) -> LoopExit {
    loop {
        run_cycle(&ctl).await;

        let (polltime, statefile, stopping) = {
            let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            (
                st.cfg.polltime,
                st.cfg.statefile.clone(),
                st.shutting_down.load(Ordering::Relaxed),
            )
        };

        flush_state(&ctl, &statefile);
        if stopping {
            return LoopExit::Shutdown;
        }

        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ControlMsg::Stop) | None => return LoopExit::Shutdown,
                Some(ControlMsg::Reload) => return LoopExit::Reload,
                Some(ControlMsg::Wakeup) => {}
            },
            _ = sleep(Duration::from_secs(polltime)) => {}
        }
    }
}

fn flush_state(ctl: &Controller, statefile: &PathBuf) {
    let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
    if let Err(e) = save_state(statefile, &st.services) {
        vg_event("state", None, format!("flush_failed path={} err={e}", statefile.display()));
    }
}

/// One validation cycle over every monitored service.
pub async fn run_cycle(ctl: &Controller) {
    let names: Vec<String> = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        st.services
            .values()
            .filter(|s| s.monitor.active())
            .map(|s| s.name.clone())
            .collect()
    };

    for name in names {
        let stopping = {
            let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            st.shutting_down.load(Ordering::Relaxed)
        };
        if stopping {
            return;
        }
        check_service(ctl, &name).await;
    }
}

async fn check_service(ctl: &Controller, name: &str) {
    refresh_facts(ctl, name);

    // Built-in liveness for process services: a dead pid schedules a start.
    let (kind, monitor, events) = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(s) = st.services.get(name) else { return };
        (s.kind.clone(), s.monitor, std::sync::Arc::clone(&st.events))
    };
    if let ServiceKind::Process { .. } = &kind {
        let pid = {
            let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            st.services.get(name).and_then(|s| s.info.pid)
        };
        if pid.is_none() {
            if monitor == MonitorState::Yes {
                post_service_event(
                    &events,
                    name,
                    EventKind::Existence,
                    EventState::Failed,
                    "restart",
                    "process is not running",
                );
                if let Err(e) = ctl.control(name, Action::Start).await {
                    vg_event("validator", Some(name), format!("restart dispatch failed: {e}"));
                }
            }
            // Initializing services are given their first cycle to come up
            // before the existence rule arms.
        }
    }

    let rule_count = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        st.services.get(name).map(|s| s.checks.len()).unwrap_or(0)
    };

    for idx in 0..rule_count {
        evaluate_rule(ctl, name, idx).await;
    }

    // First successful pass moves the service from Init to Yes.
    let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(s) = st.services.get_mut(name) {
        if s.monitor == MonitorState::Init {
            s.monitor = MonitorState::Yes;
        }
    }
}

/// Refresh the last-observed facts for a service.
fn refresh_facts(ctl: &Controller, name: &str) {
    let kind = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(s) = st.services.get(name) else { return };
        s.kind.clone()
    };

    match &kind {
        ServiceKind::Process { pidfile } => {
            let pid = facts::read_pidfile(pidfile).ok().flatten().filter(|p| facts::process_exists(*p));
            let now_ms = Local::now().timestamp_millis();
            let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(s) = st.services.get_mut(name) else { return };
            s.info.pid = pid;
            match pid {
                Some(pid) => {
                    s.info.memory_kb = facts::memory_kb(pid);
                    s.info.children = Some(facts::descendants_of(pid).len() as u32);
                    s.info.uptime_secs = facts::process_uptime_secs(pid);
                    if let Some(ticks) = facts::cpu_ticks(pid) {
                        if let Some((prev_ticks, prev_ms)) = s.info.cpu_sample {
                            s.info.cpu_percent = facts::cpu_percent(prev_ticks, prev_ms, ticks, now_ms);
                        }
                        s.info.cpu_sample = Some((ticks, now_ms));
                    }
                }
                None => {
                    s.info.memory_kb = None;
                    s.info.children = None;
                    s.info.uptime_secs = None;
                    s.info.cpu_percent = None;
                    s.info.cpu_sample = None;
                }
            }
        }
        ServiceKind::Filesystem { path } => {
            let usage = facts::filesystem_usage(path);
            let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(s) = st.services.get_mut(name) else { return };
            match usage {
                Ok((space, inodes)) => {
                    s.info.space_percent = Some(space);
                    s.info.inode_percent = Some(inodes);
                    s.info.message = None;
                }
                Err(e) => {
                    s.info.space_percent = None;
                    s.info.inode_percent = None;
                    s.info.message = Some(e.to_string());
                }
            }
        }
        ServiceKind::File { path }
        | ServiceKind::Directory { path }
        | ServiceKind::Fifo { path }
        | ServiceKind::Program { path } => {
            let mode = facts::file_mode(path).ok();
            let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(s) = st.services.get_mut(name) else { return };
            s.info.mode = mode;
        }
        ServiceKind::System => {
            let load = facts::system_loadavg();
            let uptime = facts::read_system_uptime_seconds();
            let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
            let Some(s) = st.services.get_mut(name) else { return };
            s.info.cpu_percent = load.map(|(a, _, _)| a);
            s.info.uptime_secs = uptime.map(|u| u as u64);
        }
        ServiceKind::RemoteHost { .. } | ServiceKind::Network { .. } => {}
    }
}

/// Evaluate one rule: measure, compare, count, trigger.
async fn evaluate_rule(ctl: &Controller, name: &str, idx: usize) {
    let (rule, kind, default_host) = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(s) = st.services.get(name) else { return };
        let Some(rule) = s.checks.get(idx) else { return };
        (rule.clone(), s.kind.clone(), s.default_host().to_string())
    };

    let outcome = measure(ctl, name, idx, &rule.rule, &kind, &default_host).await;

    let failure = match outcome {
        Measure::Ok => None,
        Measure::Skip => return,
        Measure::Fail(msg) => Some(msg),
    };

    let (fire, recovered, action, fails) = {
        let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(s) = st.services.get_mut(name) else { return };
        let Some(state) = s.rule_states.get_mut(idx) else { return };
        match &failure {
            Some(msg) => {
                state.fails = state.fails.saturating_add(1);
                s.info.message = Some(msg.clone());
                let fire = state.fails >= rule.cycles && !state.fired;
                if fire {
                    state.fired = true;
                }
                (fire, false, rule.action, state.fails)
            }
            None => {
                let recovered = state.fired;
                state.fails = 0;
                state.fired = false;
                if recovered {
                    s.info.message = None;
                }
                (false, recovered, rule.action, 0)
            }
        }
    };

    let events = {
        let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
        std::sync::Arc::clone(&st.events)
    };
    let event_kind = rule_event_kind(&rule.rule);

    if recovered {
        post_service_event(
            &events,
            name,
            event_kind,
            EventState::Succeeded,
            action.as_str(),
            format!("{} check recovered", rule.rule.kind_name()),
        );
        return;
    }

    let Some(msg) = failure else { return };
    if !fire {
        vg_event(
            "validator",
            Some(name),
            format!("{} check failed ({}/{}) -- {msg}", rule.rule.kind_name(), fails, rule.cycles),
        );
        return;
    }

    if action == RuleAction::Ignore {
        return;
    }
    post_service_event(&events, name, event_kind, EventState::Failed, action.as_str(), &msg);

    match action {
        RuleAction::Ignore | RuleAction::Alert => {}
        RuleAction::Restart => dispatch(ctl, name, Action::Restart).await,
        RuleAction::Start => dispatch(ctl, name, Action::Start).await,
        RuleAction::Stop => dispatch(ctl, name, Action::Stop).await,
        RuleAction::Monitor => dispatch(ctl, name, Action::Monitor).await,
        RuleAction::Unmonitor => dispatch(ctl, name, Action::Unmonitor).await,
        RuleAction::Exec => {
            if let Some(argv) = &rule.exec {
                ctl.run_exec_action(name, argv).await;
            }
        }
    }
}

async fn dispatch(ctl: &Controller, name: &str, action: Action) {
    if let Err(e) = ctl.control(name, action).await {
        vg_event("validator", Some(name), format!("{} dispatch failed: {e}", action.as_str()));
    }
}

enum Measure {
    Ok,
    Fail(String),
    /// The underlying fact is unavailable; the rule neither fails nor
    /// recovers this cycle.
    Skip,
}

fn rule_event_kind(rule: &RuleCheck) -> EventKind {
    match rule {
        RuleCheck::Connection(_) => EventKind::Connection,
        RuleCheck::Resource { .. } => EventKind::Resource,
        RuleCheck::Uptime { .. } => EventKind::Uptime,
        RuleCheck::SpaceUsage { .. } | RuleCheck::InodeUsage { .. } => EventKind::Resource,
        RuleCheck::Permission { .. } => EventKind::Permission,
        RuleCheck::Checksum { .. } => EventKind::Checksum,
        RuleCheck::Content { .. } => EventKind::Content,
        RuleCheck::Existence => EventKind::Existence,
    }
}

async fn measure(
    ctl: &Controller,
    name: &str,
    idx: usize,
    rule: &RuleCheck,
    kind: &ServiceKind,
    default_host: &str,
) -> Measure {
    match rule {
        RuleCheck::Connection(spec) => run_connection_check(spec, default_host).await,
        RuleCheck::Resource { resource, op, value } => {
            let measured = {
                let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                let Some(s) = st.services.get(name) else { return Measure::Skip };
                match resource {
                    ResourceKind::CpuPercent => s.info.cpu_percent,
                    ResourceKind::MemoryKb => s.info.memory_kb.map(|v| v as f64),
                    ResourceKind::Children => s.info.children.map(|v| v as f64),
                    ResourceKind::Loadavg1 => facts::system_loadavg().map(|(a, _, _)| a),
                    ResourceKind::Loadavg5 => facts::system_loadavg().map(|(_, b, _)| b),
                    ResourceKind::Loadavg15 => facts::system_loadavg().map(|(_, _, c)| c),
                }
            };
            match measured {
                None => Measure::Skip,
                Some(m) if op.matches_f64(m, *value) => Measure::Fail(format!(
                    "{resource:?} {m:.1} matched {op:?} {value}",
                )),
                Some(_) => Measure::Ok,
            }
        }
        RuleCheck::Uptime { op, seconds } => {
            let measured = {
                let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                st.services.get(name).and_then(|s| s.info.uptime_secs)
            };
            match measured {
                None => Measure::Skip,
                Some(m) if op.matches_f64(m as f64, *seconds as f64) => {
                    Measure::Fail(format!("uptime {m}s matched {op:?} {seconds}s"))
                }
                Some(_) => Measure::Ok,
            }
        }
        RuleCheck::SpaceUsage { op, percent } => {
            let measured = {
                let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                st.services.get(name).and_then(|s| s.info.space_percent)
            };
            match measured {
                None => Measure::Skip,
                Some(m) if op.matches_f64(m, *percent) => {
                    Measure::Fail(format!("space usage {m:.1}% matched {op:?} {percent}%"))
                }
                Some(_) => Measure::Ok,
            }
        }
        RuleCheck::InodeUsage { op, percent } => {
            let measured = {
                let st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                st.services.get(name).and_then(|s| s.info.inode_percent)
            };
            match measured {
                None => Measure::Skip,
                Some(m) if op.matches_f64(m, *percent) => {
                    Measure::Fail(format!("inode usage {m:.1}% matched {op:?} {percent}%"))
                }
                Some(_) => Measure::Ok,
            }
        }
        RuleCheck::Permission { mode } => {
            let Some(path) = kind_path(kind) else { return Measure::Skip };
            let expected = match u32::from_str_radix(mode.trim_start_matches("0o").trim_start_matches('0'), 8) {
                Ok(v) => v,
                Err(_) => return Measure::Fail(format!("invalid permission spec {mode:?}")),
            };
            match facts::file_mode(&path) {
                Err(e) => Measure::Fail(e.to_string()),
                Ok(actual) if actual != expected => Measure::Fail(format!(
                    "permission {actual:04o} does not match expected {expected:04o}"
                )),
                Ok(_) => Measure::Ok,
            }
        }
        RuleCheck::Checksum { algo, expected } => {
            let Some(path) = kind_path(kind) else { return Measure::Skip };
            let sum = match facts::file_checksum(&path, *algo) {
                Ok(s) => s,
                Err(e) => return Measure::Fail(e.to_string()),
            };
            let outcome = match expected {
                Some(want) => {
                    if sum.eq_ignore_ascii_case(want.trim()) {
                        Measure::Ok
                    } else {
                        Measure::Fail(format!("checksum {sum} does not match expected {want}"))
                    }
                }
                None => {
                    // No expected value: fail when the checksum changes.
                    let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                    let Some(s) = st.services.get_mut(name) else { return Measure::Skip };
                    let Some(state) = s.rule_states.get_mut(idx) else { return Measure::Skip };
                    let changed = state.last_value.as_deref().is_some_and(|prev| prev != sum);
                    state.last_value = Some(sum.clone());
                    if changed {
                        Measure::Fail(format!("checksum changed to {sum}"))
                    } else {
                        Measure::Ok
                    }
                }
            };
            {
                let mut st = ctl.state.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(s) = st.services.get_mut(name) {
                    s.info.checksum = Some(sum);
                }
            }
            outcome
        }
        RuleCheck::Content { pattern } => {
            let Some(path) = kind_path(kind) else { return Measure::Skip };
            let re = match Regex::new(pattern) {
                Ok(r) => r,
                Err(e) => return Measure::Fail(format!("invalid content pattern {pattern:?} -- {e}")),
            };
            match std::fs::read_to_string(&path) {
                Err(e) => Measure::Fail(format!("cannot read {}: {e}", path.display())),
                Ok(text) if re.is_match(&text) => {
                    Measure::Fail(format!("content matched pattern {pattern:?}"))
                }
                Ok(_) => Measure::Ok,
            }
        }
        RuleCheck::Existence => {
            let Some(path) = kind_path(kind) else { return Measure::Skip };
            if path.exists() {
                Measure::Ok
            } else {
                Measure::Fail(format!("{} does not exist", path.display()))
            }
        }
    }
}

fn kind_path(kind: &ServiceKind) -> Option<PathBuf> {
    match kind {
        ServiceKind::File { path }
        | ServiceKind::Directory { path }
        | ServiceKind::Fifo { path }
        | ServiceKind::Filesystem { path }
        | ServiceKind::Program { path } => Some(path.clone()),
        ServiceKind::Process { pidfile } => Some(pidfile.clone()),
        _ => None,
    }
}

/// Open the transport described by the rule and drive its protocol. STARTTLS
/// protocols get the rule's TLS options through the probe; everything else
/// negotiates TLS at connect time.
async fn run_connection_check(spec: &ConnectionSpec, default_host: &str) -> Measure {
    let starttls = matches!(&spec.protocol, Protocol::Smtp { starttls: true });
    let connect_tls = if starttls { None } else { spec.tls.as_ref() };

    let transport = match &spec.unix_path {
        Some(path) => Transport::connect_unix(path, spec.socket, spec.timeout_ms).await,
        None => {
            let host = spec.host.clone().unwrap_or_else(|| default_host.to_string());
            let Some(port) = spec.port else {
                return Measure::Fail("connection check has no port".to_string());
            };
            Transport::connect(&host, port, spec.socket, spec.family, connect_tls, spec.timeout_ms).await
        }
    };

    let mut t = match transport {
        Ok(t) => t,
        Err(e) => return Measure::Fail(format!("connection failed -- {e:#}")),
    };


    let result = spec.protocol.check(&mut t, spec.tls.as_ref()).await;
    match result {
        Ok(()) => {
            if let Some(soft) = t.take_error() {
                vg_event("validator", None, format!("probe soft failure: {soft}"));
            }
            Measure::Ok
        }
        Err(e) => Measure::Fail(format!("{e:#}")),
    }
}
