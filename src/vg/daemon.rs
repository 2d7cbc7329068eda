use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;

use crate::vg::channel::start_channel;
use crate::vg::config::{effective_hostname, load_services, MasterConfig};
use crate::vg::control::{Controller, DaemonState};
use crate::vg::event::{self, new_ring, vg_event};
use crate::vg::facts;
use crate::vg::state::{restore_state_best_effort, save_state};
use crate::vg::validator::{run_validator, ControlMsg, LoopExit};

/// Run the daemon until shutdown. The loader is invoked at start and again
/// on every SIGHUP reload.
pub async fn run_daemon_async<F>(load: F) -> anyhow::Result<()>
where
    F: Fn() -> anyhow::Result<MasterConfig>,
{
    event::init_tasks();
    let mut first = true;
    loop {
        let cfg = load()?;
        match run_once(cfg, first).await? {
            LoopExit::Shutdown => return Ok(()),
            LoopExit::Reload => {
                vg_event("daemon", None, "reload requested; re-reading configuration");
                first = false;
            }
        }
    }
}

async fn run_once(cfg: MasterConfig, first: bool) -> anyhow::Result<LoopExit> {
    // Preflight: parse every service definition and validate the graph
    // before any side effects.
    let mut services = load_services(&cfg)?;

    if first {
        check_pidfile(&cfg.pidfile)?;
        write_pidfile(&cfg.pidfile)?;
        if let Some(logfile) = &cfg.logfile {
            event::start_daemon_log_file(logfile.clone());
        }
        vg_event(
            "boot",
            None,
            format!(
                "{} polltime={}s services={}",
                crate::vg::build_info::banner(),
                cfg.polltime,
                services.len()
            ),
        );
    }

    restore_state_best_effort(&cfg.statefile, &mut services);

    let shutting_down = Arc::new(AtomicBool::new(false));
    let hostname = effective_hostname(&cfg);
    let state = Arc::new(Mutex::new(DaemonState {
        cfg: cfg.clone(),
        hostname,
        services,
        events: new_ring(),
        shutting_down: Arc::clone(&shutting_down),
    }));
    let ctl = Controller::new(Arc::clone(&state));

    let (tx, mut rx) = mpsc::channel::<ControlMsg>(16);
    start_signal_listener(Arc::clone(&shutting_down), tx.clone());
    start_channel(ctl.clone(), tx.clone())?;

    let exit = run_validator(ctl.clone(), &mut rx).await;

    // Stop background tasks (channel serve loops watch this flag), persist
    // state, and reap whatever children are left.
    shutting_down.store(true, Ordering::Relaxed);
    {
        let st = state.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = save_state(&st.cfg.statefile, &st.services) {
            vg_event("state", None, format!("final flush failed: {e}"));
        }
    }
    reap_children();
    // Give the channel's graceful shutdown a moment to release the port.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    if exit == LoopExit::Shutdown {
        vg_event("shutdown", None, "daemon stopping");
        let _ = std::fs::remove_file(&cfg.pidfile);
        if let Some(sock) = &cfg.channel.unix_socket {
            let _ = std::fs::remove_file(sock);
        }
    }
    Ok(exit)
}

fn start_signal_listener(flag: Arc<AtomicBool>, tx: mpsc::Sender<ControlMsg>) {
    event::tasks().spawn(async move {
        let Ok(mut term) = unix_signal(SignalKind::terminate()) else { return };
        let Ok(mut int) = unix_signal(SignalKind::interrupt()) else { return };
        let Ok(mut hup) = unix_signal(SignalKind::hangup()) else { return };
        let Ok(mut usr1) = unix_signal(SignalKind::user_defined1()) else { return };
        loop {
            tokio::select! {
                _ = term.recv() => {
                    flag.store(true, Ordering::Relaxed);
                    let _ = tx.send(ControlMsg::Stop).await;
                    return;
                }
                _ = int.recv() => {
                    flag.store(true, Ordering::Relaxed);
                    let _ = tx.send(ControlMsg::Stop).await;
                    return;
                }
                _ = hup.recv() => {
                    let _ = tx.send(ControlMsg::Reload).await;
                    return;
                }
                _ = usr1.recv() => {
                    let _ = tx.send(ControlMsg::Wakeup).await;
                }
            }
        }
    });
}

/// Refuse to start when another daemon instance still owns the pidfile.
fn check_pidfile(path: &Path) -> anyhow::Result<()> {
    if let Some(pid) = facts::read_pidfile(path).unwrap_or(None) {
        if pid != std::process::id() as i32 && facts::process_exists(pid) {
            anyhow::bail!(
                "vigild daemon already running with pid {pid} (pidfile {})",
                path.display()
            );
        }
    }
    Ok(())
}

fn write_pidfile(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|e| anyhow::anyhow!("failed to write pidfile {}: {e}", path.display()))
}

/// Drain exited children without blocking. Called at reload and shutdown.
fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        // No pidfile: fine.
        check_pidfile(&path).unwrap();
        // Dead pid: fine.
        std::fs::write(&path, format!("{}\n", i32::MAX - 1)).unwrap();
        check_pidfile(&path).unwrap();
        // Live foreign pid: refused (pid 1 always exists).
        std::fs::write(&path, "1\n").unwrap();
        assert!(check_pidfile(&path).is_err());
        // Our own pid: fine (restart-in-place after reload).
        write_pidfile(&path).unwrap();
        check_pidfile(&path).unwrap();
    }
}
