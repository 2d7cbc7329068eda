use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc as tokio_mpsc;

use crate::vg::asyncutil::TaskTracker;

static TASKS: OnceLock<TaskTracker> = OnceLock::new();

pub fn init_tasks() {
    let _ = TASKS.set(TaskTracker::new());
}

pub(crate) fn tasks() -> &'static TaskTracker {
    TASKS.get().expect("TASKS not initialized")
}

const DAEMON_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const EVENT_RING_MAX: usize = 2000;
const EARLY_LOG_MAX_LINES: usize = 5000;

static DAEMON_LOG_TX: OnceLock<tokio_mpsc::UnboundedSender<String>> = OnceLock::new();
static EARLY_LOG: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

/// Lifecycle/check outcome reported on a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Succeeded,
    Failed,
    Changed,
    Init,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Succeeded => "succeeded",
            EventState::Failed => "failed",
            EventState::Changed => "changed",
            EventState::Init => "init",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Exec,
    Connection,
    Resource,
    Checksum,
    Permission,
    Uptime,
    Content,
    Existence,
    Lifecycle,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Exec => "exec",
            EventKind::Connection => "connection",
            EventKind::Resource => "resource",
            EventKind::Checksum => "checksum",
            EventKind::Permission => "permission",
            EventKind::Uptime => "uptime",
            EventKind::Content => "content",
            EventKind::Existence => "existence",
            EventKind::Lifecycle => "lifecycle",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(default)]
    pub service: Option<String>,
    pub message: String,
}

pub type EventRing = Arc<Mutex<VecDeque<EventEntry>>>;

pub fn new_ring() -> EventRing {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Log a timestamped key=value line to stderr and the daemon log file.
pub fn vg_event(component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match service {
        Some(s) => format!("{ts} [{component}] service={s} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = DAEMON_LOG_TX.get() {
        let _ = tx.send(line);
    } else {
        let q = EARLY_LOG.get_or_init(|| Mutex::new(VecDeque::new()));
        let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
        g.push_back(line);
        while g.len() > EARLY_LOG_MAX_LINES {
            g.pop_front();
        }
    }
}

/// Log and record an entry in the bounded event ring served over the control channel.
pub fn push_event(events: &EventRing, component: &str, service: Option<&str>, msg: impl AsRef<str>) {
    vg_event(component, service, msg.as_ref());
    let entry = EventEntry {
        ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
        component: component.to_string(),
        service: service.map(|s| s.to_string()),
        message: msg.as_ref().to_string(),
    };
    let mut q = events.lock().unwrap_or_else(|p| p.into_inner());
    q.push_back(entry);
    while q.len() > EVENT_RING_MAX {
        q.pop_front();
    }
}

/// Post a rule/lifecycle event on a service.
pub fn post_service_event(
    events: &EventRing,
    service: &str,
    kind: EventKind,
    state: EventState,
    action: &str,
    msg: impl AsRef<str>,
) {
    push_event(
        events,
        kind.as_str(),
        Some(service),
        format!("state={} action={} {}", state.as_str(), action, msg.as_ref()),
    );
}

async fn open_append_log(path: &PathBuf) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

/// Start the daemon log file writer task. Lines logged via `vg_event` before
/// this point are buffered in memory and flushed once the file is open.
pub fn start_daemon_log_file(path: PathBuf) {
    let (tx, mut rx) = tokio_mpsc::unbounded_channel::<String>();
    if DAEMON_LOG_TX.set(tx).is_err() {
        return;
    }

    vg_event(
        "log",
        None,
        format!("daemon_log_file path={} rotate=size max_bytes={DAEMON_LOG_MAX_BYTES}", path.display()),
    );

    tasks().spawn(async move {
        let mut f = match open_append_log(&path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} [log] failed to open daemon log file {} err={e}",
                    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                    path.display()
                );
                return;
            }
        };

        // Flush early boot logs (including config parse warnings) into the log file.
        if let Some(q) = EARLY_LOG.get() {
            // Do not hold the mutex guard across an await point.
            let drained: Vec<String> = {
                let mut g = q.lock().unwrap_or_else(|p| p.into_inner());
                g.drain(..).collect()
            };
            for line in drained {
                let mut s = line;
                if !s.ends_with('\n') {
                    s.push('\n');
                }
                let _ = f.write_all(s.as_bytes()).await;
            }
            let _ = f.flush().await;
        }

        let mut bytes_written: u64 = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(line) = rx.recv().await {
            // Size-based rotation: keep a single `.1` backup.
            if bytes_written >= DAEMON_LOG_MAX_BYTES {
                let _ = f.flush().await;
                let backup = path.with_extension("log.1");
                let _ = tokio::fs::rename(&path, &backup).await;
                match open_append_log(&path).await {
                    Ok(nf) => {
                        f = nf;
                        bytes_written = 0;
                    }
                    Err(_) => {}
                }
            }

            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            if f.write_all(s.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(s.len() as u64);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let ring = new_ring();
        for i in 0..(EVENT_RING_MAX + 100) {
            let entry = EventEntry {
                ts: "t".to_string(),
                component: "test".to_string(),
                service: None,
                message: format!("m{i}"),
            };
            let mut q = ring.lock().unwrap();
            q.push_back(entry);
            while q.len() > EVENT_RING_MAX {
                q.pop_front();
            }
        }
        assert_eq!(ring.lock().unwrap().len(), EVENT_RING_MAX);
    }

    #[test]
    fn event_state_names() {
        assert_eq!(EventState::Succeeded.as_str(), "succeeded");
        assert_eq!(EventState::Failed.as_str(), "failed");
        assert_eq!(EventKind::Exec.as_str(), "exec");
    }
}
