use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::vg::event::vg_event;
use crate::vg::service::{MonitorState, RuleState, Service, ServiceInfo};

const STATE_VERSION: u32 = 1;
const MAX_STATE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedServiceState {
    monitor: MonitorState,
    #[serde(default)]
    rule_states: Vec<RuleState>,
    #[serde(default)]
    info: ServiceInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedStateFile {
    version: u32,
    #[serde(default)]
    services: HashMap<String, PersistedServiceState>,
}

/// Atomically rewrite the state snapshot: temp file in the same directory,
/// then rename over the target.
pub fn save_state(path: &Path, services: &BTreeMap<String, Service>) -> anyhow::Result<()> {
    let mut file = PersistedStateFile {
        version: STATE_VERSION,
        services: HashMap::new(),
    };
    for (name, svc) in services {
        file.services.insert(
            name.clone(),
            PersistedServiceState {
                monitor: svc.monitor,
                rule_states: svc.rule_states.clone(),
                info: svc.info.clone(),
            },
        );
    }

    let body = serde_json::to_vec_pretty(&file).context("serialize state")?;
    let tmp = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    std::fs::write(&tmp, &body).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Restore monitoring flags, rule counters and last facts. An unreadable or
/// corrupted file is logged and treated as empty; monitoring resumes fresh.
pub fn restore_state_best_effort(path: &Path, services: &mut BTreeMap<String, Service>) {
    let raw = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            vg_event("state", None, format!("restore_skipped path={} err={e}", path.display()));
            return;
        }
    };
    if raw.len() as u64 > MAX_STATE_BYTES {
        vg_event(
            "state",
            None,
            format!("restore_skipped path={} reason=oversized bytes={}", path.display(), raw.len()),
        );
        return;
    }
    let file: PersistedStateFile = match serde_json::from_slice(&raw) {
        Ok(f) => f,
        Err(e) => {
            vg_event(
                "state",
                None,
                format!("restore_skipped path={} reason=corrupted err={e}", path.display()),
            );
            return;
        }
    };
    if file.version != STATE_VERSION {
        vg_event(
            "state",
            None,
            format!("restore_skipped path={} reason=version got={}", path.display(), file.version),
        );
        return;
    }

    let mut restored = 0usize;
    for (name, svc) in services.iter_mut() {
        let Some(p) = file.services.get(name) else { continue };
        svc.monitor = p.monitor;
        // Counters only carry over while the rule list is unchanged in shape.
        if p.rule_states.len() == svc.rule_states.len() {
            svc.rule_states = p.rule_states.clone();
        }
        svc.info = p.info.clone();
        restored += 1;
    }
    vg_event(
        "state",
        None,
        format!("restored path={} services={restored}", path.display()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vg::service::parse_service_yaml;

    fn sample_services() -> BTreeMap<String, Service> {
        let mut out = BTreeMap::new();
        for name in ["a", "b"] {
            let svc = parse_service_yaml(
                &format!("service:\n  name: {name}\n  type: system\n"),
                Path::new("test.yaml"),
            )
            .unwrap();
            out.insert(name.to_string(), svc);
        }
        out
    }

    #[test]
    fn save_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.state");

        let mut services = sample_services();
        services.get_mut("a").unwrap().monitor = MonitorState::Not;
        services.get_mut("a").unwrap().info.pid = Some(42);
        save_state(&path, &services).unwrap();

        let mut fresh = sample_services();
        assert_eq!(fresh["a"].monitor, MonitorState::Init);
        restore_state_best_effort(&path, &mut fresh);
        assert_eq!(fresh["a"].monitor, MonitorState::Not);
        assert_eq!(fresh["a"].info.pid, Some(42));
        assert_eq!(fresh["b"].monitor, MonitorState::Init);
    }

    #[test]
    fn corrupted_state_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.state");
        std::fs::write(&path, b"{ not json").unwrap();
        let mut services = sample_services();
        restore_state_best_effort(&path, &mut services);
        assert_eq!(services["a"].monitor, MonitorState::Init);
    }

    #[test]
    fn missing_state_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let mut services = sample_services();
        restore_state_best_effort(&dir.path().join("none.state"), &mut services);
        assert_eq!(services.len(), 2);
    }
}
