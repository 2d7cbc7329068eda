use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::vg::probe::Protocol;
use crate::vg::tls::ClientTlsOpts;
use crate::vg::transport::{Family, SocketKind};

/// Whether the validator evaluates a service on each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Not,
    Init,
    Yes,
}

impl MonitorState {
    pub fn active(&self) -> bool {
        matches!(self, MonitorState::Init | MonitorState::Yes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServiceKind {
    Process { pidfile: PathBuf },
    File { path: PathBuf },
    Directory { path: PathBuf },
    Fifo { path: PathBuf },
    Filesystem { path: PathBuf },
    RemoteHost { host: String },
    System,
    Program { path: PathBuf },
    Network { interface: String },
}

impl ServiceKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServiceKind::Process { .. } => "process",
            ServiceKind::File { .. } => "file",
            ServiceKind::Directory { .. } => "directory",
            ServiceKind::Fifo { .. } => "fifo",
            ServiceKind::Filesystem { .. } => "filesystem",
            ServiceKind::RemoteHost { .. } => "remotehost",
            ServiceKind::System => "system",
            ServiceKind::Program { .. } => "program",
            ServiceKind::Network { .. } => "network",
        }
    }
}

/// A lifecycle command: argv plus optional run-as identity and a timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub command: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_command_timeout")]
    pub timeout: u64,
}

fn default_command_timeout() -> u64 {
    30
}

impl Command {
    pub fn program(&self) -> &str {
        self.command.first().map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Greater,
    Less,
    Equal,
    NotEqual,
    Changed,
}

impl CompareOp {
    pub fn matches_f64(&self, measured: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Greater => measured > threshold,
            CompareOp::Less => measured < threshold,
            CompareOp::Equal => (measured - threshold).abs() < f64::EPSILON,
            CompareOp::NotEqual => (measured - threshold).abs() >= f64::EPSILON,
            CompareOp::Changed => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuPercent,
    MemoryKb,
    Children,
    Loadavg1,
    Loadavg5,
    Loadavg15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Md5,
    Sha1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Ignore,
    Alert,
    Restart,
    Stop,
    Exec,
    Unmonitor,
    Start,
    Monitor,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Ignore => "ignore",
            RuleAction::Alert => "alert",
            RuleAction::Restart => "restart",
            RuleAction::Stop => "stop",
            RuleAction::Exec => "exec",
            RuleAction::Unmonitor => "unmonitor",
            RuleAction::Start => "start",
            RuleAction::Monitor => "monitor",
        }
    }
}

/// Remote connection target for a connection rule. Host defaults to the
/// service's host for remotehost services, localhost otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub unix_path: Option<PathBuf>,
    #[serde(default = "default_socket_kind")]
    pub socket: SocketKind,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub tls: Option<ClientTlsOpts>,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_conn_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_socket_kind() -> SocketKind {
    SocketKind::Tcp
}

fn default_protocol() -> Protocol {
    Protocol::Default {
        send: None,
        expect: None,
    }
}

fn default_conn_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum RuleCheck {
    Connection(ConnectionSpec),
    Resource {
        resource: ResourceKind,
        op: CompareOp,
        value: f64,
    },
    Uptime {
        op: CompareOp,
        seconds: u64,
    },
    SpaceUsage {
        op: CompareOp,
        percent: f64,
    },
    InodeUsage {
        op: CompareOp,
        percent: f64,
    },
    Permission {
        mode: String,
    },
    Checksum {
        algo: HashAlgo,
        #[serde(default)]
        expected: Option<String>,
    },
    Content {
        pattern: String,
    },
    Existence,
}

impl RuleCheck {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RuleCheck::Connection(_) => "connection",
            RuleCheck::Resource { .. } => "resource",
            RuleCheck::Uptime { .. } => "uptime",
            RuleCheck::SpaceUsage { .. } => "space_usage",
            RuleCheck::InodeUsage { .. } => "inode_usage",
            RuleCheck::Permission { .. } => "permission",
            RuleCheck::Checksum { .. } => "checksum",
            RuleCheck::Content { .. } => "content",
            RuleCheck::Existence => "existence",
        }
    }
}

/// One configured rule: what to measure, how many consecutive failed cycles
/// arm the trigger, and what to do when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(flatten)]
    pub rule: RuleCheck,
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_action")]
    pub action: RuleAction,
    /// argv for `action: exec`.
    #[serde(default)]
    pub exec: Option<Vec<String>>,
}

fn default_cycles() -> u32 {
    1
}

fn default_action() -> RuleAction {
    RuleAction::Alert
}

/// Per-rule runtime counters, persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleState {
    pub fails: u32,
    /// Whether the trigger already fired for the current failure streak.
    pub fired: bool,
    /// Last observed value for `changed` comparisons.
    #[serde(default)]
    pub last_value: Option<String>,
}

/// Last-observed facts, refreshed by the validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub pid: Option<i32>,
    pub memory_kb: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub children: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub space_percent: Option<f64>,
    pub inode_percent: Option<f64>,
    pub mode: Option<u32>,
    pub checksum: Option<String>,
    /// (cumulative cpu ticks, sample time ms) for utilization deltas.
    #[serde(skip)]
    pub cpu_sample: Option<(u64, i64)>,
    /// Last check failure message, for status display.
    #[serde(default)]
    pub message: Option<String>,
}

impl ServiceInfo {
    pub fn reset(&mut self) {
        *self = ServiceInfo::default();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub start: Option<Command>,
    #[serde(default)]
    pub stop: Option<Command>,
    #[serde(default)]
    pub restart: Option<Command>,
    /// Names of services that must be up before this one.
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default = "default_monitor")]
    pub monitor: MonitorState,
    #[serde(default)]
    pub checks: Vec<Rule>,
    #[serde(skip)]
    pub rule_states: Vec<RuleState>,
    #[serde(skip)]
    pub info: ServiceInfo,
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

fn default_monitor() -> MonitorState {
    MonitorState::Init
}

impl Service {
    /// Connection host fallback for rules that omit one.
    pub fn default_host(&self) -> &str {
        match &self.kind {
            ServiceKind::RemoteHost { host } => host,
            _ => "localhost",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceFile {
    service: Service,
}

fn validate_command(name: &str, which: &str, cmd: &Command) -> anyhow::Result<()> {
    anyhow::ensure!(
        !cmd.command.is_empty() && !cmd.program().trim().is_empty(),
        "service {name:?}: {which} command must have a non-empty program"
    );
    anyhow::ensure!(cmd.timeout > 0, "service {name:?}: {which} timeout must be positive");
    Ok(())
}

/// Parse one service definition file.
pub fn parse_service_yaml(text: &str, source: &Path) -> anyhow::Result<Service> {
    let file: ServiceFile = serde_yaml::from_str(text)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", source.display()))?;
    let mut svc = file.service;

    let name = svc.name.trim().to_string();
    anyhow::ensure!(!name.is_empty(), "{}: service name must not be empty", source.display());
    anyhow::ensure!(
        !name.contains('/') && !name.contains(char::is_whitespace),
        "{}: service name must not contain '/' or whitespace: {name:?}",
        source.display()
    );
    svc.name = name;

    if let Some(c) = &svc.start {
        validate_command(&svc.name, "start", c)?;
    }
    if let Some(c) = &svc.stop {
        validate_command(&svc.name, "stop", c)?;
    }
    if let Some(c) = &svc.restart {
        validate_command(&svc.name, "restart", c)?;
    }

    for (i, rule) in svc.checks.iter().enumerate() {
        anyhow::ensure!(
            rule.cycles > 0,
            "service {:?}: check #{} cycles must be positive",
            svc.name,
            i + 1
        );
        if rule.action == RuleAction::Exec {
            anyhow::ensure!(
                rule.exec.as_ref().is_some_and(|v| !v.is_empty()),
                "service {:?}: check #{} action=exec requires an exec command",
                svc.name,
                i + 1
            );
        }
        if let RuleCheck::Connection(spec) = &rule.rule {
            anyhow::ensure!(
                spec.port.is_some() || spec.unix_path.is_some(),
                "service {:?}: check #{} connection needs a port or unix_path",
                svc.name,
                i + 1
            );
            if let Some(tls) = &spec.tls {
                if let Some(sum) = &tls.checksum {
                    crate::vg::tls::decode_fingerprint(sum)?;
                }
            }
        }
    }

    svc.rule_states = vec![RuleState::default(); svc.checks.len()];
    svc.source_file = Some(source.to_path_buf());
    Ok(svc)
}

/// Validate cross-service invariants: unique names, resolvable dependencies,
/// and an acyclic dependency graph.
pub fn validate_graph(services: &BTreeMap<String, Service>) -> anyhow::Result<()> {
    for (name, svc) in services {
        for dep in &svc.depends {
            anyhow::ensure!(
                services.contains_key(dep),
                "service {name:?} depends on unknown service {dep:?}"
            );
            anyhow::ensure!(dep != name, "service {name:?} depends on itself");
        }
    }

    // Iterative DFS cycle detection over the depends edges.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for root in services.keys() {
        if marks.contains_key(root.as_str()) {
            continue;
        }
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        marks.insert(root.as_str(), Mark::InProgress);
        while let Some((node, idx)) = stack.pop() {
            let deps = &services[node].depends;
            if idx < deps.len() {
                stack.push((node, idx + 1));
                let next = deps[idx].as_str();
                match marks.get(next) {
                    Some(Mark::InProgress) => {
                        anyhow::bail!("dependency cycle involving service {next:?}")
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::InProgress);
                        stack.push((next, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    Ok(())
}

/// Named service groups, derived from the per-service `group` attribute.
pub fn service_groups(services: &BTreeMap<String, Service>) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, svc) in services {
        if let Some(g) = &svc.group {
            out.entry(g.clone()).or_default().push(name.clone());
        }
    }
    out
}

/// Members of a group, or an error naming the unknown group.
pub fn group_members(services: &BTreeMap<String, Service>, group: &str) -> anyhow::Result<Vec<String>> {
    let groups = service_groups(services);
    groups
        .get(group)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("service group {group:?} does not exist"))
}

/// Names of services that directly depend on `name`.
pub fn dependants_of(services: &BTreeMap<String, Service>, name: &str) -> Vec<String> {
    let mut out: Vec<String> = services
        .values()
        .filter(|s| s.depends.iter().any(|d| d == name))
        .map(|s| s.name.clone())
        .collect();
    out.sort();
    out
}
