use clap::{Parser, Subcommand};
use md5::Md5;
use sha1::{Digest as _, Sha1};
use std::io::Read as _;
use std::path::PathBuf;

use crate::vg::config::{self, MasterConfig};
use crate::vg::daemon;
use crate::vg::facts;
use crate::vg::rpc::ClientTarget;
use crate::vg::service::group_members;

#[derive(Debug, Parser)]
#[command(name = "vigild", version, about = "dependency-aware service monitoring daemon")]
pub struct Args {
    /// Path to the master configuration YAML
    #[arg(short = 'c', long = "config", default_value = "vigild.yaml")]
    pub config: PathBuf,

    /// Override the validator poll interval (seconds)
    #[arg(short = 'd', long = "delay")]
    pub delay: Option<u64>,

    /// Apply the action to every member of this service group
    #[arg(short = 'g', long = "group")]
    pub group: Option<String>,

    /// Daemon log file path
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<PathBuf>,

    /// Pidfile path override
    #[arg(short = 'p', long = "pidfile")]
    pub pidfile: Option<PathBuf>,

    /// State snapshot path override
    #[arg(short = 's', long = "statefile")]
    pub statefile: Option<PathBuf>,

    /// Stay in the foreground. vigild never detaches itself; process
    /// supervision is the init system's job. Accepted for familiarity.
    #[arg(short = 'I', long = "foreground")]
    pub foreground: bool,

    /// Check the configuration syntax and exit
    #[arg(short = 't', long = "test")]
    pub test: bool,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print SHA1 and MD5 checksums of a file and exit ("-" reads stdin)
    #[arg(short = 'H', long = "hash", num_args = 0..=1, default_missing_value = "-")]
    pub hash: Option<String>,

    /// Print this instance's unique id and exit
    #[arg(long = "id")]
    pub id: bool,

    /// Regenerate this instance's unique id and exit
    #[arg(long = "resetid")]
    pub resetid: bool,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Start a service and its prerequisites, or all
    Start { name: Option<String> },
    /// Stop a service and its dependants, or all
    Stop { name: Option<String> },
    /// Restart a service, or all
    Restart { name: Option<String> },
    /// Enable monitoring of a service and its prerequisites, or all
    Monitor { name: Option<String> },
    /// Disable monitoring of a service and its dependants, or all
    Unmonitor { name: Option<String> },
    /// Ask the running daemon to re-read its configuration
    Reload,
    /// Show the full service status table
    Status,
    /// Show the condensed service table
    Summary,
    /// Stop the running daemon
    Quit,
    /// Ask the running daemon to run a validation cycle now
    Validate,
    /// List processes whose command line matches a pattern
    Procmatch { pattern: String },
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(target) = &args.hash {
        return print_checksums(target);
    }

    let config_path = args.config.clone();
    let overrides = Overrides {
        delay: args.delay,
        logfile: args.logfile.clone(),
        pidfile: args.pidfile.clone(),
        statefile: args.statefile.clone(),
        verbose: args.verbose,
    };
    let load = move || -> anyhow::Result<MasterConfig> {
        let mut cfg = config::load_master_config(&config_path)?;
        overrides.apply(&mut cfg);
        Ok(cfg)
    };

    if args.test {
        let cfg = load()?;
        let services = config::load_services(&cfg)?;
        println!("Configuration syntax OK ({} services)", services.len());
        return Ok(());
    }

    if args.id || args.resetid {
        let cfg = load()?;
        let id = instance_id(&cfg, args.resetid)?;
        println!("{id}");
        return Ok(());
    }

    if let Some(Cmd::Procmatch { pattern }) = &args.cmd {
        let re = regex::Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid pattern {pattern:?}: {e}"))?;
        let matches = facts::match_processes(&re);
        for (pid, cmdline) in &matches {
            println!("{pid:>8}  {cmdline}");
        }
        println!("Total matches: {}", matches.len());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow::anyhow!("build tokio runtime: {e}"))?;

    match args.cmd {
        None => {
            if !args.foreground && args.verbose > 0 {
                eprintln!("vigild runs in the foreground; leave daemonization to the init system");
            }
            rt.block_on(daemon::run_daemon_async(load))
        }
        Some(Cmd::Status) => {
            let cfg = load()?;
            let target = ClientTarget::from_config(&cfg)?;
            let text = rt.block_on(target.fetch_text("/_status"))?;
            print!("{text}");
            Ok(())
        }
        Some(Cmd::Summary) => {
            let cfg = load()?;
            let target = ClientTarget::from_config(&cfg)?;
            let text = rt.block_on(target.fetch_text("/_summary"))?;
            print!("{text}");
            Ok(())
        }
        Some(Cmd::Validate) => {
            let cfg = load()?;
            let target = ClientTarget::from_config(&cfg)?;
            rt.block_on(target.post_path("/_validate"))?;
            println!("validation cycle scheduled");
            Ok(())
        }
        Some(Cmd::Reload) => signal_daemon(&load()?, nix::sys::signal::Signal::SIGHUP, "reload"),
        Some(Cmd::Quit) => signal_daemon(&load()?, nix::sys::signal::Signal::SIGTERM, "quit"),
        Some(Cmd::Start { name }) => run_action(&rt, &load()?, "start", name, args.group),
        Some(Cmd::Stop { name }) => run_action(&rt, &load()?, "stop", name, args.group),
        Some(Cmd::Restart { name }) => run_action(&rt, &load()?, "restart", name, args.group),
        Some(Cmd::Monitor { name }) => run_action(&rt, &load()?, "monitor", name, args.group),
        Some(Cmd::Unmonitor { name }) => run_action(&rt, &load()?, "unmonitor", name, args.group),
        Some(Cmd::Procmatch { .. }) => unreachable!("handled before config load"),
    }
}

/// Read the instance id next to the state file, creating (or with `reset`
/// regenerating) it on demand.
fn instance_id(cfg: &MasterConfig, reset: bool) -> anyhow::Result<String> {
    use rand::RngCore as _;
    let path = cfg.statefile.with_file_name("vigild.id");
    if !reset {
        if let Ok(existing) = std::fs::read_to_string(&path) {
            let t = existing.trim();
            if !t.is_empty() {
                return Ok(t.to_string());
            }
        }
    }
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let id = facts::hex(&bytes);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&path, format!("{id}\n"))
        .map_err(|e| anyhow::anyhow!("failed to write id file {}: {e}", path.display()))?;
    Ok(id)
}

#[derive(Clone)]
struct Overrides {
    delay: Option<u64>,
    logfile: Option<PathBuf>,
    pidfile: Option<PathBuf>,
    statefile: Option<PathBuf>,
    verbose: u8,
}

impl Overrides {
    fn apply(&self, cfg: &mut MasterConfig) {
        if let Some(d) = self.delay {
            cfg.polltime = d;
        }
        if let Some(p) = &self.logfile {
            cfg.logfile = Some(p.clone());
        }
        if let Some(p) = &self.pidfile {
            cfg.pidfile = p.clone();
        }
        if let Some(p) = &self.statefile {
            cfg.statefile = p.clone();
        }
        cfg.debug = self.verbose;
    }
}

/// Resolve the services an action applies to: an explicit name, `all`, or a
/// `-g` group.
fn resolve_targets(
    cfg: &MasterConfig,
    name: Option<String>,
    group: Option<String>,
) -> anyhow::Result<Vec<String>> {
    if let Some(g) = group {
        let services = config::load_services(cfg)?;
        return group_members(&services, &g);
    }
    match name.as_deref() {
        Some("all") => {
            let services = config::load_services(cfg)?;
            Ok(services.keys().cloned().collect())
        }
        Some(n) => Ok(vec![n.to_string()]),
        None => anyhow::bail!("action requires a service name, 'all', or -g <group>"),
    }
}

fn run_action(
    rt: &tokio::runtime::Runtime,
    cfg: &MasterConfig,
    action: &str,
    name: Option<String>,
    group: Option<String>,
) -> anyhow::Result<()> {
    let targets = resolve_targets(cfg, name, group)?;
    let client = ClientTarget::from_config(cfg)?;
    for service in targets {
        rt.block_on(client.call_action(&service, action))?;
        println!("{service}: {action} done");
    }
    Ok(())
}

fn signal_daemon(cfg: &MasterConfig, sig: nix::sys::signal::Signal, what: &str) -> anyhow::Result<()> {
    let pid = facts::read_pidfile(&cfg.pidfile)?
        .filter(|p| facts::process_exists(*p))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no running daemon found (pidfile {})",
                cfg.pidfile.display()
            )
        })?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
        .map_err(|e| anyhow::anyhow!("failed to signal pid {pid}: {e}"))?;
    println!("{what} signalled to daemon (pid {pid})");
    Ok(())
}

/// `-H`: print SHA1 and MD5 of a file or stdin, then exit.
fn print_checksums(target: &str) -> anyhow::Result<()> {
    let mut sha = Sha1::new();
    let mut md5 = Md5::new();
    let label;
    if target == "-" {
        label = "stdin".to_string();
        let mut buf = [0u8; 64 * 1024];
        let mut stdin = std::io::stdin().lock();
        loop {
            let n = stdin.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sha.update(&buf[..n]);
            md5.update(&buf[..n]);
        }
    } else {
        label = target.to_string();
        let mut f = std::fs::File::open(target)
            .map_err(|e| anyhow::anyhow!("cannot open {target}: {e}"))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            sha.update(&buf[..n]);
            md5.update(&buf[..n]);
        }
    }
    println!("SHA1({label}) = {}", facts::hex(&sha.finalize()));
    println!("MD5({label})  = {}", facts::hex(&md5.finalize()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn cli_parses() {
        Args::command().debug_assert();
        let args = Args::parse_from(["vigild", "-c", "/etc/v.yaml", "restart", "nginx"]);
        assert!(matches!(args.cmd, Some(Cmd::Restart { name: Some(ref n) }) if n == "nginx"));

        let args = Args::parse_from(["vigild", "-vv", "-d", "10"]);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.delay, Some(10));
        assert!(args.cmd.is_none());

        let args = Args::parse_from(["vigild", "-H"]);
        assert_eq!(args.hash.as_deref(), Some("-"));
        let args = Args::parse_from(["vigild", "-H", "file.bin"]);
        assert_eq!(args.hash.as_deref(), Some("file.bin"));

        let args = Args::parse_from(["vigild", "-g", "web", "stop"]);
        assert_eq!(args.group.as_deref(), Some("web"));
        assert!(matches!(args.cmd, Some(Cmd::Stop { name: None })));
    }
}
