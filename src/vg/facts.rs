use anyhow::Context as _;
use md5::Md5;
use sha1::{Digest as _, Sha1};
use std::io::Read as _;
use std::path::Path;

use crate::vg::service::HashAlgo;

/// Read a pid from a pidfile; a missing file is not an error.
pub fn read_pidfile(path: &Path) -> anyhow::Result<Option<i32>> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let pid: i32 = s
        .trim()
        .parse()
        .with_context(|| format!("parse pid from {}: {:?}", path.display(), s.trim()))?;
    Ok(Some(pid))
}

/// True when the process exists. EPERM means it exists but belongs to
/// someone else.
pub fn process_exists(pid: i32) -> bool {
    match nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(pid))) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// The stop condition observed after a stop command: the process group query
/// fails with anything but EPERM.
pub fn process_stopped(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    !process_exists(pid)
}

fn stat_fields(pid: i32) -> Option<(i32, Vec<String>)> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses; fields start after the last ')'.
    let close = raw.rfind(')')?;
    let ppid_and_rest: Vec<String> = raw[close + 1..]
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let ppid: i32 = ppid_and_rest.get(1)?.parse().ok()?;
    Some((ppid, ppid_and_rest))
}

/// All descendant pids of `pid`, walking /proc once.
pub fn descendants_of(pid: i32) -> Vec<i32> {
    let mut parent_of: Vec<(i32, i32)> = Vec::new();
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    for ent in rd.flatten() {
        let Some(name) = ent.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        let Ok(child) = name.parse::<i32>() else { continue };
        if let Some((ppid, _)) = stat_fields(child) {
            parent_of.push((child, ppid));
        }
    }
    let mut out: Vec<i32> = Vec::new();
    let mut frontier = vec![pid];
    while let Some(p) = frontier.pop() {
        for (child, ppid) in &parent_of {
            if *ppid == p && !out.contains(child) {
                out.push(*child);
                frontier.push(*child);
            }
        }
    }
    out.sort_unstable();
    out
}

/// Resident memory in kilobytes from /proc/<pid>/status.
pub fn memory_kb(pid: i32) -> Option<u64> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}

/// Cumulative cpu ticks (utime + stime) from /proc/<pid>/stat.
pub fn cpu_ticks(pid: i32) -> Option<u64> {
    let (_, fields) = stat_fields(pid)?;
    // Fields after the comm: state ppid pgrp ... utime is index 11, stime 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

pub fn clock_ticks_per_second() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 {
        hz as u64
    } else {
        100
    }
}

/// CPU utilization percent from two tick samples.
pub fn cpu_percent(prev_ticks: u64, prev_ms: i64, now_ticks: u64, now_ms: i64) -> Option<f64> {
    let elapsed_ms = now_ms - prev_ms;
    if elapsed_ms <= 0 || now_ticks < prev_ticks {
        return None;
    }
    let hz = clock_ticks_per_second() as f64;
    let used_ms = (now_ticks - prev_ticks) as f64 * 1000.0 / hz;
    Some((used_ms / elapsed_ms as f64 * 100.0).clamp(0.0, 100.0 * num_cpus() as f64))
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

pub fn read_system_uptime_seconds() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/uptime").ok()?;
    raw.split_whitespace().next()?.parse().ok()
}

/// Process uptime in seconds, from the starttime field and system uptime.
pub fn process_uptime_secs(pid: i32) -> Option<u64> {
    let (_, fields) = stat_fields(pid)?;
    let starttime_ticks: u64 = fields.get(19)?.parse().ok()?;
    let sys_uptime = read_system_uptime_seconds()?;
    let started = starttime_ticks as f64 / clock_ticks_per_second() as f64;
    let up = sys_uptime - started;
    if up < 0.0 {
        return None;
    }
    Some(up as u64)
}

pub fn system_loadavg() -> Option<(f64, f64, f64)> {
    let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
    let mut it = raw.split_whitespace();
    let a = it.next()?.parse().ok()?;
    let b = it.next()?.parse().ok()?;
    let c = it.next()?.parse().ok()?;
    Some((a, b, c))
}

/// Space and inode usage percentages of the filesystem containing `path`.
pub fn filesystem_usage(path: &Path) -> anyhow::Result<(f64, f64)> {
    let st = nix::sys::statvfs::statvfs(path)
        .map_err(|e| anyhow::anyhow!("statvfs {}: {e}", path.display()))?;
    let blocks = st.blocks() as f64;
    let bfree = st.blocks_available() as f64;
    let files = st.files() as f64;
    let ffree = st.files_available() as f64;
    let space = if blocks > 0.0 {
        (blocks - bfree) / blocks * 100.0
    } else {
        0.0
    };
    let inodes = if files > 0.0 {
        (files - ffree) / files * 100.0
    } else {
        0.0
    };
    Ok((space, inodes))
}

/// Permission bits of a path (the 07777 part).
pub fn file_mode(path: &Path) -> anyhow::Result<u32> {
    use std::os::unix::fs::MetadataExt as _;
    let md = std::fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    Ok(md.mode() & 0o7777)
}

/// Hex digest of a file with the selected algorithm, streamed in chunks.
pub fn file_checksum(path: &Path, algo: HashAlgo) -> anyhow::Result<String> {
    let mut f = std::fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut buf = [0u8; 64 * 1024];
    match algo {
        HashAlgo::Md5 => {
            let mut h = Md5::new();
            loop {
                let n = f.read(&mut buf).with_context(|| format!("read {}", path.display()))?;
                if n == 0 {
                    break;
                }
                h.update(&buf[..n]);
            }
            Ok(hex(&h.finalize()))
        }
        HashAlgo::Sha1 => {
            let mut h = Sha1::new();
            loop {
                let n = f.read(&mut buf).with_context(|| format!("read {}", path.display()))?;
                if n == 0 {
                    break;
                }
                h.update(&buf[..n]);
            }
            Ok(hex(&h.finalize()))
        }
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// All processes whose command line matches the pattern. Used by the
/// `procmatch` CLI mode to let operators test patterns.
pub fn match_processes(pattern: &regex::Regex) -> Vec<(i32, String)> {
    let mut out = Vec::new();
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return out;
    };
    let me = std::process::id() as i32;
    for ent in rd.flatten() {
        let Some(name) = ent.file_name().to_str().map(|s| s.to_string()) else {
            continue;
        };
        let Ok(pid) = name.parse::<i32>() else { continue };
        if pid == me {
            continue;
        }
        let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            continue;
        };
        if raw.is_empty() {
            continue;
        }
        let cmdline = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        if pattern.is_match(&cmdline) {
            out.push((pid, cmdline));
        }
    }
    out.sort_by_key(|(pid, _)| *pid);
    out
}
