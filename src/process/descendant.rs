//! Process-table lookups for processes that outlive their launching command.
//!
//! A launch may go through a shell or wrapper that forks the real runnee, so
//! killing the direct child is not always enough. The runnee carries the control
//! port and correlation id on its command line; that pair is the tag we scan for.

use std::path::Path;
#[cfg(all(unix, not(target_os = "linux")))]
use std::process::Command;

/// Command-line markers identifying the runnee of one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTag {
    /// Control listener port passed to the child.
    pub port: u16,
    /// Correlation id passed to the child.
    pub correlation_id: String,
}

impl ProcessTag {
    /// Whether the argument vector carries both markers.
    pub fn matches(&self, argv: &[String]) -> bool {
        let port = self.port.to_string();
        flag_value_matches(argv, "--port", &port)
            && flag_value_matches(argv, "--procuuid", &self.correlation_id)
    }
}

fn flag_value_matches(argv: &[String], flag: &str, expected: &str) -> bool {
    let inline = format!("{flag}=");
    argv.iter().enumerate().any(|(index, arg)| {
        if arg == flag {
            return argv.get(index + 1).map(String::as_str) == Some(expected);
        }
        arg.strip_prefix(&inline) == Some(expected)
    })
}

/// Capability to find a process by tag in the OS process table.
pub trait ProcessTable: Send {
    /// Pid of a process (other than the caller) whose command line carries `tag`.
    fn find_descendant_by_tag(&self, tag: &ProcessTag) -> Option<i32>;
}

/// Platform process table: `/proc` on Linux, `ps` on other Unix, nothing elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn find_descendant_by_tag(&self, tag: &ProcessTag) -> Option<i32> {
        let own_pid = std::process::id() as i32;
        process_command_lines()
            .into_iter()
            .filter(|(pid, _)| *pid != own_pid)
            .find(|(_, argv)| tag.matches(argv))
            .map(|(pid, _)| pid)
    }
}

/// Process table that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcessTable;

impl ProcessTable for NoProcessTable {
    fn find_descendant_by_tag(&self, _tag: &ProcessTag) -> Option<i32> {
        None
    }
}

#[cfg(target_os = "linux")]
fn process_command_lines() -> Vec<(i32, Vec<String>)> {
    proc_command_lines(Path::new("/proc"))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_command_lines() -> Vec<(i32, Vec<String>)> {
    let Ok(output) = Command::new("ps").args(["-axo", "pid=,command="]).output() else {
        tracing::debug!("process table scan skipped (ps snapshot unavailable)");
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect()
}

#[cfg(not(unix))]
fn process_command_lines() -> Vec<(i32, Vec<String>)> {
    Vec::new()
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn proc_command_lines(proc_root: &Path) -> Vec<(i32, Vec<String>)> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<i32>().ok()?;
            // Processes may vanish between listing and reading; skip them.
            let raw = std::fs::read(entry.path().join("cmdline")).ok()?;
            let argv = split_cmdline(&raw);
            (!argv.is_empty()).then_some((pid, argv))
        })
        .collect()
}

fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|byte| *byte == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

#[cfg_attr(any(target_os = "linux", not(unix)), allow(dead_code))]
fn parse_ps_line(line: &str) -> Option<(i32, Vec<String>)> {
    let trimmed = line.trim();
    let (pid, command) = trimmed.split_once(char::is_whitespace)?;
    let pid = pid.parse::<i32>().ok()?;
    let argv: Vec<String> = command.split_whitespace().map(ToString::to_string).collect();
    if argv.is_empty() {
        return None;
    }
    Some((pid, argv))
}
