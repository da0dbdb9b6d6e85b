//! Process-tree inspection for the native backend.
//!
//! The memory monitor and the kill path both need to see the whole tree
//! rooted at the spawned tool, because verification tools routinely fork
//! solver subprocesses. Only Linux exposes this through /proc; other
//! hosts get a documented best effort (no memory samples, no child
//! discovery).

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
pub use fallback::*;

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::fs;

    /// True while the process exists and is not a zombie. Zombies are
    /// excluded so the kill path's grace period is not spent waiting on
    /// an already-dead process.
    pub fn is_running(pid: i32) -> bool {
        match stat_fields(pid) {
            Some((_, state)) => state != 'Z',
            None => false,
        }
    }

    /// Resident set size of one process in MiB.
    pub fn rss_mib(pid: i32) -> Option<f64> {
        let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages as f64 * page_size as f64 / (1024.0 * 1024.0))
    }

    /// Resident memory of `pid` and all its recursive children in MiB.
    /// `None` only when the root process itself cannot be sampled.
    pub fn tree_rss_mib(pid: i32) -> Option<f64> {
        let mut total = rss_mib(pid)?;
        for child in descendants(pid) {
            // children can exit while we walk them
            if let Some(mib) = rss_mib(child) {
                total += mib;
            }
        }
        Some(total)
    }

    /// All recursive descendants of `pid`, discovered from a single scan
    /// of /proc. The snapshot races against fork/exit by nature; callers
    /// re-discover before escalating signals.
    pub fn descendants(pid: i32) -> Vec<i32> {
        let mut by_parent: HashMap<i32, Vec<i32>> = HashMap::new();
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };
        for entry in entries.flatten() {
            let Some(child) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some((ppid, _)) = stat_fields(child) {
                by_parent.entry(ppid).or_default().push(child);
            }
        }

        let mut found = Vec::new();
        let mut frontier = vec![pid];
        while let Some(next) = frontier.pop() {
            if let Some(children) = by_parent.get(&next) {
                for &child in children {
                    found.push(child);
                    frontier.push(child);
                }
            }
        }
        found
    }

    /// Parses (ppid, state) out of /proc/<pid>/stat. The comm field is
    /// parenthesised and may itself contain spaces, so parsing starts
    /// after the last ')'.
    fn stat_fields(pid: i32) -> Option<(i32, char)> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let rest = &stat[stat.rfind(')')? + 1..];
        let mut fields = rest.split_whitespace();
        let state = fields.next()?.chars().next()?;
        let ppid: i32 = fields.next()?.parse().ok()?;
        Some((ppid, state))
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    pub fn is_running(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    pub fn rss_mib(_pid: i32) -> Option<f64> {
        None
    }

    pub fn tree_rss_mib(_pid: i32) -> Option<f64> {
        None
    }

    pub fn descendants(_pid: i32) -> Vec<i32> {
        Vec::new()
    }
}
