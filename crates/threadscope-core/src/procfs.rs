//! Linux procfs provider for the current process.
//!
//! Per-thread state comes from `/proc/self/task/<tid>/stat`, the wait channel
//! from `/proc/self/task/<tid>/wchan`, memory counters from
//! `/proc/self/status`. Everything is read from user space without
//! privileges.
//!
//! Linux reports a single `R` state for threads that are on a CPU and threads
//! that are queued for one, so attributed units are `running` or one of the
//! sleeping/blocked/terminated states, never `runnable`.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::provider::{RawStats, StatsProvider, hardware_parallelism};
use crate::snapshot::{UnitInfo, UnitState, unix_ms_now};

/// Reads thread and memory state of the current process from procfs.
pub struct ProcfsProvider {
    root: PathBuf,
    clk_tck: f64,
}

impl ProcfsProvider {
    /// Provider reading the live `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Provider reading a procfs-shaped tree rooted at `root`. Expects
    /// `<root>/uptime`, `<root>/self/status` and `<root>/self/task/*`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clk_tck: clk_tck(),
        }
    }

    /// Whether the task directory exists.
    pub fn is_available(&self) -> bool {
        self.task_dir().is_dir()
    }

    fn task_dir(&self) -> PathBuf {
        self.root.join("self").join("task")
    }

    fn uptime_secs(&self) -> Option<f64> {
        let raw = std::fs::read_to_string(self.root.join("uptime")).ok()?;
        raw.split_whitespace().next()?.parse().ok()
    }

    fn thread_ids(&self) -> Result<Vec<u64>, ProviderError> {
        let dir = self.task_dir();
        let entries = std::fs::read_dir(&dir).map_err(|source| ProviderError::Read {
            path: dir.display().to_string(),
            source,
        })?;
        let mut tids: Vec<u64> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        tids.sort_unstable();
        Ok(tids)
    }

    fn read_unit(&self, tid: u64, uptime: Option<f64>, now_ms: u64) -> Option<UnitInfo> {
        let dir = self.task_dir().join(tid.to_string());
        // Threads can exit between listing and reading; skip them.
        let raw = std::fs::read_to_string(dir.join("stat")).ok()?;
        let stat = parse_task_stat(&raw)?;
        let wchan = read_trimmed(&dir.join("wchan")).filter(|w| w != "0");

        let age_ms = match uptime {
            Some(up) => {
                let started = stat.start_ticks as f64 / self.clk_tck;
                ((up - started).max(0.0) * 1000.0) as u64
            }
            None => 0,
        };

        let location = match wchan {
            Some(w) => format!("{} @ {w}", stat.name),
            None => stat.name,
        };

        Some(UnitInfo {
            id: tid,
            state: map_state(stat.state),
            location,
            age_ms,
            created_at: now_ms.saturating_sub(age_ms),
        })
    }
}

impl Default for ProcfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsProvider for ProcfsProvider {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn capture(&self, max_units: usize) -> Result<RawStats, ProviderError> {
        let now_ms = unix_ms_now();
        let tids = self.thread_ids()?;
        let uptime = self.uptime_secs();

        let units: Vec<UnitInfo> = tids
            .iter()
            .filter_map(|&tid| self.read_unit(tid, uptime, now_ms))
            .take(max_units)
            .collect();

        let status_path = self.root.join("self").join("status");
        let status = std::fs::read_to_string(&status_path).map_err(|source| {
            ProviderError::Read {
                path: status_path.display().to_string(),
                source,
            }
        })?;

        Ok(RawStats {
            concurrency_count: tids.len(),
            hardware_parallelism: hardware_parallelism(),
            scheduler_parallelism: None,
            memory: Value::Object(parse_status_memory(&status)),
            units,
            units_approximate: false,
        })
    }
}

/// Fields of `/proc/<pid>/task/<tid>/stat` the provider needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaskStat {
    pub name: String,
    pub state: char,
    /// Start time in clock ticks after boot.
    pub start_ticks: u64,
}

/// Parse a task `stat` line. The name (field 2) sits in parens and may itself
/// contain spaces and parens, so the last `)` anchors the remaining fields.
pub(crate) fn parse_task_stat(raw: &str) -> Option<TaskStat> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = raw[open + 1..close].to_string();
    let fields: Vec<&str> = raw.get(close + 1..)?.split_whitespace().collect();
    // fields[0] is field 3 (state); starttime is field 22.
    let state = fields.first()?.chars().next()?;
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(TaskStat {
        name,
        state,
        start_ticks,
    })
}

pub(crate) fn map_state(code: char) -> UnitState {
    match code {
        'R' => UnitState::Running,
        'S' | 'I' => UnitState::Waiting,
        'D' | 'T' | 't' | 'W' | 'P' => UnitState::Blocked,
        'Z' | 'X' | 'x' => UnitState::Terminated,
        _ => UnitState::Waiting,
    }
}

/// Memory and context-switch counters from `/proc/<pid>/status`.
pub(crate) fn parse_status_memory(raw: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(value) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        let parsed = match key {
            "VmRSS" => Some(("rss_bytes", value * 1024)),
            "VmHWM" => Some(("rss_peak_bytes", value * 1024)),
            "VmSize" => Some(("vm_bytes", value * 1024)),
            "VmPeak" => Some(("vm_peak_bytes", value * 1024)),
            "VmData" => Some(("data_bytes", value * 1024)),
            "VmStk" => Some(("stack_bytes", value * 1024)),
            "RssAnon" => Some(("rss_anon_bytes", value * 1024)),
            "RssFile" => Some(("rss_file_bytes", value * 1024)),
            "VmSwap" => Some(("swap_bytes", value * 1024)),
            "voluntary_ctxt_switches" => Some(("voluntary_ctxt_switches", value)),
            "nonvoluntary_ctxt_switches" => Some(("nonvoluntary_ctxt_switches", value)),
            _ => None,
        };
        if let Some((name, v)) = parsed {
            out.insert(name.to_string(), Value::from(v));
        }
    }
    out
}

fn read_trimmed(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let v = raw.trim();
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

#[cfg(unix)]
fn clk_tck() -> f64 {
    // SAFETY: `sysconf` is thread-safe for this query and has no side effects.
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz > 0 { hz as f64 } else { 100.0 }
}

#[cfg(not(unix))]
fn clk_tck() -> f64 {
    100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const STAT: &str = "4242 (tokio-runtime-w) S 1 4242 4242 0 -1 4194368 10 0 0 0 \
                        3 1 0 0 20 0 9 0 1000 123456 789 18446744073709551615";

    #[test]
    fn parses_task_stat() {
        let s = parse_task_stat(STAT).unwrap();
        assert_eq!(s.name, "tokio-runtime-w");
        assert_eq!(s.state, 'S');
        assert_eq!(s.start_ticks, 1000);
    }

    #[test]
    fn parses_task_stat_with_parens_in_name() {
        let raw = STAT.replace("(tokio-runtime-w)", "(weird) (name)");
        let s = parse_task_stat(&raw).unwrap();
        assert_eq!(s.name, "weird) (name");
        assert_eq!(s.state, 'S');
        assert_eq!(s.start_ticks, 1000);
    }

    #[test]
    fn rejects_truncated_stat() {
        assert!(parse_task_stat("1 (x) R 0 0").is_none());
        assert!(parse_task_stat("garbage").is_none());
    }

    #[test]
    fn maps_linux_states() {
        assert_eq!(map_state('R'), UnitState::Running);
        assert_eq!(map_state('S'), UnitState::Waiting);
        assert_eq!(map_state('I'), UnitState::Waiting);
        assert_eq!(map_state('D'), UnitState::Blocked);
        assert_eq!(map_state('T'), UnitState::Blocked);
        assert_eq!(map_state('Z'), UnitState::Terminated);
        assert_eq!(map_state('X'), UnitState::Terminated);
    }

    #[test]
    fn parses_status_memory() {
        let raw = "Name:\tdemo\nVmPeak:\t  2048 kB\nVmRSS:\t  1024 kB\nThreads:\t3\n\
                   voluntary_ctxt_switches:\t17\n";
        let m = parse_status_memory(raw);
        assert_eq!(m["rss_bytes"], 1024 * 1024);
        assert_eq!(m["vm_peak_bytes"], 2048 * 1024);
        assert_eq!(m["voluntary_ctxt_switches"], 17);
        assert!(!m.contains_key("Threads"));
    }

    fn fake_proc(threads: &[(u64, &str, char)]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("uptime"), "500.00 1000.00\n").unwrap();
        let task = root.path().join("self").join("task");
        fs::create_dir_all(&task).unwrap();
        fs::write(
            root.path().join("self").join("status"),
            "VmRSS:\t 4096 kB\nVmSize:\t 8192 kB\n",
        )
        .unwrap();
        for (tid, name, state) in threads {
            let dir = task.join(tid.to_string());
            fs::create_dir_all(&dir).unwrap();
            let stat = STAT
                .replace("tokio-runtime-w", name)
                .replace(" S 1 ", &format!(" {state} 1 "));
            fs::write(dir.join("stat"), stat).unwrap();
            fs::write(dir.join("wchan"), if *state == 'S' { "ep_poll" } else { "0" }).unwrap();
        }
        root
    }

    #[test]
    fn captures_fake_tree() {
        let root = fake_proc(&[(12, "worker", 'S'), (10, "main", 'R'), (11, "io", 'D')]);
        let p = ProcfsProvider::with_root(root.path());
        assert!(p.is_available());

        let raw = p.capture(50).unwrap();
        assert_eq!(raw.concurrency_count, 3);
        assert!(!raw.units_approximate);
        let ids: Vec<u64> = raw.units.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert_eq!(raw.units[0].state, UnitState::Running);
        assert_eq!(raw.units[0].location, "main");
        assert_eq!(raw.units[1].state, UnitState::Blocked);
        assert_eq!(raw.units[2].location, "worker @ ep_poll");
        assert_eq!(raw.memory["rss_bytes"], 4096 * 1024);

        // started at tick 1000, uptime 500s
        let expected_age = ((500.0 - 1000.0 / p.clk_tck).max(0.0) * 1000.0) as u64;
        assert_eq!(raw.units[0].age_ms, expected_age);
        assert!(raw.units[0].created_at <= unix_ms_now());
    }

    #[test]
    fn caps_units_but_not_count() {
        let root = fake_proc(&[(1, "a", 'S'), (2, "b", 'S'), (3, "c", 'S')]);
        let raw = ProcfsProvider::with_root(root.path()).capture(2).unwrap();
        assert_eq!(raw.concurrency_count, 3);
        assert_eq!(raw.units.len(), 2);
    }

    #[test]
    fn skips_threads_that_vanished() {
        let root = fake_proc(&[(1, "a", 'S'), (2, "b", 'S')]);
        fs::remove_file(root.path().join("self/task/2/stat")).unwrap();
        let raw = ProcfsProvider::with_root(root.path()).capture(50).unwrap();
        assert_eq!(raw.concurrency_count, 2);
        assert_eq!(raw.units.len(), 1);
    }

    #[test]
    fn missing_task_dir_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let p = ProcfsProvider::with_root(root.path());
        assert!(!p.is_available());
        assert!(matches!(p.capture(10), Err(ProviderError::Read { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn live_proc_counts_this_process() {
        let p = ProcfsProvider::new();
        let raw = p.capture(50).unwrap();
        assert!(raw.concurrency_count >= 1);
        assert!(!raw.units.is_empty());
        assert!(raw.memory.get("rss_bytes").is_some());
    }
}
