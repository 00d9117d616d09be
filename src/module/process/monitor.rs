//! Instance resource monitoring
//!
//! Samples per-process CPU ticks and memory figures from procfs. CPU
//! percentages are deltas against the total system CPU ticks, which are read
//! once per control-loop tick so every instance is measured against the same
//! interval.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::module::traits::ModuleError;

/// Latest resource sample of an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// User-mode CPU share of the last interval, in percent
    pub cpu_user_percent: f64,
    /// Kernel-mode CPU share of the last interval, in percent
    pub cpu_kernel_percent: f64,
    /// Virtual memory size in bytes
    pub mem_vms_bytes: u64,
    /// Resident set size in kB
    pub mem_rss_kb: u64,
    #[serde(skip)]
    pub last_utime: Option<u64>,
    #[serde(skip)]
    pub last_stime: Option<u64>,
}

/// Fields of interest from `/proc/<pid>/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub utime: u64,
    pub stime: u64,
    pub vsize: u64,
}

/// Parse `/proc/<pid>/stat`
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`.
pub fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state)
    let field = |n: usize| fields.get(n - 3).and_then(|s| s.parse::<u64>().ok());
    Some(ProcStat {
        utime: field(14)?,
        stime: field(15)?,
        vsize: field(23)?,
    })
}

/// `VmRSS` from `/proc/<pid>/status`, in kB
pub fn parse_vm_rss_kb(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

/// Sum of all columns of the aggregate `cpu` line of `/proc/stat`
pub fn parse_total_cpu_ticks(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let mut total = 0u64;
    for value in line.split_whitespace().skip(1) {
        total = total.saturating_add(value.parse::<u64>().ok()?);
    }
    Some(total)
}

/// Procfs reader keeping the previous system-wide CPU total
#[derive(Debug)]
pub struct ResourceMonitor {
    proc_root: PathBuf,
    last_total_ticks: Option<u64>,
    interval_ticks: Option<u64>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_proc_root("/proc")
    }

    /// Read from another procfs mount (or a fake tree in tests)
    pub fn with_proc_root<P: AsRef<Path>>(proc_root: P) -> Self {
        Self {
            proc_root: proc_root.as_ref().to_path_buf(),
            last_total_ticks: None,
            interval_ticks: None,
        }
    }

    /// Measure the system CPU total for this tick
    ///
    /// Returns the number of ticks elapsed since the previous call, if known.
    pub fn begin_tick(&mut self) -> Option<u64> {
        let total = std::fs::read_to_string(self.proc_root.join("stat"))
            .ok()
            .and_then(|c| parse_total_cpu_ticks(&c));

        self.interval_ticks = match (self.last_total_ticks, total) {
            (Some(last), Some(now)) if now > last => Some(now - last),
            _ => None,
        };
        if total.is_some() {
            self.last_total_ticks = total;
        }
        self.interval_ticks
    }

    /// Refresh `usage` for the process `pid`
    pub fn sample(&self, pid: u32, usage: &mut ResourceUsage) -> Result<(), ModuleError> {
        let pid_dir = self.proc_root.join(pid.to_string());

        let stat_content = std::fs::read_to_string(pid_dir.join("stat"))?;
        let stat = parse_proc_stat(&stat_content).ok_or_else(|| {
            ModuleError::Io(format!("unexpected format of {}/stat", pid_dir.display()))
        })?;

        if let Some(interval) = self.interval_ticks {
            if let (Some(last_u), Some(last_s)) = (usage.last_utime, usage.last_stime) {
                usage.cpu_user_percent =
                    100.0 * stat.utime.saturating_sub(last_u) as f64 / interval as f64;
                usage.cpu_kernel_percent =
                    100.0 * stat.stime.saturating_sub(last_s) as f64 / interval as f64;
            }
        }
        usage.last_utime = Some(stat.utime);
        usage.last_stime = Some(stat.stime);
        usage.mem_vms_bytes = stat.vsize;

        match std::fs::read_to_string(pid_dir.join("status")) {
            Ok(status) => {
                if let Some(rss) = parse_vm_rss_kb(&status) {
                    usage.mem_rss_kb = rss;
                }
            }
            Err(e) => debug!("Cannot read status of process {}: {}", pid, e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "1234 (my (odd) mod) S 1 1234 1234 0 -1 4194560 100 0 0 0 \
                        40 20 0 0 20 0 1 0 500 1048576 256 18446744073709551615";

    #[test]
    fn test_parse_proc_stat_handles_parentheses() {
        let stat = parse_proc_stat(STAT).unwrap();
        assert_eq!(stat.utime, 40);
        assert_eq!(stat.stime, 20);
        assert_eq!(stat.vsize, 1048576);
        assert!(parse_proc_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_status_and_total() {
        let status = "Name:\tx\nVmPeak:\t 9000 kB\nVmRSS:\t    1234 kB\n";
        assert_eq!(parse_vm_rss_kb(status), Some(1234));
        let stat = "cpu  10 0 5 80 5 0 0 0 0 0\ncpu0 10 0 5 80 5 0 0 0 0 0\n";
        assert_eq!(parse_total_cpu_ticks(stat), Some(100));
    }

    #[test]
    fn test_sample_computes_deltas() {
        let root = tempfile::tempdir().unwrap();
        let pid_dir = root.path().join("1234");
        std::fs::create_dir_all(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("status"), "VmRSS:\t512 kB\n").unwrap();

        let mut monitor = ResourceMonitor::with_proc_root(root.path());
        let mut usage = ResourceUsage::default();

        std::fs::write(root.path().join("stat"), "cpu  100 0 100 800 0 0 0 0 0 0\n").unwrap();
        std::fs::write(pid_dir.join("stat"), STAT).unwrap();
        assert_eq!(monitor.begin_tick(), None);
        monitor.sample(1234, &mut usage).unwrap();
        assert_eq!(usage.cpu_user_percent, 0.0);
        assert_eq!(usage.mem_rss_kb, 512);

        // 200 system ticks later the process used 50 user and 10 kernel ticks
        std::fs::write(root.path().join("stat"), "cpu  200 0 200 800 0 0 0 0 0 0\n").unwrap();
        std::fs::write(pid_dir.join("stat"), STAT.replace(" 40 20 ", " 90 30 ")).unwrap();
        assert_eq!(monitor.begin_tick(), Some(200));
        monitor.sample(1234, &mut usage).unwrap();
        assert_eq!(usage.cpu_user_percent, 25.0);
        assert_eq!(usage.cpu_kernel_percent, 5.0);
    }

    #[test]
    fn test_sample_missing_process_fails() {
        let root = tempfile::tempdir().unwrap();
        let monitor = ResourceMonitor::with_proc_root(root.path());
        let mut usage = ResourceUsage::default();
        assert!(monitor.sample(99, &mut usage).is_err());
    }
}
