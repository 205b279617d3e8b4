//! Per-process and system metrics collection.
//!
//! Reads `/proc/<pid>/statm` for resident set size and `/proc/<pid>/stat`
//! for accumulated CPU ticks. All functions here are lock-free and fallible
//! by returning `None`; the analytics task treats a missing sample for a pid
//! that also fails a liveness poll as a dead worker.

#[cfg(target_os = "linux")]
use std::fs;
use std::time::Instant;

/// One raw sample for a worker process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSample {
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// User + system CPU time, in clock ticks since process start.
    pub cpu_ticks: u64,
}

/// Rolled-up metrics stored on a process between collector runs.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMetrics {
    pub rss_bytes: u64,
    pub cpu_ticks: u64,
    /// CPU usage over the last collection interval, 0.0..=100.0 per core.
    pub cpu_percent: f64,
    pub sampled_at: Instant,
}

impl ProcessMetrics {
    /// Fold a fresh sample into the previous metrics, deriving the CPU
    /// percentage from the tick delta.
    pub fn update(previous: Option<&ProcessMetrics>, sample: ProcessSample, now: Instant) -> Self {
        let cpu_percent = match previous {
            Some(prev) if now > prev.sampled_at && sample.cpu_ticks >= prev.cpu_ticks => {
                let elapsed = now.duration_since(prev.sampled_at).as_secs_f64();
                let delta_secs = (sample.cpu_ticks - prev.cpu_ticks) as f64 / clock_ticks_per_sec();
                if elapsed > 0.0 {
                    (delta_secs / elapsed * 100.0).min(100.0 * num_cpus() as f64)
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
        ProcessMetrics {
            rss_bytes: sample.rss_bytes,
            cpu_ticks: sample.cpu_ticks,
            cpu_percent,
            sampled_at: now,
        }
    }
}

/// Read a metrics sample for `pid`. Returns `None` if the process is gone
/// or `/proc` is unavailable on this platform.
#[cfg(target_os = "linux")]
pub fn sample_process(pid: u32) -> Option<ProcessSample> {
    let rss_bytes = read_rss_bytes(pid)?;
    let cpu_ticks = read_cpu_ticks(pid)?;
    Some(ProcessSample { rss_bytes, cpu_ticks })
}

#[cfg(not(target_os = "linux"))]
pub fn sample_process(_pid: u32) -> Option<ProcessSample> {
    None
}

/// 1-, 5- and 15-minute system load averages.
#[cfg(target_os = "linux")]
pub fn load_average() -> Option<(f64, f64, f64)> {
    let contents = fs::read_to_string("/proc/loadavg").ok()?;
    let mut fields = contents.split_whitespace();
    let one = fields.next()?.parse().ok()?;
    let five = fields.next()?.parse().ok()?;
    let fifteen = fields.next()?.parse().ok()?;
    Some((one, five, fifteen))
}

#[cfg(not(target_os = "linux"))]
pub fn load_average() -> Option<(f64, f64, f64)> {
    None
}

// statm is a single space-delimited line; resident set size is the second
// field, in pages.
#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let rss_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * page_size())
}

// stat field 2 is the executable name in parentheses and may itself contain
// spaces and parentheses, so fields are counted from after the last ')'.
// utime and stime are fields 14 and 15 (1-based), i.e. 11 and 12 past comm.
#[cfg(target_os = "linux")]
fn read_cpu_ticks(pid: u32) -> Option<u64> {
    let contents = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = &contents[contents.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100.0
    } else {
        ticks as f64
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
