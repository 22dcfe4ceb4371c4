// NEOX LINUX BACKENDS
// /proc/stat COUNTER SOURCE, cpufreq SYSFS DRIVER, MONOTONIC JIFFY CLOCK.
//
// THE DRIVER WRITES scaling_setspeed, WHICH ONLY EXISTS UNDER THE
// `userspace` cpufreq GOVERNOR. --dry-run LOGS THE REQUEST INSTEAD.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::{debug, info};
use regex::Regex;

use crate::error::DriverError;
use crate::event::now_ns;
use crate::host::{Clock, CounterSource, FrequencyDriver, Policy, Relation};

pub const PROC_STAT: &str = "/proc/stat";
pub const CPU_SYSFS: &str = "/sys/devices/system/cpu";

// --- /proc/stat ---

// ONE PER-CPU LINE, IN USER_HZ TICKS
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuTimes {
    // idle + iowait
    pub idle: u64,
    pub nice: u64,
    // USER..STEAL. GUEST TIME IS ALREADY INSIDE USER/NICE
    pub total: u64,
}

fn cpu_line() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^cpu(\d+)\s+(.*)$").ok()).as_ref()
}

// PER-CPU LINES ONLY; THE AGGREGATE "cpu " LINE IS SKIPPED
pub fn parse_proc_stat(raw: &str) -> Vec<(usize, CpuTimes)> {
    let mut cpus = Vec::new();
    let re = match cpu_line() {
        Some(re) => re,
        None => return cpus,
    };
    for line in raw.lines() {
        let caps = match re.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let cpu: usize = match caps[1].parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let fields: Vec<u64> = caps[2]
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect();
        if fields.len() < 4 {
            continue;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        cpus.push((cpu, CpuTimes { idle, nice: fields[1], total: fields.iter().take(8).sum() }));
    }
    cpus
}

pub fn ticks_to_us(ticks: u64, user_hz: u64) -> u64 {
    ticks.saturating_mul(1_000_000) / user_hz.max(1)
}

pub struct ProcStatCounters {
    path: PathBuf,
    user_hz: u64,
}

impl ProcStatCounters {
    pub fn new() -> Self {
        Self::with_path(PROC_STAT)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let user_hz = if ticks > 0 { ticks as u64 } else { 100 };
        Self { path: path.into(), user_hz }
    }

    // OFFLINE OR UNKNOWN CPU READS AS ZERO: THE SAMPLER SKIPS IT AS AN ANOMALY
    fn times(&self, cpu: usize) -> CpuTimes {
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        parse_proc_stat(&raw)
            .into_iter()
            .find(|(n, _)| *n == cpu)
            .map(|(_, t)| t)
            .unwrap_or_default()
    }
}

impl Default for ProcStatCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for ProcStatCounters {
    fn read_idle_and_wall(&self, cpu: usize) -> (u64, u64) {
        let t = self.times(cpu);
        (ticks_to_us(t.idle, self.user_hz), ticks_to_us(t.total, self.user_hz))
    }

    fn read_nice_us(&self, cpu: usize) -> u64 {
        ticks_to_us(self.times(cpu).nice, self.user_hz)
    }

    fn online_cpus(&self) -> usize {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 { n as usize } else { 1 }
    }
}

pub fn configured_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 { n as usize } else { 1 }
}

// --- cpufreq ---

// "0-3,5" OR "0 1 2 3"
pub fn parse_cpu_list(raw: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for range in raw.trim().split(|c: char| c == ',' || c.is_whitespace()) {
        let parts: Vec<&str> = range.split('-').collect();
        match parts.len() {
            1 => {
                if let Ok(n) = parts[0].parse::<usize>() {
                    cpus.push(n);
                }
            }
            2 => {
                if let (Ok(lo), Ok(hi)) = (parts[0].parse::<usize>(), parts[1].parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            _ => {}
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}

// AT_LEAST: LOWEST TABLE ENTRY >= TARGET. AT_MOST: HIGHEST <= TARGET.
// NO MATCHING ENTRY FALLS BACK TO THE NEAREST END OF THE TABLE. AN EMPTY
// TABLE PASSES THE TARGET THROUGH. THE RESULT IS ALWAYS CLAMPED TO [min, max].
pub fn resolve_frequency(avail: &[u32], target: u32, relation: Relation, min: u32, max: u32) -> u32 {
    let mut table: Vec<u32> = avail.iter().copied().filter(|&f| f >= min && f <= max).collect();
    table.sort_unstable();
    let picked = match relation {
        Relation::AtLeast => table.iter().copied().find(|&f| f >= target).or(table.last().copied()),
        Relation::AtMost => table.iter().rev().copied().find(|&f| f <= target).or(table.first().copied()),
    };
    picked.unwrap_or(target).clamp(min.min(max), max)
}

pub struct SysfsDriver {
    root: PathBuf,
    dry_run: bool,
}

impl SysfsDriver {
    pub fn new(dry_run: bool) -> Self {
        Self::with_root(CPU_SYSFS, dry_run)
    }

    pub fn with_root(root: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self { root: root.into(), dry_run }
    }

    fn cpufreq_dir(&self, cpu: usize) -> PathBuf {
        self.root.join(format!("cpu{}", cpu)).join("cpufreq")
    }

    fn read_khz(dir: &Path, name: &str) -> Result<u32, DriverError> {
        let path = dir.join(name);
        let raw = fs::read_to_string(&path)
            .map_err(|e| DriverError::Io(format!("{}: {}", path.display(), e)))?;
        raw.trim()
            .parse()
            .map_err(|_| DriverError::Io(format!("{}: bad value {:?}", path.display(), raw.trim())))
    }

    fn available(dir: &Path) -> Vec<u32> {
        fs::read_to_string(dir.join("scaling_available_frequencies"))
            .map(|raw| raw.split_whitespace().filter_map(|s| s.parse().ok()).collect())
            .unwrap_or_default()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // ONE POLICY PER DISTINCT OWNER (LOWEST CPU OF affected_cpus)
    pub fn discover_policies(&self, nr_cpus: usize) -> Vec<Policy> {
        let mut policies: Vec<Policy> = Vec::new();
        for cpu in 0..nr_cpus {
            if policies.iter().any(|p| p.cpus.contains(&cpu)) {
                continue;
            }
            match self.policy(cpu) {
                Ok(p) if p.cpu == cpu => policies.push(p),
                Ok(_) => {}
                Err(e) => debug!("cpu {}: {}", cpu, e),
            }
        }
        policies
    }
}

impl FrequencyDriver for SysfsDriver {
    fn policy(&self, cpu: usize) -> Result<Policy, DriverError> {
        let dir = self.cpufreq_dir(cpu);
        if !dir.exists() {
            return Err(DriverError::Unavailable(cpu));
        }
        let mut cpus = fs::read_to_string(dir.join("affected_cpus"))
            .map(|raw| parse_cpu_list(&raw))
            .unwrap_or_default();
        if cpus.is_empty() {
            cpus.push(cpu);
        }
        Ok(Policy {
            cpu: cpus[0],
            cur: Self::read_khz(&dir, "scaling_cur_freq")?,
            min: Self::read_khz(&dir, "scaling_min_freq")?,
            max: Self::read_khz(&dir, "scaling_max_freq")?,
            cpuinfo_max_freq: Self::read_khz(&dir, "cpuinfo_max_freq")?,
            cpus,
        })
    }

    fn set_frequency(&self, policy: &Policy, target: u32, relation: Relation) -> Result<(), DriverError> {
        let dir = self.cpufreq_dir(policy.cpu);
        let khz = resolve_frequency(&Self::available(&dir), target, relation, policy.min, policy.max);
        if self.dry_run {
            info!("dry-run: cpu {} {} {} kHz -> {} kHz", policy.cpu, relation.label(), target, khz);
            return Ok(());
        }
        let path = dir.join("scaling_setspeed");
        fs::write(&path, format!("{}\n", khz)).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => DriverError::Rejected { cpu: policy.cpu, target: khz },
            _ => DriverError::Io(format!("{}: {}", path.display(), e)),
        })
    }

    fn average_effective_frequency(&self, _policy: &Policy, _cpu: usize) -> i64 {
        0
    }
}

// --- CLOCK ---

// ABOVE THIS A TICK ROUNDS TOWARD ZERO AND WORKERS SPIN
pub const MAX_HZ: u32 = 10_000;

pub struct JiffyClock {
    hz: u32,
}

impl JiffyClock {
    pub fn new(hz: u32) -> Self {
        Self { hz: hz.clamp(1, MAX_HZ) }
    }
}

impl Clock for JiffyClock {
    fn jiffies(&self) -> u64 {
        (u128::from(now_ns()) * u128::from(self.hz) / 1_000_000_000) as u64
    }

    fn hz(&self) -> u32 {
        self.hz
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  100 20 30 400 50 0 0 0 0 0
cpu0 10 2 3 40 5 0 1 0 0 0
cpu1 90 18 27 360 45 0 0 0 0 0
intr 12345
ctxt 999
";

    #[test]
    fn proc_stat_skips_aggregate_line() {
        let cpus = parse_proc_stat(STAT);
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0], (0, CpuTimes { idle: 45, nice: 2, total: 61 }));
        assert_eq!(cpus[1].0, 1);
        assert_eq!(cpus[1].1.idle, 405);
    }

    #[test]
    fn proc_stat_ignores_short_lines() {
        assert!(parse_proc_stat("cpu0 1 2 3\n").is_empty());
    }

    #[test]
    fn guest_time_not_counted_twice() {
        // 400 GUEST TICKS ARE PART OF THE 500 USER TICKS
        let cpus = parse_proc_stat("cpu0 500 0 0 500 0 0 0 0 400 0\n");
        assert_eq!(cpus, vec![(0, CpuTimes { idle: 500, nice: 0, total: 1000 })]);
        let t = cpus[0].1;
        assert_eq!(100 * (t.total - t.idle) / t.total, 50);
    }

    #[test]
    fn ticks_convert_to_micros() {
        assert_eq!(ticks_to_us(3, 100), 30_000);
        assert_eq!(ticks_to_us(1, 0), 1_000_000);
    }

    #[test]
    fn cpu_list_formats() {
        assert_eq!(parse_cpu_list("0-3,5\n"), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("2 0 1\n"), vec![0, 1, 2]);
        assert!(parse_cpu_list("\n").is_empty());
    }

    #[test]
    fn resolve_against_table() {
        let avail = [200_000, 400_000, 800_000, 1_000_000];
        assert_eq!(resolve_frequency(&avail, 570_000, Relation::AtLeast, 200_000, 1_000_000), 800_000);
        assert_eq!(resolve_frequency(&avail, 570_000, Relation::AtMost, 200_000, 1_000_000), 400_000);
        assert_eq!(resolve_frequency(&avail, 100_000, Relation::AtMost, 200_000, 1_000_000), 200_000);
        // TABLE ENTRIES OUTSIDE THE POLICY LIMITS ARE NEVER PICKED
        assert_eq!(resolve_frequency(&avail, 900_000, Relation::AtLeast, 200_000, 800_000), 800_000);
    }

    #[test]
    fn resolve_without_table_clamps() {
        assert_eq!(resolve_frequency(&[], 1_500_000, Relation::AtLeast, 100_000, 1_000_000), 1_000_000);
        assert_eq!(resolve_frequency(&[], 50_000, Relation::AtMost, 100_000, 1_000_000), 100_000);
        assert_eq!(resolve_frequency(&[], 333_000, Relation::AtMost, 100_000, 1_000_000), 333_000);
    }

    fn fake_cpufreq(root: &Path, cpu: usize, affected: &str) {
        let dir = root.join(format!("cpu{}", cpu)).join("cpufreq");
        fs::create_dir_all(&dir).unwrap();
        for (name, v) in [
            ("scaling_cur_freq", "800000"),
            ("scaling_min_freq", "200000"),
            ("scaling_max_freq", "1000000"),
            ("cpuinfo_max_freq", "1200000"),
            ("affected_cpus", affected),
            ("scaling_available_frequencies", "200000 400000 800000 1000000"),
            ("scaling_setspeed", "<unsupported>"),
        ] {
            fs::write(dir.join(name), format!("{}\n", v)).unwrap();
        }
    }

    #[test]
    fn sysfs_policy_and_setspeed() {
        let root = std::env::temp_dir().join(format!("neox-sysfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fake_cpufreq(&root, 0, "0 1");
        fake_cpufreq(&root, 1, "0 1");
        fake_cpufreq(&root, 2, "2");

        let drv = SysfsDriver::with_root(&root, false);
        let p = drv.policy(1).expect("policy");
        assert_eq!((p.cpu, p.cur, p.min, p.max, p.cpuinfo_max_freq), (0, 800_000, 200_000, 1_000_000, 1_200_000));
        assert_eq!(p.cpus, vec![0, 1]);
        assert_eq!(drv.policy(7), Err(DriverError::Unavailable(7)));

        let owners: Vec<usize> = drv.discover_policies(4).iter().map(|p| p.cpu).collect();
        assert_eq!(owners, vec![0, 2]);

        drv.set_frequency(&p, 570_000, Relation::AtLeast).expect("write");
        let written = fs::read_to_string(root.join("cpu0/cpufreq/scaling_setspeed")).unwrap();
        assert_eq!(written.trim(), "800000");

        // DRY RUN LEAVES THE FILE ALONE
        let dry = SysfsDriver::with_root(&root, true);
        dry.set_frequency(&p, 100_000, Relation::AtMost).expect("dry");
        let written = fs::read_to_string(root.join("cpu0/cpufreq/scaling_setspeed")).unwrap();
        assert_eq!(written.trim(), "800000");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn jiffy_clock_advances() {
        let c = JiffyClock::new(1000);
        let a = c.jiffies();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(c.jiffies() >= a + 4);
        assert_eq!(c.tick_duration(), std::time::Duration::from_millis(1));
    }

    #[test]
    fn jiffy_clock_rate_is_bounded() {
        let c = JiffyClock::new(u32::MAX);
        assert_eq!(c.hz(), MAX_HZ);
        assert_eq!(c.tick_duration(), std::time::Duration::from_micros(100));
        assert_eq!(JiffyClock::new(0).hz(), 1);
    }

    #[test]
    #[ignore]
    fn live_proc_stat_smoke() {
        let src = ProcStatCounters::new();
        let (idle, wall) = src.read_idle_and_wall(0);
        assert!(wall > 0);
        assert!(idle <= wall);
        assert!(src.online_cpus() >= 1);
    }
}
