// NEOX DAEMON
// WIRES THE LINUX BACKENDS INTO THE GOVERNOR: DISCOVER, START, MONITOR, STOP

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use neox::event::DecisionLog;
use neox::governor::{Capabilities, Governor, Host};
use neox::host::{FrequencyDriver, Policy};
use neox::surface::{ConfigSurface, DirSurface, NullSurface};
use neox::sysfs::{self, JiffyClock, ProcStatCounters, SysfsDriver};

use crate::RunOpts;

pub struct Daemon {
    gov: Governor,
    driver: Arc<SysfsDriver>,
    surface: Option<Arc<DirSurface>>,
    policies: Vec<Policy>,
    started: Vec<Policy>,
    verbose: bool,
}

impl Daemon {
    pub fn init(opts: &RunOpts) -> Result<Self> {
        let nr_cpus = sysfs::configured_cpus();
        let driver = Arc::new(SysfsDriver::new(opts.dry_run));
        let policies = driver.discover_policies(nr_cpus);
        if policies.is_empty() {
            bail!("no cpufreq policies under {}", sysfs::CPU_SYSFS);
        }

        if !opts.dry_run {
            for p in &policies {
                let path = format!("{}/cpu{}/cpufreq/scaling_governor", sysfs::CPU_SYSFS, p.cpu);
                let current = std::fs::read_to_string(&path).unwrap_or_default();
                if current.trim() != "userspace" {
                    warn!("policy {}: scaling_governor is {:?}, frequency writes will fail \
                           (echo userspace > {})", p.cpu, current.trim(), path);
                }
            }
        }

        let surface = opts.tunables_dir.as_ref().map(|d| Arc::new(DirSurface::new(d)));
        let dyn_surface: Arc<dyn ConfigSurface> = match &surface {
            Some(s) => s.clone() as Arc<dyn ConfigSurface>,
            None => Arc::new(NullSurface),
        };

        let host = Host {
            counters: Arc::new(ProcStatCounters::new()),
            driver: driver.clone(),
            clock: Arc::new(JiffyClock::new(opts.hz)),
        };
        let caps = Capabilities { early_suspend: false, at_limit_guards: !opts.no_limit_guards };
        let gov = Governor::new(nr_cpus, host, dyn_surface, caps);

        let mut daemon = Self {
            gov,
            driver,
            surface,
            policies,
            started: Vec::new(),
            verbose: opts.verbose,
        };
        for p in daemon.policies.clone() {
            daemon
                .gov
                .on_start(&p)
                .with_context(|| format!("starting policy {}", p.cpu))?;
            daemon.started.push(p);
        }

        // AFTER THE FIRST ACTIVATION: IT RESETS sampling_rate
        daemon.apply_tunables(opts)?;
        daemon.sync_surface();
        Ok(daemon)
    }

    fn apply_tunables(&self, opts: &RunOpts) -> Result<()> {
        let requested = [
            ("sampling_rate", opts.sampling_rate),
            ("up_threshold", opts.up_threshold),
            ("down_differential", opts.down_differential),
            ("sampling_down_factor", opts.sampling_down_factor),
            ("ignore_nice_load", opts.ignore_nice.then_some(1)),
            ("freq_step", opts.freq_step),
            ("up_threshold_at_min_freq", opts.up_threshold_at_min_freq),
            ("freq_for_responsiveness", opts.freq_for_responsiveness),
        ];
        for (name, value) in requested {
            if let Some(v) = value {
                self.gov
                    .store(name, &v.to_string())
                    .with_context(|| format!("--{}", name.replace('_', "-")))?;
            }
        }
        Ok(())
    }

    pub fn nr_cpus(&self) -> usize {
        self.gov.nr_cpus()
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub fn decision_log(&self) -> MutexGuard<'_, DecisionLog> {
        self.gov.decision_log()
    }

    fn sync_surface(&self) {
        if let Some(s) = &self.surface {
            let applied = s.sync(&self.gov);
            if applied > 0 {
                info!("{} tunable edit(s) applied from {}", applied, s.dir().display());
            }
        }
    }

    // RE-READ EACH POLICY'S LIMITS; DELIVER A LIMITS CHANGE WHEN THEY MOVED
    fn check_limits(&mut self) {
        for known in self.started.iter_mut() {
            let fresh = match self.driver.policy(known.cpu) {
                Ok(p) => p,
                Err(e) => {
                    warn!("policy {}: {}", known.cpu, e);
                    continue;
                }
            };
            if fresh.min == known.min && fresh.max == known.max {
                continue;
            }
            info!("policy {}: limits [{}, {}] -> [{}, {}] kHz",
                  known.cpu, known.min, known.max, fresh.min, fresh.max);
            if let Err(e) = self.gov.on_limits_changed(&fresh) {
                warn!("policy {}: limits change: {}", known.cpu, e);
            }
            *known = fresh;
        }
    }

    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut prev = self.gov.decision_log().totals();

        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_secs(1));

            self.sync_surface();
            self.check_limits();

            if self.verbose {
                let totals = self.gov.decision_log().totals();
                let t = self.gov.tunables();
                let curs: Vec<String> = self
                    .started
                    .iter()
                    .map(|p| match self.driver.policy(p.cpu) {
                        Ok(fresh) => format!("{}:{}", p.cpu, fresh.cur),
                        Err(_) => format!("{}:?", p.cpu),
                    })
                    .collect();
                println!("raises/s: {:<5} lowers/s: {:<5} limits/s: {:<4} errors/s: {:<4} rate: {:<7} up: {:<3} cur_khz: {}",
                    totals.0 - prev.0, totals.1 - prev.1, totals.2 - prev.2, totals.3 - prev.3,
                    t.sampling_rate_us, t.up_threshold, curs.join(" "));
                prev = totals;
            }
        }
        Ok(())
    }

    // SYNCHRONOUS: EVERY WORKER HAS EXITED WHEN THIS RETURNS
    pub fn stop(&mut self) {
        for p in self.started.drain(..) {
            self.gov.on_stop(&p);
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}
