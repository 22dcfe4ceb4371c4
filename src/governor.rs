// NEOX GOVERNOR
// LIFECYCLE STATE MACHINE + SAMPLING CYCLE BODY
//
// PER CPU: INACTIVE -> ACTIVE -> INACTIVE, WITH ACTIVE -> RECONFIGURING ->
// ACTIVE ON LIMIT CHANGES. EVENTS ARRIVE ONE AT A TIME PER POLICY,
// CONCURRENTLY ACROSS POLICIES.
//
// TWO LOCK SCOPES:
//   PER-CPU   (timer::CpuTable) -- SAMPLE STATE, RATE MULTIPLIER, WORKER.
//             HELD BY A RUNNING CYCLE AND BY A LIMITS CHANGE.
//   ACTIVATION (GLOBAL)          -- ACTIVE COUNT, SURFACE INSTALL/REMOVE.
//             HELD BRIEFLY, NEVER ACROSS A CYCLE, NEVER TAKEN UNDER A
//             PER-CPU LOCK.
// A CYCLE HOLDS ITS OWNER'S LOCK AND TAKES EACH MEMBER CPU'S LOCK IN
// TURN. POLICIES PARTITION THE CPUS, SO OWNER -> MEMBER IS THE ONLY ORDER.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, trace, warn};

use crate::engine::{self, Action, Decision};
use crate::error::{invalid, DriverError, GovernorError};
use crate::event::DecisionLog;
use crate::host::{Clock, CounterSource, FrequencyDriver, Policy, Relation};
use crate::sampler::{self, Reading, SampleOutcome};
use crate::surface::ConfigSurface;
use crate::timer::{self, CpuState, CpuTable, Worker};
use crate::tuning::{SavedProfile, Tunables, TunablesSnapshot};

// CONFIGURATION-SURFACE ATTRIBUTES, IN DISPLAY ORDER
pub const ATTRIBUTES: [&str; 10] = [
    "sampling_rate_min",
    "sampling_rate",
    "up_threshold",
    "sampling_down_factor",
    "ignore_nice_load",
    "down_differential",
    "freq_step",
    "up_threshold_at_min_freq",
    "freq_for_responsiveness",
    "cpucore_table",
];

// FIXED AT CONSTRUCTION
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    // ACCEPT EARLY-SUSPEND / LATE-RESUME PROFILE SWAPS
    pub early_suspend: bool,
    // cur == max SKIPS THE RAISE REQUEST, cur == min SKIPS LOWERING
    pub at_limit_guards: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { early_suspend: false, at_limit_guards: true }
    }
}

pub struct Host {
    pub counters: Arc<dyn CounterSource>,
    pub driver: Arc<dyn FrequencyDriver>,
    pub clock: Arc<dyn Clock>,
}

struct Activation {
    active: u32,
}

struct Inner {
    host: Host,
    surface: Arc<dyn ConfigSurface>,
    caps: Capabilities,
    tunables: Tunables,
    cpus: CpuTable,
    activation: Mutex<Activation>,
    suspend: Mutex<Option<SavedProfile>>,
    log: Mutex<DecisionLog>,
}

pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    pub fn new(nr_cpus: usize, host: Host, surface: Arc<dyn ConfigSurface>, caps: Capabilities) -> Self {
        Self {
            inner: Arc::new(Inner {
                host,
                surface,
                caps,
                tunables: Tunables::new(),
                cpus: CpuTable::new(nr_cpus),
                activation: Mutex::new(Activation { active: 0 }),
                suspend: Mutex::new(None),
                log: Mutex::new(DecisionLog::new()),
            }),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.inner.cpus.len()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps
    }

    pub fn tunables(&self) -> TunablesSnapshot {
        self.inner.tunables.snapshot()
    }

    pub fn active_count(&self) -> u32 {
        lock(&self.inner.activation).active
    }

    pub fn is_active(&self, cpu: usize) -> bool {
        cpu < self.nr_cpus() && self.inner.cpus.lock(cpu).active
    }

    pub fn rate_multiplier(&self, cpu: usize) -> Option<u32> {
        (cpu < self.nr_cpus()).then(|| self.inner.cpus.lock(cpu).rate_mult)
    }

    pub fn deadline(&self, cpu: usize) -> Option<u64> {
        if cpu < self.nr_cpus() {
            self.inner.cpus.lock(cpu).deadline
        } else {
            None
        }
    }

    pub fn decision_log(&self) -> MutexGuard<'_, DecisionLog> {
        lock(&self.inner.log)
    }

    // --- LIFECYCLE ---

    pub fn on_start(&self, policy: &Policy) -> Result<(), GovernorError> {
        let inner = &self.inner;
        if policy.cur == 0 {
            return Err(invalid(format!("policy for cpu {} reports zero frequency", policy.cpu)));
        }
        inner.check_policy_cpus(policy)?;
        if inner.cpus.lock(policy.cpu).active {
            return Err(invalid(format!("cpu {} already active", policy.cpu)));
        }

        {
            let mut act = lock(&inner.activation);
            act.active += 1;
            if act.active == 1 {
                // FIRST ACTIVATION WINS; LATER ONES INHERIT
                let (rate, floor) = inner.tunables.reset_sampling();
                if let Err(e) = inner.surface.install(&self.attribute_values()) {
                    inner.tunables.restore_sampling(rate, floor);
                    act.active -= 1;
                    return Err(GovernorError::Resource(format!("configuration surface: {}", e)));
                }
                info!("configuration surface installed");
            }

            let ignore_nice = inner.tunables.ignore_nice();
            for &j in &policy.cpus {
                let mut s = inner.cpus.lock(j);
                let reading = inner.read_counters(j, ignore_nice);
                s.policy = Some(policy.clone());
                s.sample.baseline(&reading);
            }
            inner.cpus.lock(policy.cpu).rate_mult = 1;
        }

        // ARM THE OWNER'S WORKER. THE FIRST CYCLE IS ONE INTERVAL OUT.
        let clock = &inner.host.clock;
        let now = clock.jiffies();
        let delay = timer::cycle_delay(
            inner.tunables.sampling_rate_us(),
            1,
            clock.hz(),
            now,
            inner.host.counters.online_cpus(),
        );
        let weak = Arc::downgrade(&self.inner);
        let owner = policy.cpu;

        let mut s = inner.cpus.lock(owner);
        let worker = Worker::spawn(owner, clock.tick_duration() * delay as u32, move || {
            cycle_from_worker(&weak, owner)
        });
        match worker {
            Ok(w) => {
                s.active = true;
                s.deadline = Some(now + delay);
                s.arm(w);
            }
            Err(e) => {
                drop(s);
                for &j in &policy.cpus {
                    inner.cpus.lock(j).policy = None;
                }
                self.release_activation();
                return Err(GovernorError::Resource(format!("worker for cpu {}: {}", owner, e)));
            }
        }
        info!("cpu {} active: cpus {:?}, cur {} kHz, first cycle in {} ticks",
              owner, policy.cpus, policy.cur, delay);
        Ok(())
    }

    // SYNCHRONOUS: ONCE THIS RETURNS, NO CYCLE RUNS FOR THIS POLICY
    pub fn on_stop(&self, policy: &Policy) {
        let inner = &self.inner;
        if policy.cpu >= inner.cpus.len() {
            warn!("stop for unknown cpu {}", policy.cpu);
            return;
        }

        // WAITS FOR AN IN-FLIGHT CYCLE: IT HOLDS THIS LOCK
        let (worker, members) = {
            let mut s = inner.cpus.lock(policy.cpu);
            if !s.active {
                warn!("stop for inactive cpu {}", policy.cpu);
                return;
            }
            let members = s.policy.as_ref().map(|p| p.cpus.clone()).unwrap_or_default();
            (s.disarm(), members)
        };
        if let Some(w) = worker {
            w.cancel_sync();
        }
        for j in members.into_iter().filter(|&j| j < inner.cpus.len()) {
            inner.cpus.lock(j).policy = None;
        }

        self.release_activation();
        info!("cpu {} inactive", policy.cpu);
    }

    // TIGHTEN IMMEDIATELY, THEN RUN ONE CYCLE WITHOUT WAITING FOR THE TIMER.
    // DRIVER ERRORS PROPAGATE: THIS PATH IS CALLER-INVOKED.
    pub fn on_limits_changed(&self, policy: &Policy) -> Result<(), GovernorError> {
        let inner = &self.inner;
        inner.check_policy_cpus(policy)?;

        let mut s = inner.cpus.lock(policy.cpu);
        if !s.active {
            return Err(invalid(format!("limits change for inactive cpu {}", policy.cpu)));
        }

        let applied = inner.host.driver.policy(policy.cpu)?;
        let current = Policy { cur: applied.cur, ..policy.clone() };
        let forced = if policy.max < applied.cur {
            Some((policy.max, Relation::AtMost))
        } else if policy.min > applied.cur {
            Some((policy.min, Relation::AtLeast))
        } else {
            None
        };
        if let Some((target, relation)) = forced {
            info!("cpu {} limits [{}, {}] kHz: forcing {} {} kHz",
                  policy.cpu, policy.min, policy.max, relation.label(), target);
            let res = inner.host.driver.set_frequency(&current, target, relation);
            lock(&inner.log).record(policy.cpu, applied.cur, target, Action::Hold, 0, res.is_err());
            res?;
        }
        s.policy = Some(policy.clone());

        let t = inner.tunables.snapshot();
        inner.check_cpu(policy.cpu, &mut s, &t)?;
        Ok(())
    }

    // ONE SAMPLE + DECISION FOR AN ACTIVE OWNER. RETURNS THE NEXT DELAY IN
    // JIFFIES, OR None IF THE CPU IS NOT ACTIVE. THE WORKER CALLS THIS;
    // HOSTS THAT DRIVE CYCLES THEMSELVES MAY TOO.
    pub fn run_cycle(&self, cpu: usize) -> Option<u64> {
        if cpu >= self.nr_cpus() {
            return None;
        }
        self.inner.run_cycle(cpu)
    }

    // --- EARLY SUSPEND ---

    pub fn on_early_suspend(&self) {
        if !self.inner.caps.early_suspend {
            return;
        }
        let mut saved = lock(&self.inner.suspend);
        if saved.is_some() {
            return;
        }
        *saved = Some(self.inner.tunables.enter_suspend_profile());
        info!("early suspend: suspend profile applied");
    }

    pub fn on_late_resume(&self) {
        if !self.inner.caps.early_suspend {
            return;
        }
        if let Some(p) = lock(&self.inner.suspend).take() {
            self.inner.tunables.restore_profile(p);
            info!("late resume: freq_step {} sampling_rate {} restored",
                  p.freq_step, p.sampling_rate_us);
        }
    }

    // --- CONFIGURATION SURFACE CONTRACT ---

    pub fn set_sampling_rate(&self, us: u32) -> u32 {
        self.inner.tunables.set_sampling_rate(us)
    }

    pub fn set_up_threshold(&self, pct: u32) -> Result<(), GovernorError> {
        self.inner.tunables.set_up_threshold(pct)
    }

    pub fn set_up_threshold_at_min_freq(&self, pct: u32) -> Result<(), GovernorError> {
        self.inner.tunables.set_up_threshold_at_min_freq(pct)
    }

    pub fn set_down_differential(&self, pct: u32) -> u32 {
        self.inner.tunables.set_down_differential(pct)
    }

    pub fn set_freq_step(&self, pct: u32) -> u32 {
        self.inner.tunables.set_freq_step(pct)
    }

    pub fn set_freq_for_responsiveness(&self, khz: u32) {
        self.inner.tunables.set_freq_for_responsiveness(khz)
    }

    // RESETS EVERY CPU'S MULTIPLIER IN CASE IT WAS STRETCHED
    pub fn set_sampling_down_factor(&self, factor: u32) -> Result<(), GovernorError> {
        self.inner.tunables.set_sampling_down_factor(factor)?;
        for cpu in 0..self.inner.cpus.len() {
            self.inner.cpus.lock(cpu).rate_mult = 1;
        }
        Ok(())
    }

    // ON CHANGE, IDLE BASELINES ARE RE-READ SO THE NEXT DELTA IS CONSISTENT
    pub fn set_ignore_nice(&self, input: u32) {
        let inner = &self.inner;
        if !inner.tunables.set_ignore_nice(input) {
            return;
        }
        let ignore_nice = inner.tunables.ignore_nice();
        // READ UNDER THE LOCK: A CYCLE MUST NOT SLIP BETWEEN READ AND STORE
        for cpu in 0..inner.cpus.len() {
            let mut s = inner.cpus.lock(cpu);
            let reading = inner.read_counters(cpu, ignore_nice);
            s.sample.baseline(&reading);
        }
    }

    pub fn show(&self, name: &str) -> Result<String, GovernorError> {
        let t = self.inner.tunables.snapshot();
        let value = match name {
            "sampling_rate_min" => t.min_sampling_rate_us,
            "sampling_rate" => t.sampling_rate_us,
            "up_threshold" => t.up_threshold,
            "sampling_down_factor" => t.sampling_down_factor,
            "ignore_nice_load" => u32::from(t.ignore_nice),
            "down_differential" => t.down_differential,
            "freq_step" => t.freq_step,
            "up_threshold_at_min_freq" => t.up_threshold_at_min_freq,
            "freq_for_responsiveness" => t.freq_for_responsiveness,
            "cpucore_table" => return Ok(self.cpucore_table()),
            _ => return Err(invalid(format!("unknown attribute {}", name))),
        };
        Ok(format!("{}\n", value))
    }

    pub fn store(&self, name: &str, text: &str) -> Result<(), GovernorError> {
        let input: u32 = text
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{}: not an unsigned integer: {:?}", name, text.trim())))?;
        match name {
            "sampling_rate" => {
                self.set_sampling_rate(input);
            }
            "up_threshold" => self.set_up_threshold(input)?,
            "sampling_down_factor" => self.set_sampling_down_factor(input)?,
            "ignore_nice_load" => self.set_ignore_nice(input),
            "down_differential" => {
                self.set_down_differential(input);
            }
            "freq_step" => {
                self.set_freq_step(input);
            }
            "up_threshold_at_min_freq" => self.set_up_threshold_at_min_freq(input)?,
            "freq_for_responsiveness" => self.set_freq_for_responsiveness(input),
            "sampling_rate_min" | "cpucore_table" => {
                return Err(invalid(format!("{} is read-only", name)));
            }
            _ => return Err(invalid(format!("unknown attribute {}", name))),
        }
        debug!("tunable {} <- {}", name, input);
        Ok(())
    }

    // CPU NUMBERS FROM THE CONFIGURED COUNT DOWN TO 1
    fn cpucore_table(&self) -> String {
        let mut out: String = (1..=self.nr_cpus())
            .rev()
            .map(|i| format!("{} ", i))
            .collect();
        out.push('\n');
        out
    }

    pub fn attribute_values(&self) -> Vec<(&'static str, String)> {
        ATTRIBUTES
            .iter()
            .filter_map(|&name| self.show(name).ok().map(|v| (name, v)))
            .collect()
    }

    fn release_activation(&self) {
        let mut act = lock(&self.inner.activation);
        act.active = act.active.saturating_sub(1);
        if act.active == 0 {
            self.inner.surface.remove();
            info!("configuration surface removed");
        }
    }
}

impl Drop for Governor {
    fn drop(&mut self) {
        for cpu in 0..self.inner.cpus.len() {
            let worker = self.inner.cpus.lock(cpu).disarm();
            if let Some(w) = worker {
                w.cancel_sync();
            }
        }
    }
}

fn cycle_from_worker(inner: &Weak<Inner>, cpu: usize) -> Option<std::time::Duration> {
    let inner = inner.upgrade()?;
    let delay = inner.run_cycle(cpu)?;
    Some(inner.host.clock.tick_duration() * delay.min(u64::from(u32::MAX)) as u32)
}

impl Inner {
    fn check_policy_cpus(&self, policy: &Policy) -> Result<(), GovernorError> {
        let nr = self.cpus.len();
        if policy.cpu >= nr || policy.cpus.iter().any(|&j| j >= nr) {
            return Err(invalid(format!("policy cpus {:?} outside 0..{}", policy.cpus, nr)));
        }
        if !policy.cpus.contains(&policy.cpu) {
            return Err(invalid(format!("policy owner {} not in {:?}", policy.cpu, policy.cpus)));
        }
        Ok(())
    }

    fn read_counters(&self, cpu: usize, ignore_nice: bool) -> Reading {
        let (idle_us, wall_us) = self.host.counters.read_idle_and_wall(cpu);
        let nice_us = ignore_nice.then(|| self.host.counters.read_nice_us(cpu));
        Reading { idle_us, wall_us, nice_us }
    }

    fn run_cycle(&self, cpu: usize) -> Option<u64> {
        let mut s = self.cpus.lock(cpu);
        if !s.active {
            return None;
        }
        let t = self.tunables.snapshot();
        if let Err(e) = self.check_cpu(cpu, &mut s, &t) {
            warn!("cpu {} cycle: {}", cpu, e);
        }

        let clock = &self.host.clock;
        let now = clock.jiffies();
        let delay = timer::cycle_delay(
            t.sampling_rate_us,
            s.rate_mult,
            clock.hz(),
            now,
            self.host.counters.online_cpus(),
        );
        s.deadline = Some(now + delay);
        Some(delay)
    }

    // SAMPLE EVERY CPU IN THE OWNER'S POLICY, DECIDE ONCE, ISSUE AT MOST
    // ONE REQUEST. owner_state IS THE HELD GUARD OF `owner`.
    fn check_cpu(
        &self,
        owner: usize,
        owner_state: &mut CpuState,
        t: &TunablesSnapshot,
    ) -> Result<Decision, DriverError> {
        let driver = &self.host.driver;
        let policy = driver.policy(owner)?;

        let mut max_load: u64 = 0;
        let mut scaled: u64 = 0;
        let mut contributed = false;

        for &j in &policy.cpus {
            let reading = self.read_counters(j, t.ignore_nice);
            let outcome = if j == owner {
                owner_state.sample.update(&reading)
            } else if j < self.cpus.len() {
                self.cpus.lock(j).sample.update(&reading)
            } else {
                continue;
            };

            let load = match outcome {
                SampleOutcome::Load(load) => load,
                SampleOutcome::Skipped(reason) => {
                    trace!("cpu {} sample skipped: {:?}", j, reason);
                    continue;
                }
            };

            let avg = driver.average_effective_frequency(&policy, j);
            max_load = max_load.max(sampler::weighted_load(load, avg, policy.cur));
            if policy.cpuinfo_max_freq > 0 {
                scaled += u64::from(load) * u64::from(policy.cur) / u64::from(policy.cpuinfo_max_freq);
            }
            contributed = true;
        }

        // TELEMETRY ONLY, NOT A DECISION INPUT
        if contributed {
            driver.notify_utilization(&policy, scaled.min(u64::from(u32::MAX)) as u32);
        }

        let decision = engine::decide(max_load, &policy, t, self.caps.at_limit_guards);
        if let Some(mult) = decision.rate_mult {
            owner_state.rate_mult = mult;
        }

        if let Some(req) = decision.request {
            debug!("cpu {} {} {} -> {} kHz ({}), max_load {}",
                   owner, decision.action.label(), policy.cur, req.target,
                   req.relation.label(), max_load);
            let res = driver.set_frequency(&policy, req.target, req.relation);
            lock(&self.log).record(owner, policy.cur, req.target, decision.action,
                                   max_load, res.is_err());
            res?;
        }
        Ok(decision)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
