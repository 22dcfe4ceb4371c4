// NEOX TUNABLES
// PURE-RUST MODULE: ZERO HOST DEPENDENCIES
// ONE PROCESS-WIDE RECORD, ATOMICS ONLY. WRITTEN BY THE CONFIGURATION
// SURFACE, READ BY EVERY SAMPLING CYCLE THROUGH A SINGLE SNAPSHOT.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{invalid, GovernorError};

// SAMPLING

pub const DEF_SAMPLING_RATE_US: u32 = 50_000;   // 50MS
pub const MIN_SAMPLING_RATE_US: u32 = 10_000;   // 10MS FLOOR, SET AT FIRST ACTIVATION

pub const DEF_SAMPLING_DOWN_FACTOR: u32 = 1;
pub const MAX_SAMPLING_DOWN_FACTOR: u32 = 100_000;

// THRESHOLDS (PERCENT)

pub const DEF_UP_THRESHOLD: u32 = 82;
pub const MIN_UP_THRESHOLD: u32 = 11;
pub const MAX_UP_THRESHOLD: u32 = 100;
pub const DEF_DOWN_DIFFERENTIAL: u32 = 5;
pub const MAX_PERCENT: u32 = 100;

// STEPPING AND RESPONSIVENESS

pub const DEF_FREQ_STEP: u32 = 37;                    // % OF POLICY MAX PER RAISE
pub const DEF_UP_THRESHOLD_AT_MIN_FREQ: u32 = 40;
pub const DEF_FREQ_FOR_RESPONSIVENESS: u32 = 400_000; // KHZ

// EARLY-SUSPEND PROFILE

pub const SUSPEND_FREQ_STEP: u32 = 20;
pub const SUSPEND_SAMPLING_MULT: u32 = 4;

// ONE CONSISTENT READ OF EVERY FIELD. A CYCLE NEVER RE-READS A TUNABLE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TunablesSnapshot {
    pub sampling_rate_us: u32,
    pub min_sampling_rate_us: u32,
    pub up_threshold: u32,
    pub up_threshold_at_min_freq: u32,
    pub down_differential: u32,
    pub sampling_down_factor: u32,
    pub ignore_nice: bool,
    pub freq_step: u32,
    pub freq_for_responsiveness: u32,
}

impl Default for TunablesSnapshot {
    fn default() -> Self {
        Self {
            sampling_rate_us: DEF_SAMPLING_RATE_US,
            min_sampling_rate_us: MIN_SAMPLING_RATE_US,
            up_threshold: DEF_UP_THRESHOLD,
            up_threshold_at_min_freq: DEF_UP_THRESHOLD_AT_MIN_FREQ,
            down_differential: DEF_DOWN_DIFFERENTIAL,
            sampling_down_factor: DEF_SAMPLING_DOWN_FACTOR,
            ignore_nice: false,
            freq_step: DEF_FREQ_STEP,
            freq_for_responsiveness: DEF_FREQ_FOR_RESPONSIVENESS,
        }
    }
}

// SAVED ACROSS AN EARLY-SUSPEND / LATE-RESUME PAIR
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedProfile {
    pub freq_step: u32,
    pub sampling_rate_us: u32,
}

pub struct Tunables {
    sampling_rate_us: AtomicU32,
    min_sampling_rate_us: AtomicU32,
    up_threshold: AtomicU32,
    up_threshold_at_min_freq: AtomicU32,
    down_differential: AtomicU32,
    sampling_down_factor: AtomicU32,
    ignore_nice: AtomicBool,
    freq_step: AtomicU32,
    freq_for_responsiveness: AtomicU32,
}

impl Tunables {
    pub fn new() -> Self {
        Self::from_snapshot(&TunablesSnapshot::default())
    }

    pub fn from_snapshot(s: &TunablesSnapshot) -> Self {
        Self {
            sampling_rate_us: AtomicU32::new(s.sampling_rate_us),
            min_sampling_rate_us: AtomicU32::new(s.min_sampling_rate_us),
            up_threshold: AtomicU32::new(s.up_threshold),
            up_threshold_at_min_freq: AtomicU32::new(s.up_threshold_at_min_freq),
            down_differential: AtomicU32::new(s.down_differential),
            sampling_down_factor: AtomicU32::new(s.sampling_down_factor),
            ignore_nice: AtomicBool::new(s.ignore_nice),
            freq_step: AtomicU32::new(s.freq_step),
            freq_for_responsiveness: AtomicU32::new(s.freq_for_responsiveness),
        }
    }

    pub fn snapshot(&self) -> TunablesSnapshot {
        TunablesSnapshot {
            sampling_rate_us: self.sampling_rate_us.load(Ordering::Relaxed),
            min_sampling_rate_us: self.min_sampling_rate_us.load(Ordering::Relaxed),
            up_threshold: self.up_threshold.load(Ordering::Relaxed),
            up_threshold_at_min_freq: self.up_threshold_at_min_freq.load(Ordering::Relaxed),
            down_differential: self.down_differential.load(Ordering::Relaxed),
            sampling_down_factor: self.sampling_down_factor.load(Ordering::Relaxed),
            ignore_nice: self.ignore_nice.load(Ordering::Relaxed),
            freq_step: self.freq_step.load(Ordering::Relaxed),
            freq_for_responsiveness: self.freq_for_responsiveness.load(Ordering::Relaxed),
        }
    }

    // FIRST ACTIVATION WINS: FLOOR AND RATE BACK TO DEFAULTS.
    // RETURNS THE PREVIOUS (RATE, FLOOR) SO A FAILED START CAN ROLL BACK.
    pub fn reset_sampling(&self) -> (u32, u32) {
        let rate = self.sampling_rate_us.swap(DEF_SAMPLING_RATE_US, Ordering::Relaxed);
        let floor = self.min_sampling_rate_us.swap(MIN_SAMPLING_RATE_US, Ordering::Relaxed);
        (rate, floor)
    }

    pub fn restore_sampling(&self, rate: u32, floor: u32) {
        self.sampling_rate_us.store(rate, Ordering::Relaxed);
        self.min_sampling_rate_us.store(floor, Ordering::Relaxed);
    }

    // --- ACCESSORS ---

    pub fn sampling_rate_us(&self) -> u32 {
        self.sampling_rate_us.load(Ordering::Relaxed)
    }

    pub fn min_sampling_rate_us(&self) -> u32 {
        self.min_sampling_rate_us.load(Ordering::Relaxed)
    }

    pub fn ignore_nice(&self) -> bool {
        self.ignore_nice.load(Ordering::Relaxed)
    }

    pub fn freq_step(&self) -> u32 {
        self.freq_step.load(Ordering::Relaxed)
    }

    // --- VALIDATED SETTERS ---
    // OUT-OF-RANGE WRITES ARE REJECTED, EXCEPT sampling_rate (CLAMPED UP TO
    // THE FLOOR) AND down_differential / freq_step (CLAMPED DOWN TO 100).

    // RETURNS THE VALUE ACTUALLY STORED
    pub fn set_sampling_rate(&self, us: u32) -> u32 {
        let applied = us.max(self.min_sampling_rate_us());
        self.sampling_rate_us.store(applied, Ordering::Relaxed);
        applied
    }

    pub fn set_up_threshold(&self, pct: u32) -> Result<(), GovernorError> {
        check_up_threshold("up_threshold", pct)?;
        self.up_threshold.store(pct, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_up_threshold_at_min_freq(&self, pct: u32) -> Result<(), GovernorError> {
        check_up_threshold("up_threshold_at_min_freq", pct)?;
        self.up_threshold_at_min_freq.store(pct, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_sampling_down_factor(&self, factor: u32) -> Result<(), GovernorError> {
        if !(1..=MAX_SAMPLING_DOWN_FACTOR).contains(&factor) {
            return Err(invalid(format!(
                "sampling_down_factor {} outside 1..={}",
                factor, MAX_SAMPLING_DOWN_FACTOR
            )));
        }
        self.sampling_down_factor.store(factor, Ordering::Relaxed);
        Ok(())
    }

    // ANY NONZERO INPUT MEANS ON. RETURNS TRUE IF THE VALUE CHANGED.
    pub fn set_ignore_nice(&self, input: u32) -> bool {
        let on = input > 0;
        self.ignore_nice.swap(on, Ordering::Relaxed) != on
    }

    pub fn set_down_differential(&self, pct: u32) -> u32 {
        let applied = pct.min(MAX_PERCENT);
        self.down_differential.store(applied, Ordering::Relaxed);
        applied
    }

    pub fn set_freq_step(&self, pct: u32) -> u32 {
        let applied = pct.min(MAX_PERCENT);
        self.freq_step.store(applied, Ordering::Relaxed);
        applied
    }

    pub fn set_freq_for_responsiveness(&self, khz: u32) {
        self.freq_for_responsiveness.store(khz, Ordering::Relaxed);
    }

    // --- SUSPEND PROFILE ---

    pub fn enter_suspend_profile(&self) -> SavedProfile {
        let freq_step = self.freq_step.swap(SUSPEND_FREQ_STEP, Ordering::Relaxed);
        let rate = self.sampling_rate_us();
        self.sampling_rate_us
            .store(rate.saturating_mul(SUSPEND_SAMPLING_MULT), Ordering::Relaxed);
        SavedProfile { freq_step, sampling_rate_us: rate }
    }

    pub fn restore_profile(&self, saved: SavedProfile) {
        self.freq_step.store(saved.freq_step, Ordering::Relaxed);
        self.sampling_rate_us.store(saved.sampling_rate_us, Ordering::Relaxed);
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}

fn check_up_threshold(name: &str, pct: u32) -> Result<(), GovernorError> {
    if (MIN_UP_THRESHOLD..=MAX_UP_THRESHOLD).contains(&pct) {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} {} outside {}..={}",
            name, pct, MIN_UP_THRESHOLD, MAX_UP_THRESHOLD
        )))
    }
}
