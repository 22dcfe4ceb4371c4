// NEOX HOST COLLABORATORS
// THE GOVERNOR OWNS NO HARDWARE. IT READS IDLE/WALL COUNTERS FROM A
// COUNTER SOURCE AND ISSUES REQUESTS THROUGH A FREQUENCY DRIVER.
// A CLOCK SUPPLIES THE HOST TICK (JIFFIES) USED FOR PHASE ALIGNMENT.

use std::time::Duration;

use crate::error::DriverError;

// SNAPSHOT OF A CPUFREQ POLICY. FREQUENCIES IN KHZ.
// `cpu` IS THE OWNING CPU: THE ONE WHOSE WORKER MAKES DECISIONS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub cpu: usize,
    pub cur: u32,
    pub min: u32,
    pub max: u32,
    pub cpuinfo_max_freq: u32,
    pub cpus: Vec<usize>,
}

// AT-LEAST: LOWEST SUPPORTED FREQUENCY >= TARGET.
// AT-MOST: HIGHEST SUPPORTED FREQUENCY <= TARGET.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    AtLeast,
    AtMost,
}

impl Relation {
    pub fn label(self) -> &'static str {
        match self {
            Self::AtLeast => "AT_LEAST",
            Self::AtMost => "AT_MOST",
        }
    }
}

// MONOTONIC, PER-CPU, MICROSECONDS SINCE BOOT
pub trait CounterSource: Send + Sync {
    // (IDLE_US, WALL_US)
    fn read_idle_and_wall(&self, cpu: usize) -> (u64, u64);

    // ONLY READ WHEN ignore_nice IS SET
    fn read_nice_us(&self, cpu: usize) -> u64;

    fn online_cpus(&self) -> usize;
}

pub trait FrequencyDriver: Send + Sync {
    fn policy(&self, cpu: usize) -> Result<Policy, DriverError>;

    // MAY BLOCK. NOT RETRIED BY THE GOVERNOR.
    fn set_frequency(&self, policy: &Policy, target: u32, relation: Relation)
        -> Result<(), DriverError>;

    // EFFECTIVE AVERAGE SINCE LAST QUERY. <= 0 MEANS UNAVAILABLE.
    fn average_effective_frequency(&self, policy: &Policy, cpu: usize) -> i64;

    // FIRE-AND-FORGET TELEMETRY
    fn notify_utilization(&self, _policy: &Policy, _scaled_load: u32) {}
}

pub trait Clock: Send + Sync {
    fn jiffies(&self) -> u64;

    fn hz(&self) -> u32;

    // WALL TIME OF ONE JIFFY. WORKERS SLEEP IN MULTIPLES OF THIS.
    fn tick_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.hz().max(1)))
    }
}
