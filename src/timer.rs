// NEOX PER-CPU SCHEDULER
// ONE COOPERATIVE REPEATING WORKER PER ACTIVE POLICY OWNER.
//
// EACH CYCLE RUNS TO COMPLETION, COMPUTES ITS OWN NEXT DEADLINE AND
// RE-ARMS. DEADLINES ARE PULLED BACK ONTO A TICK BOUNDARY SHARED BY ALL
// CPUS SO INDEPENDENT WORKERS FIRE TOGETHER AND A POLICY'S SAMPLES STAY
// CLOSE IN TIME.
//
// CANCELLATION IS REMOVE-AND-JOIN: WHEN cancel_sync() RETURNS, THE WORKER
// THREAD HAS EXITED AND NO CYCLE IS IN FLIGHT.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::host::Policy;
use crate::sampler::CpuSample;

// --- TICK ARITHMETIC ---

// ROUNDS UP. NEVER RETURNS 0: A WORKER ALWAYS YIELDS AT LEAST ONE TICK.
pub fn usecs_to_jiffies(us: u64, hz: u32) -> u64 {
    let hz = u64::from(hz.max(1));
    (us.saturating_mul(hz).saturating_add(999_999) / 1_000_000).max(1)
}

// INTERVAL = sampling_rate x rate_mult, PHASE-ALIGNED WHEN MORE THAN ONE
// CPU IS ONLINE. RESULT IS IN [1, INTERVAL].
pub fn cycle_delay(sampling_rate_us: u32, rate_mult: u32, hz: u32, now: u64, online: usize) -> u64 {
    let us = u64::from(sampling_rate_us) * u64::from(rate_mult.max(1));
    let delay = usecs_to_jiffies(us, hz);
    if online > 1 {
        delay - now % delay
    } else {
        delay
    }
}

// --- PER-CPU STATE TABLE ---

pub struct CpuState {
    pub sample: CpuSample,
    pub rate_mult: u32,
    pub policy: Option<Policy>,
    // JIFFIES OF THE NEXT SCHEDULED CYCLE (OWNERS ONLY)
    pub deadline: Option<u64>,
    pub active: bool,
    worker: Option<Worker>,
}

impl CpuState {
    fn new() -> Self {
        Self {
            sample: CpuSample::default(),
            rate_mult: 1,
            policy: None,
            deadline: None,
            active: false,
            worker: None,
        }
    }

    pub fn arm(&mut self, worker: Worker) {
        self.worker = Some(worker);
    }

    // CALLER MUST DROP THE GUARD BEFORE cancel_sync(): THE WORKER'S CYCLE
    // NEEDS THIS SAME LOCK TO FINISH
    pub fn disarm(&mut self) -> Option<Worker> {
        self.active = false;
        self.deadline = None;
        self.worker.take()
    }
}

// ONE MUTEX PER CPU: SAMPLE STATE + RATE MULTIPLIER + ARMED WORKER.
// A RUNNING CYCLE HOLDS ITS OWNER'S LOCK FOR THE WHOLE CYCLE.
pub struct CpuTable {
    slots: Vec<Mutex<CpuState>>,
}

impl CpuTable {
    pub fn new(nr_cpus: usize) -> Self {
        Self { slots: (0..nr_cpus).map(|_| Mutex::new(CpuState::new())).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // PANICS ON OUT-OF-RANGE CPU: CALLERS VALIDATE AT THE LIFECYCLE BOUNDARY
    pub fn lock(&self, cpu: usize) -> MutexGuard<'_, CpuState> {
        self.slots[cpu].lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- WORKER ---

struct WorkerCtl {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

pub struct Worker {
    ctl: Arc<WorkerCtl>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    // body RETURNS THE DELAY UNTIL ITS NEXT RUN, OR None TO RETIRE
    pub fn spawn<F>(cpu: usize, first: Duration, mut body: F) -> io::Result<Self>
    where
        F: FnMut() -> Option<Duration> + Send + 'static,
    {
        let ctl = Arc::new(WorkerCtl { cancelled: Mutex::new(false), wake: Condvar::new() });
        let thread_ctl = ctl.clone();
        let handle = std::thread::Builder::new()
            .name(format!("neox-cpu{}", cpu))
            .spawn(move || {
                let mut delay = first;
                while wait(&thread_ctl, delay) {
                    match body() {
                        Some(next) => delay = next,
                        None => break,
                    }
                }
            })?;
        Ok(Self { ctl, handle: Some(handle) })
    }

    pub fn cancel_sync(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        *self.ctl.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.ctl.wake.notify_all();
        if let Some(h) = self.handle.take() {
            if h.thread().id() != std::thread::current().id() {
                let _ = h.join();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.cancel();
    }
}

// SLEEP UNTIL THE DEADLINE. FALSE IF CANCELLED FIRST.
fn wait(ctl: &WorkerCtl, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    let mut cancelled = ctl.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if *cancelled {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        cancelled = ctl
            .wake
            .wait_timeout(cancelled, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}
