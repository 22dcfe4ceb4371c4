// NEOX DECISION LOG
// RECORDS EVERY FREQUENCY REQUEST ISSUED BY THE GOVERNOR
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION ON THE SAMPLING PATH.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::engine::Action;

const MAX_TRANSITIONS: usize = 8192;

#[derive(Clone, Copy)]
pub struct Transition {
    pub ts_ns: u64,
    pub cpu: usize,
    pub old_khz: u32,
    pub new_khz: u32,
    pub action: Action,
    pub max_load: u64,
    pub failed: bool,
}

pub struct DecisionLog {
    transitions: Vec<Transition>,
    head: usize,
    len: usize,
    raises: u64,
    lowers: u64,
    limits: u64,
    errors: u64,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition { ts_ns: 0, cpu: 0, old_khz: 0, new_khz: 0,
                             action: Action::Hold, max_load: 0, failed: false };
                MAX_TRANSITIONS
            ],
            head: 0,
            len: 0,
            raises: 0,
            lowers: 0,
            limits: 0,
            errors: 0,
        }
    }

    // RECORD ONE REQUEST. Action::Hold MARKS A FORCED LIMITS MOVE.
    pub fn record(&mut self, cpu: usize, old_khz: u32, new_khz: u32,
                  action: Action, max_load: u64, failed: bool) {
        self.transitions[self.head] = Transition {
            ts_ns: now_ns(),
            cpu,
            old_khz,
            new_khz,
            action,
            max_load,
            failed,
        };
        self.head = (self.head + 1) % MAX_TRANSITIONS;
        if self.len < MAX_TRANSITIONS {
            self.len += 1;
        }
        match action {
            Action::Raise => self.raises += 1,
            Action::Lower => self.lowers += 1,
            Action::Hold => self.limits += 1,
        }
        if failed {
            self.errors += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // (RAISES, LOWERS, LIMIT MOVES, DRIVER ERRORS) SINCE START
    pub fn totals(&self) -> (u64, u64, u64, u64) {
        (self.raises, self.lowers, self.limits, self.errors)
    }

    // ITERATE TRANSITIONS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Transition> {
        let start = if self.len < MAX_TRANSITIONS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.transitions[(start + i) % MAX_TRANSITIONS]
        })
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let first = match iter.next() {
            Some(t) => t,
            None => return,
        };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<5} {:<7} {:<10} {:<10} {:<14} {:<6}",
            "TIME_S", "CPU", "ACTION", "OLD_KHZ", "NEW_KHZ", "MAX_LOAD", "OK");
        println!("{}", "-".repeat(68));

        for t in std::iter::once(first).chain(iter) {
            let elapsed_s = (t.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            let label = if t.action == Action::Hold { "LIMIT" } else { t.action.label() };
            println!("{:<10.3} {:<5} {:<7} {:<10} {:<10} {:<14} {:<6}",
                elapsed_s, t.cpu, label, t.old_khz, t.new_khz, t.max_load,
                if t.failed { "FAIL" } else { "OK" });
        }

        if self.len == MAX_TRANSITIONS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} TRANSITIONS)", MAX_TRANSITIONS);
        }
        println!("TOTAL TRANSITIONS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        println!("\n{}", "=".repeat(50));
        println!("NEOX SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  RAISES:            {}", self.raises);
        println!("  LOWERS:            {}", self.lowers);
        println!("  LIMIT MOVES:       {}", self.limits);
        println!("  DRIVER ERRORS:     {}", self.errors);

        if self.len < 2 {
            return;
        }
        let mut iter = self.iter_chronological();
        let first_ts = iter.next().map(|t| t.ts_ns).unwrap_or(0);
        let last_ts = iter.last().map(|t| t.ts_ns).unwrap_or(first_ts);
        let elapsed_s = (last_ts - first_ts) as f64 / 1_000_000_000.0;
        println!("  ELAPSED:           {:.1}s", elapsed_s);
        if elapsed_s > 0.0 {
            println!("  TRANSITIONS/S:     {:.2}", self.len as f64 / elapsed_s);
        }
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
