// NEOX LOAD SAMPLER
// TWO SUCCESSIVE COUNTER READS -> LOAD PERCENT FOR ONE CPU.
//
// DEEP-SLEEP FILTER: A SLICE MORE THAN 5X LONGER OR SHORTER THAN THE
// SMOOTHED SLICE LENGTH IS DROPPED FROM THIS CYCLE'S AGGREGATE. A LONG
// SLICE MOSTLY MEASURED IDLE THAT IS ALREADY OVER; A SHORT ONE MOSTLY
// MEASURED A WAKEUP BURST. EITHER WAY THE NEXT SLICE IS THE BETTER SIGNAL.
// THE SMOOTHED LENGTH AND ALL COUNTERS ADVANCE REGARDLESS.

pub const DEEP_SLEEP_FACTOR: u64 = 5;
pub const DEEP_SLEEP_BACKOFF: u64 = 10; // NEW SLICE WEIGHS 1/(BACKOFF+1)

// PER-CPU SAMPLE STATE. ZERO-VALUED AT CREATION.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuSample {
    pub prev_idle_us: u64,
    pub prev_wall_us: u64,
    pub prev_wall_delta_us: u64,
    pub prev_nice_us: u64,
}

// ONE COUNTER READ. nice_us IS Some ONLY WHEN ignore_nice IS SET.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reading {
    pub idle_us: u64,
    pub wall_us: u64,
    pub nice_us: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    DeepSleep,
    // WALL DELTA ZERO OR IDLE EXCEEDING WALL
    ClockAnomaly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    Load(u32),
    Skipped(SkipReason),
}

impl CpuSample {
    // START-OF-LIFE BASELINE. THE SMOOTHED SLICE LENGTH IS LEFT ALONE.
    pub fn baseline(&mut self, r: &Reading) {
        self.prev_idle_us = r.idle_us;
        self.prev_wall_us = r.wall_us;
        if let Some(nice) = r.nice_us {
            self.prev_nice_us = nice;
        }
    }

    pub fn update(&mut self, r: &Reading) -> SampleOutcome {
        let wall = r.wall_us.saturating_sub(self.prev_wall_us);
        self.prev_wall_us = r.wall_us;

        let smoothed = self.prev_wall_delta_us;
        let deep_sleep = smoothed > wall.saturating_mul(DEEP_SLEEP_FACTOR)
            || smoothed.saturating_mul(DEEP_SLEEP_FACTOR) < wall;
        self.prev_wall_delta_us =
            (smoothed.saturating_mul(DEEP_SLEEP_BACKOFF) + wall) / (DEEP_SLEEP_BACKOFF + 1);

        let mut idle = r.idle_us.saturating_sub(self.prev_idle_us);
        self.prev_idle_us = r.idle_us;

        // NICED WORK COUNTS AS IDLE: IT SHOULD NOT PULL THE FREQUENCY UP
        if let Some(nice) = r.nice_us {
            idle = idle.saturating_add(nice.saturating_sub(self.prev_nice_us));
            self.prev_nice_us = nice;
        }

        if deep_sleep {
            return SampleOutcome::Skipped(SkipReason::DeepSleep);
        }
        if wall == 0 || idle > wall {
            return SampleOutcome::Skipped(SkipReason::ClockAnomaly);
        }

        SampleOutcome::Load((100 * (wall - idle) / wall) as u32)
    }
}

// LOAD SCALED BY THE FREQUENCY THE CPU ACTUALLY RAN AT.
// DRIVER AVERAGE <= 0 FALLS BACK TO THE POLICY'S CURRENT FREQUENCY.
pub fn weighted_load(load_pct: u32, freq_avg: i64, cur_khz: u32) -> u64 {
    let freq = if freq_avg <= 0 { u64::from(cur_khz) } else { freq_avg as u64 };
    u64::from(load_pct) * freq
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(idle: u64, wall: u64) -> Reading {
        Reading { idle_us: idle, wall_us: wall, nice_us: None }
    }

    // STEADY 10MS SLICES UNTIL THE SMOOTHED LENGTH STOPS FLAGGING
    fn warmed(slice: u64) -> (CpuSample, u64) {
        let mut s = CpuSample::default();
        let mut wall = 0;
        for _ in 0..40 {
            wall += slice;
            s.update(&read(0, wall));
        }
        (s, wall)
    }

    #[test]
    fn zero_valued_state_filters_first_slices() {
        // SMOOTHED LENGTH STARTS AT 0: THE FIRST THREE 10MS SLICES LOOK
        // ANOMALOUSLY LONG, THE FOURTH IS ACCEPTED
        let mut s = CpuSample::default();
        let outcomes: Vec<SampleOutcome> = (1..=4)
            .map(|i| s.update(&read(0, i * 10_000)))
            .collect();
        assert_eq!(outcomes[0], SampleOutcome::Skipped(SkipReason::DeepSleep));
        assert_eq!(outcomes[1], SampleOutcome::Skipped(SkipReason::DeepSleep));
        assert_eq!(outcomes[2], SampleOutcome::Skipped(SkipReason::DeepSleep));
        assert_eq!(outcomes[3], SampleOutcome::Load(100));
    }

    #[test]
    fn load_percent_truncates() {
        let (mut s, wall) = warmed(10_000);
        let idle = s.prev_idle_us;
        // 3333 IDLE OF 10000 -> 66.67% BUSY -> 66
        assert_eq!(s.update(&read(idle + 3_333, wall + 10_000)), SampleOutcome::Load(66));
    }

    #[test]
    fn long_slice_skipped_but_counters_advance() {
        let (mut s, wall) = warmed(10_000);
        let before = s.prev_wall_delta_us;
        let out = s.update(&read(0, wall + 100_000));
        assert_eq!(out, SampleOutcome::Skipped(SkipReason::DeepSleep));
        assert_eq!(s.prev_wall_us, wall + 100_000);
        assert_eq!(s.prev_wall_delta_us, (before * 10 + 100_000) / 11);
    }

    #[test]
    fn short_slice_skipped() {
        let (mut s, wall) = warmed(10_000);
        let out = s.update(&read(0, wall + 1_000));
        assert_eq!(out, SampleOutcome::Skipped(SkipReason::DeepSleep));
    }

    #[test]
    fn idle_beyond_wall_is_clock_anomaly() {
        let (mut s, wall) = warmed(10_000);
        let idle = s.prev_idle_us;
        let out = s.update(&read(idle + 12_000, wall + 10_000));
        assert_eq!(out, SampleOutcome::Skipped(SkipReason::ClockAnomaly));
        assert_eq!(s.prev_idle_us, idle + 12_000);
    }

    #[test]
    fn nice_time_counts_as_idle() {
        let (mut s, wall) = warmed(10_000);
        s.prev_nice_us = 1_000;
        let idle = s.prev_idle_us;
        let r = Reading { idle_us: idle + 2_000, wall_us: wall + 10_000, nice_us: Some(4_000) };
        // IDLE 2000 + NICE 3000 = 5000 OF 10000
        assert_eq!(s.update(&r), SampleOutcome::Load(50));
        assert_eq!(s.prev_nice_us, 4_000);
    }

    #[test]
    fn baseline_keeps_smoothed_length() {
        let (mut s, _) = warmed(10_000);
        let smoothed = s.prev_wall_delta_us;
        s.baseline(&Reading { idle_us: 5, wall_us: 9, nice_us: Some(3) });
        assert_eq!(s.prev_wall_delta_us, smoothed);
        assert_eq!((s.prev_idle_us, s.prev_wall_us, s.prev_nice_us), (5, 9, 3));
    }

    #[test]
    fn weighted_load_falls_back_to_cur() {
        assert_eq!(weighted_load(90, 200_000, 100_000), 18_000_000);
        assert_eq!(weighted_load(90, 0, 100_000), 9_000_000);
        assert_eq!(weighted_load(90, -1, 100_000), 9_000_000);
    }
}
