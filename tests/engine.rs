// NEOX DECISION ENGINE + LOAD SAMPLER TESTS
// RAISE/LOWER SCENARIOS, HYSTERESIS, RATE MULTIPLIER, DEEP-SLEEP FILTER
//
// ALL TESTS USE PURE-RUST TYPES FROM neox::engine AND neox::sampler.
// NO HOST DEPENDENCIES. RUN OFFLINE.

use neox::engine::{decide, effective_up_threshold, Action, FreqRequest};
use neox::host::{Policy, Relation};
use neox::sampler::{weighted_load, CpuSample, Reading, SampleOutcome, SkipReason};
use neox::tuning::TunablesSnapshot;

fn policy(cur: u32) -> Policy {
    Policy {
        cpu: 0,
        cur,
        min: 100_000,
        max: 1_000_000,
        cpuinfo_max_freq: 1_000_000,
        cpus: vec![0],
    }
}

fn defaults() -> TunablesSnapshot {
    TunablesSnapshot::default()
}

// === RAISE ===

#[test]
fn busy_cpu_at_low_frequency_raises_by_step() {
    // 90% AT 200000 -> 18,000,000 ABOVE THRESHOLD x 200000
    let load = weighted_load(90, 200_000, 200_000);
    assert_eq!(load, 18_000_000);
    let d = decide(load, &policy(200_000), &defaults(), true);
    assert_eq!(d.action, Action::Raise);
    // 200000 + 37% OF 1000000
    assert_eq!(d.request, Some(FreqRequest { target: 570_000, relation: Relation::AtLeast }));
    assert_eq!(d.rate_mult, None);
}

#[test]
fn raise_uses_regular_threshold_above_responsiveness_floor() {
    let t = TunablesSnapshot { freq_for_responsiveness: 0, ..defaults() };
    // 82 x 200000 = 16,400,000
    let d = decide(16_400_000, &policy(200_000), &t, true);
    assert_eq!(d.action, Action::Hold);
    let d = decide(16_400_001, &policy(200_000), &t, true);
    assert_eq!(d.action, Action::Raise);
}

#[test]
fn low_frequency_uses_lower_up_threshold() {
    let t = defaults();
    assert_eq!(effective_up_threshold(200_000, &t), 40);
    // 50% AT 200000: BELOW 82 BUT ABOVE 40
    let d = decide(50 * 200_000, &policy(200_000), &t, true);
    assert_eq!(d.action, Action::Raise);
}

#[test]
fn raise_clamps_to_max_and_stretches_sampling() {
    let t = TunablesSnapshot { sampling_down_factor: 4, ..defaults() };
    let d = decide(100 * 900_000, &policy(900_000), &t, true);
    assert_eq!(d.request, Some(FreqRequest { target: 1_000_000, relation: Relation::AtLeast }));
    assert_eq!(d.rate_mult, Some(4));
}

#[test]
fn raise_short_of_max_keeps_multiplier() {
    let t = TunablesSnapshot { sampling_down_factor: 4, ..defaults() };
    let d = decide(100 * 500_000, &policy(500_000), &t, true);
    assert_eq!(d.request.map(|r| r.target), Some(870_000));
    assert_eq!(d.rate_mult, None);
}

// === LOWER ===

#[test]
fn idle_cpu_lowers_to_policy_min() {
    // 10% AT 200000 -> 2,000,000 / 77 = 25,974 -> FLOORED TO MIN
    let load = weighted_load(10, 200_000, 200_000);
    let d = decide(load, &policy(200_000), &defaults(), true);
    assert_eq!(d.action, Action::Lower);
    assert_eq!(d.request, Some(FreqRequest { target: 100_000, relation: Relation::AtMost }));
    assert_eq!(d.rate_mult, Some(1));
}

#[test]
fn lower_target_is_load_over_band() {
    // 30% AT 1000000: 30,000,000 / 77 = 389,610
    let t = TunablesSnapshot { freq_for_responsiveness: 0, ..defaults() };
    let d = decide(30 * 1_000_000, &policy(1_000_000), &t, true);
    assert_eq!(d.request, Some(FreqRequest { target: 389_610, relation: Relation::AtMost }));
}

#[test]
fn lower_never_requests_current_frequency() {
    let t = TunablesSnapshot { freq_for_responsiveness: 0, ..defaults() };
    // JUST UNDER THE BAND: ONE KHZ BELOW cur
    let cur = 500_000;
    let d = decide(u64::from(cur) * 77 - 1, &policy(cur), &t, true);
    assert_eq!(d.action, Action::Lower);
    assert_eq!(d.request.map(|r| r.target), Some(cur - 1));
    let d = decide(0, &policy(100_000), &t, false);
    assert_eq!(d.request, None);
    assert_eq!(d.rate_mult, Some(1));
}

// === HYSTERESIS ===

#[test]
fn dead_zone_width_is_down_differential() {
    let t = TunablesSnapshot { freq_for_responsiveness: 0, ..defaults() };
    let cur = 600_000u64;
    let p = policy(cur as u32);
    for pct in 0..=100u64 {
        let d = decide(pct * cur, &p, &t, true);
        let expected = if pct > 82 {
            Action::Raise
        } else if pct < 77 {
            Action::Lower
        } else {
            Action::Hold
        };
        assert_eq!(d.action, expected, "load {}%", pct);
    }
}

// APPLY THE FIRST TARGET AS cur, SAME LOAD AGAIN: NOTHING MORE TO ASK FOR
fn settle(load: u64, cur: u32, t: &TunablesSnapshot, guards: bool) -> (u32, Option<FreqRequest>) {
    let first = decide(load, &policy(cur), t, guards);
    let target = first.request.map(|r| r.target).expect("first decision requests a move");
    (target, decide(load, &policy(target), t, guards).request)
}

#[test]
fn reapplied_decision_requests_nothing() {
    let open = TunablesSnapshot { freq_for_responsiveness: 0, ..defaults() };

    // LOWER: 30,000,000 / 77 = 389,610. AT 389,610 THE SAME LOAD SITS IN THE DEAD ZONE
    assert_eq!(settle(30 * 1_000_000, 1_000_000, &open, true), (389_610, None));
    assert_eq!(settle(30 * 1_000_000, 1_000_000, &open, false), (389_610, None));

    // LOWER ONTO THE RESPONSIVENESS FLOOR: 8,000,000 / 77 -> 103,896 -> 400000
    assert_eq!(settle(8_000_000, 800_000, &defaults(), true), (400_000, None));
    let d = decide(8_000_000, &policy(400_000), &defaults(), false);
    assert_eq!((d.action, d.request), (Action::Lower, None));

    // LOWER TO MIN: GUARD HOLDS, WITHOUT IT next == cur
    assert_eq!(settle(1_000_000, 300_000, &defaults(), true), (100_000, None));
    assert_eq!(settle(1_000_000, 300_000, &defaults(), false), (100_000, None));

    // RAISE TO MAX: GUARD SILENCES THE REPEAT
    assert_eq!(settle(100 * 900_000, 900_000, &defaults(), true), (1_000_000, None));
}

#[test]
fn targets_stay_within_policy_limits() {
    let t = defaults();
    for cur in (100_000..=1_000_000).step_by(50_000) {
        let p = policy(cur);
        for pct in (0..=100u64).step_by(5) {
            if let Some(req) = decide(pct * u64::from(cur), &p, &t, true).request {
                assert!(req.target >= p.min && req.target <= p.max,
                        "cur {} load {}% -> {}", cur, pct, req.target);
            }
        }
    }
}

// === AT-LIMIT GUARDS ===

#[test]
fn guards_silence_requests_at_limits() {
    let t = defaults();
    let d = decide(100 * 1_000_000, &policy(1_000_000), &t, true);
    assert_eq!((d.action, d.request), (Action::Raise, None));
    let d = decide(0, &policy(100_000), &t, true);
    assert_eq!((d.action, d.request, d.rate_mult), (Action::Hold, None, None));
}

#[test]
fn without_guards_max_is_rerequested() {
    let d = decide(100 * 1_000_000, &policy(1_000_000), &defaults(), false);
    assert_eq!(d.request, Some(FreqRequest { target: 1_000_000, relation: Relation::AtLeast }));
}

// === SAMPLER ===

fn steady(s: &mut CpuSample, slices: u64, slice_us: u64, busy_pct: u64, wall: &mut u64, idle: &mut u64) -> Vec<SampleOutcome> {
    (0..slices)
        .map(|_| {
            *wall += slice_us;
            *idle += slice_us * (100 - busy_pct) / 100;
            s.update(&Reading { idle_us: *idle, wall_us: *wall, nice_us: None })
        })
        .collect()
}

#[test]
fn load_percent_always_in_range() {
    let mut s = CpuSample::default();
    let (mut wall, mut idle) = (0, 0);
    for busy in [0, 13, 50, 99, 100] {
        for out in steady(&mut s, 20, 10_000, busy, &mut wall, &mut idle) {
            if let SampleOutcome::Load(l) = out {
                assert!(l <= 100);
                assert_eq!(u64::from(l), busy);
            }
        }
    }
}

#[test]
fn deep_sleep_slice_dropped_then_recovers() {
    let mut s = CpuSample::default();
    let (mut wall, mut idle) = (0, 0);
    let warm = steady(&mut s, 30, 10_000, 50, &mut wall, &mut idle);
    assert_eq!(warm.last(), Some(&SampleOutcome::Load(50)));

    // ONE SECOND ASLEEP
    let out = steady(&mut s, 1, 1_000_000, 0, &mut wall, &mut idle);
    assert_eq!(out[0], SampleOutcome::Skipped(SkipReason::DeepSleep));

    // SMOOTHED LENGTH JUMPED TO ~100MS: 10MS SLICES ARE FILTERED UNTIL IT
    // DECAYS BACK UNDER 5X
    let out = steady(&mut s, 15, 10_000, 70, &mut wall, &mut idle);
    assert_eq!(out[0], SampleOutcome::Skipped(SkipReason::DeepSleep));
    assert_eq!(out.last(), Some(&SampleOutcome::Load(70)));
}

#[test]
fn zero_length_slice_is_skipped() {
    let mut s = CpuSample::default();
    let (mut wall, mut idle) = (0, 0);
    steady(&mut s, 30, 10_000, 50, &mut wall, &mut idle);
    // SMOOTHED ~10MS, ZERO SLICE -> FILTERED AS SHORT BEFORE ANOMALY CHECK
    let out = s.update(&Reading { idle_us: idle, wall_us: wall, nice_us: None });
    assert!(matches!(out, SampleOutcome::Skipped(_)));
}
