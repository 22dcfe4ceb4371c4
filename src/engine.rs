// NEOX DECISION ENGINE
// PURE FUNCTION: AGGREGATED FREQUENCY-WEIGHTED LOAD + POLICY + TUNABLES
// -> RAISE / LOWER / HOLD, PLUS THE RATE MULTIPLIER SIDE EFFECT.
//
// ALL THRESHOLD COMPARISONS ARE PRODUCTS (PERCENT x KHZ). DIVISION ONLY
// HAPPENS WHEN A LOWER TARGET IS ACTUALLY COMPUTED, AND TRUNCATES.
//
// HYSTERESIS: RAISE ABOVE up_threshold, LOWER BELOW
// (up_threshold - down_differential). THE GAP IS THE DEAD ZONE.

use crate::host::{Policy, Relation};
use crate::tuning::TunablesSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Raise,
    Lower,
    Hold,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Self::Raise => "RAISE",
            Self::Lower => "LOWER",
            Self::Hold => "HOLD",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreqRequest {
    pub target: u32,
    pub relation: Relation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    // None: NOTHING TO ASK THE DRIVER
    pub request: Option<FreqRequest>,
    // Some: NEW RATE MULTIPLIER FOR THE OWNING CPU
    pub rate_mult: Option<u32>,
}

impl Decision {
    fn hold() -> Self {
        Self { action: Action::Hold, request: None, rate_mult: None }
    }
}

// BELOW THE RESPONSIVENESS FLOOR THE LOWER up_threshold_at_min_freq APPLIES
pub fn effective_up_threshold(cur: u32, t: &TunablesSnapshot) -> u32 {
    if cur < t.freq_for_responsiveness {
        t.up_threshold_at_min_freq
    } else {
        t.up_threshold
    }
}

// at_limit_guards: SKIP THE RAISE REQUEST WHEN ALREADY AT MAX AND
// EXIT EARLY WHEN ALREADY AT MIN. SOME PLATFORMS DISABLE BOTH.
pub fn decide(
    max_load: u64,
    policy: &Policy,
    t: &TunablesSnapshot,
    at_limit_guards: bool,
) -> Decision {
    let cur = u64::from(policy.cur);

    // RAISE
    let up = u64::from(effective_up_threshold(policy.cur, t));
    if max_load > up * cur {
        let inc = u64::from(policy.max) * u64::from(t.freq_step) / 100;
        let target = (cur + inc).min(u64::from(policy.max)) as u32;

        // PINNED AT MAX: STRETCH FUTURE SAMPLING
        let rate_mult = if policy.cur < policy.max && target == policy.max {
            Some(t.sampling_down_factor)
        } else {
            None
        };

        let request = if at_limit_guards && policy.cur == policy.max {
            None
        } else {
            Some(FreqRequest { target, relation: Relation::AtLeast })
        };
        return Decision { action: Action::Raise, request, rate_mult };
    }

    if at_limit_guards && policy.cur == policy.min {
        return Decision::hold();
    }

    // LOWER
    let down = t.up_threshold.saturating_sub(t.down_differential);
    if down == 0 {
        return Decision::hold();
    }
    let down = u64::from(down);
    if max_load >= down * cur {
        return Decision::hold();
    }

    let mut next = (max_load / down).max(u64::from(policy.min));

    // RESIDUAL LOAD JUST UNDER THE RESPONSIVENESS FLOOR: STAY AT THE FLOOR
    // INSTEAD OF OSCILLATING BELOW IT
    let floor = u64::from(t.freq_for_responsiveness);
    // A DIFFERENTIAL WIDER THAN THE LOW-FREQUENCY THRESHOLD DISABLES THE CLAMP
    if let Some(down_at_min) = t.up_threshold_at_min_freq.checked_sub(t.down_differential) {
        if next < floor && next > 0 && max_load / next > u64::from(down_at_min) {
            next = floor;
        }
    }

    let next = next.min(u64::from(u32::MAX)) as u32;
    let request = if next == policy.cur {
        None
    } else {
        Some(FreqRequest { target: next, relation: Relation::AtMost })
    };
    Decision { action: Action::Lower, request, rate_mult: Some(1) }
}
