//! Unit tests for the per-session rate limiter.
//!
//! Covers the ceiling, exponential back-off escalation and cap, back-off
//! expiry, penalty decay on window roll, and the exact window boundary.

use chrono::{Duration, Utc};

use prompt_dock::session::rate_limit::{RateDecision, RateLimitState};

const MAX: u32 = 100;

#[test]
fn admits_up_to_the_ceiling() {
    let now = Utc::now();
    let mut state = RateLimitState::new(now);
    for _ in 0..MAX {
        assert_eq!(state.check(now, MAX), RateDecision::Admitted);
    }
}

#[test]
fn rejects_the_101st_with_two_second_backoff() {
    let now = Utc::now();
    let mut state = RateLimitState::new(now);
    for _ in 0..MAX {
        assert_eq!(state.check(now, MAX), RateDecision::Admitted);
    }
    assert_eq!(
        state.check(now, MAX),
        RateDecision::Limited {
            retry_after_secs: 2
        }
    );
}

#[test]
fn commands_during_backoff_see_remaining_seconds() {
    let now = Utc::now();
    let mut state = RateLimitState::new(now);
    for _ in 0..=MAX {
        state.check(now, MAX);
    }
    // One second into the 2 s back-off, one second remains.
    let during = now + Duration::seconds(1);
    assert_eq!(
        state.check(during, MAX),
        RateDecision::Limited {
            retry_after_secs: 1
        }
    );
}

#[test]
fn repeat_offences_escalate_and_cap_at_sixty() {
    let mut now = Utc::now();
    let mut state = RateLimitState::new(now);
    let mut seen = Vec::new();

    for _ in 0..8 {
        // Burst past the ceiling right after the previous back-off lifts,
        // within the same window so the penalty does not decay.
        let mut backoff = 0;
        for _ in 0..=MAX {
            match state.check(now, MAX) {
                RateDecision::Admitted => {}
                RateDecision::Limited { retry_after_secs } => backoff = retry_after_secs,
            }
        }
        seen.push(backoff);
        now += Duration::seconds(backoff as i64);
    }

    assert_eq!(&seen[..5], &[2, 4, 8, 16, 32]);
    assert!(seen[5..].iter().all(|&b| b == 60), "cap at 60s: {seen:?}");
}

#[test]
fn backoff_lifts_after_it_expires() {
    let now = Utc::now();
    let mut state = RateLimitState::new(now);
    for _ in 0..=MAX {
        state.check(now, MAX);
    }
    let after = now + Duration::seconds(3);
    assert_eq!(state.check(after, MAX), RateDecision::Admitted);
}

#[test]
fn window_boundary_counts_against_a_fresh_window() {
    let now = Utc::now();
    let mut state = RateLimitState::new(now);
    for _ in 0..MAX {
        assert_eq!(state.check(now, MAX), RateDecision::Admitted);
    }
    // Exactly sixty seconds after the window opened: fresh window, fresh
    // counter.
    let at_boundary = now + Duration::seconds(60);
    assert_eq!(state.check(at_boundary, MAX), RateDecision::Admitted);
}

#[test]
fn penalty_decays_across_clean_windows() {
    let mut now = Utc::now();
    let mut state = RateLimitState::new(now);

    // First offence: back-off 2 s (penalty level 1).
    for _ in 0..=MAX {
        state.check(now, MAX);
    }
    // Behave for two full windows so the penalty decays back to zero.
    now += Duration::seconds(61);
    assert_eq!(state.check(now, MAX), RateDecision::Admitted);
    now += Duration::seconds(61);
    assert_eq!(state.check(now, MAX), RateDecision::Admitted);

    // Re-offend: the back-off restarts at 2 s, not 4 s.
    let mut backoff = 0;
    for _ in 0..=MAX {
        if let RateDecision::Limited { retry_after_secs } = state.check(now, MAX) {
            backoff = retry_after_secs;
        }
    }
    assert_eq!(backoff, 2);
}
