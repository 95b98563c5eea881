use chrono::{DateTime, Duration, Utc};

use overseer::config::RestartConfig;
use overseer::health::governor::{Decision, GovernorEvent, RestartGovernor};
use overseer::health::TargetHealth;

fn config() -> RestartConfig {
    RestartConfig {
        max_failures: 3,
        warn_after: 2,
        max_restarts_per_window: 3,
        window_secs: 3600,
        cooldown_secs: 1800,
        verify_probes: 3,
        startup_delay_ms: 0,
    }
}

fn governor() -> RestartGovernor {
    let mut g = RestartGovernor::new(config());
    g.track("api", true);
    g
}

/// Drives failures until a restart decision comes back; panics if the
/// governor never asks for one.
fn fail_until_restart(g: &mut RestartGovernor, now: DateTime<Utc>) -> u32 {
    for i in 1..=10 {
        if g.record_probe("api", false, now).decision == Decision::Restart {
            return i;
        }
    }
    panic!("no restart decision after 10 failures");
}

#[test]
fn test_three_failures_trigger_exactly_one_restart() {
    let mut g = governor();
    let now = Utc::now();

    let first = g.record_probe("api", false, now);
    assert_eq!(first.decision, Decision::Observe);
    assert!(first.events.is_empty());

    let second = g.record_probe("api", false, now);
    assert_eq!(second.decision, Decision::Observe);
    assert_eq!(second.events, vec![GovernorEvent::Warned { failures: 2 }]);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Degraded { failures: 2 }));

    let third = g.record_probe("api", false, now);
    assert_eq!(third.decision, Decision::Restart);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Restarting));

    let outcome = g.record_restart_outcome("api", true, now);
    assert_eq!(outcome.events, vec![GovernorEvent::Recovered]);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Healthy));
}

#[test]
fn test_success_clears_degraded() {
    let mut g = governor();
    let now = Utc::now();

    g.record_probe("api", false, now);
    g.record_probe("api", false, now);
    let recovery = g.record_probe("api", true, now);
    assert_eq!(recovery.events, vec![GovernorEvent::Recovered]);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Healthy));

    // The consecutive count starts over: two more failures stay degraded.
    g.record_probe("api", false, now);
    let again = g.record_probe("api", false, now);
    assert_eq!(again.decision, Decision::Observe);
}

#[test]
fn test_restart_budget_opens_circuit_once() {
    let mut g = governor();
    let mut now = Utc::now();

    // Three restarts land inside the window.
    for _ in 0..3 {
        assert_eq!(fail_until_restart(&mut g, now), 3);
        g.record_restart_outcome("api", true, now);
        now = now + Duration::minutes(5);
    }

    // The fourth threshold crossing opens the circuit instead.
    let mut opened = 0;
    for _ in 0..5 {
        let assessment = g.record_probe("api", false, now);
        assert_ne!(assessment.decision, Decision::Restart);
        opened += assessment
            .events
            .iter()
            .filter(|e| **e == GovernorEvent::CircuitOpened)
            .count();
    }
    assert_eq!(opened, 1);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Blocked));
}

#[test]
fn test_cooldown_closes_circuit() {
    let mut g = governor();
    let mut now = Utc::now();

    for _ in 0..3 {
        fail_until_restart(&mut g, now);
        g.record_restart_outcome("api", true, now);
        now = now + Duration::minutes(2);
    }
    for _ in 0..3 {
        g.record_probe("api", false, now);
    }
    assert_eq!(g.health_of("api"), Some(TargetHealth::Blocked));

    // A success before the cooldown elapses changes nothing.
    let early = g.record_probe("api", true, now + Duration::minutes(5));
    assert!(early.events.is_empty());
    assert_eq!(g.health_of("api"), Some(TargetHealth::Blocked));

    // Quiet for the full cooldown, the next success closes the circuit.
    let closed = g.record_probe("api", true, now + Duration::minutes(31));
    assert!(closed.events.contains(&GovernorEvent::CircuitClosed));
    assert_eq!(g.health_of("api"), Some(TargetHealth::Healthy));
}

#[test]
fn test_manual_reset_restores_restart_budget() {
    let mut g = governor();
    let now = Utc::now();

    for _ in 0..3 {
        fail_until_restart(&mut g, now);
        g.record_restart_outcome("api", true, now);
    }
    g.record_probe("api", false, now);
    g.record_probe("api", false, now);
    g.record_probe("api", false, now);
    assert_eq!(g.health_of("api"), Some(TargetHealth::Blocked));

    assert!(g.reset("api"));
    assert_eq!(g.health_of("api"), Some(TargetHealth::Healthy));

    // Window cleared: restarts are available again.
    assert_eq!(fail_until_restart(&mut g, now), 3);
}

#[test]
fn test_window_expiry_frees_restart_budget() {
    let mut g = governor();
    let start = Utc::now();

    for i in 0..3 {
        let t = start + Duration::minutes(i * 5);
        fail_until_restart(&mut g, t);
        g.record_restart_outcome("api", true, t);
    }

    // 90 minutes on, the old restarts have left the window.
    let later = start + Duration::minutes(90);
    assert_eq!(fail_until_restart(&mut g, later), 3);
}

#[test]
fn test_failed_restart_leads_to_block() {
    let mut g = governor();
    let now = Utc::now();

    // Every restart fails verification; each next failed probe re-triggers
    // until the budget runs out.
    fail_until_restart(&mut g, now);
    for _ in 0..2 {
        g.record_restart_outcome("api", false, now);
        let next = g.record_probe("api", false, now);
        assert_eq!(next.decision, Decision::Restart);
    }
    g.record_restart_outcome("api", false, now);
    let exhausted = g.record_probe("api", false, now);
    assert_eq!(exhausted.decision, Decision::Observe);
    assert!(exhausted.events.contains(&GovernorEvent::CircuitOpened));
    assert_eq!(g.health_of("api"), Some(TargetHealth::Blocked));
}

#[test]
fn test_observe_only_target_never_restarts() {
    let mut g = RestartGovernor::new(config());
    g.track("readonly", false);
    let now = Utc::now();

    for _ in 0..6 {
        let assessment = g.record_probe("readonly", false, now);
        assert_eq!(assessment.decision, Decision::Observe);
    }
    assert!(matches!(
        g.health_of("readonly"),
        Some(TargetHealth::Degraded { .. })
    ));
}
