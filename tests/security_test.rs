// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Security tests for eforms-guard.
//!
//! These tests simulate attack patterns against the submission pipeline
//! and validate that throttling, the replay ledger and the token checks
//! mitigate them.

mod harness;

use eforms_guard::{
    config::{CookieMissingPolicy, HoneypotResponse, OriginMode},
    signals::HONEYPOT_FIELD,
    throttle::{Throttle, ThrottleState},
    token::{MintedToken, TokenMode},
};
use harness::{
    attacks::{AttackConfig, TokenSource},
    fixtures::{submission, TestApp},
    generators,
    metrics::{AttackMetrics, Outcome},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_test::assert_ok;

const FORGED_INSTANCE_ID: &str = "forgedinstanceid000000";

/// Run an attack simulation against the submission pipeline.
async fn run_attack(attack: &AttackConfig, app: &TestApp) -> AttackMetrics {
    let ips = generators::generate_ips(attack.unique_ips);
    let shared = app.mint(TokenMode::Hidden);
    let forged = generators::generate_forged_tokens(attack.total_requests);

    let mut metrics = AttackMetrics::new();
    metrics.start();

    let indices: Vec<usize> = (0..attack.total_requests).collect();
    for batch in indices.chunks(attack.concurrency.max(1)) {
        let mut tasks = JoinSet::new();
        for &i in batch {
            let ip = ips[i % ips.len()];
            let token = match attack.tokens {
                TokenSource::Fresh => Some(app.mint(TokenMode::Hidden)),
                TokenSource::Shared => Some(shared.clone()),
                TokenSource::Forged => Some(MintedToken {
                    token: forged[i].clone(),
                    instance_id: FORGED_INSTANCE_ID.to_string(),
                    ..shared.clone()
                }),
                TokenSource::Missing => None,
            };
            let mut request = submission(token.as_ref(), ip);
            if attack.honeypot {
                request
                    .fields
                    .insert(HONEYPOT_FIELD.to_string(), "http://spam.example".to_string());
            }

            let state = Arc::clone(&app.state);
            tasks.spawn(async move {
                let start = Instant::now();
                let result = state.pipeline.submit(&request).await;
                (Outcome::from_result(&result), ip, start.elapsed())
            });
        }
        while let Some(joined) = tasks.join_next().await {
            let (outcome, ip, latency) = joined.expect("submission task");
            metrics.record(outcome, &ip.to_string(), latency);
        }
    }

    metrics.finish();
    metrics
}

fn throttled(max_per_minute: u32) -> impl FnOnce(&mut eforms_guard::Config) {
    move |config: &mut eforms_guard::Config| {
        config.throttle.enable = true;
        config.throttle.max_per_minute = max_per_minute;
    }
}

// ============================================================================
// Attack Simulation Tests
// ============================================================================

#[tokio::test]
async fn test_single_ip_flood() {
    let app = TestApp::new(throttled(10));
    let attack = AttackConfig::single_ip_flood();
    let expectations = attack.expectations(10);

    let report = run_attack(&attack, &app).await.report();
    println!("{}", report);

    assert!(expectations.holds(report.accepted), "{}", expectations.description);
    assert_eq!(report.accepted, 10);
    assert_eq!(report.throttled, 50);
    assert_eq!(app.ledger_entries(), 10);
}

#[tokio::test]
async fn test_distributed_attack() {
    let app = TestApp::new(throttled(10));
    let attack = AttackConfig::distributed_attack();
    let expectations = attack.expectations(10);

    let report = run_attack(&attack, &app).await.report();
    println!("{}", report);

    // Each client stays inside its own budget
    assert_eq!(report.unique_ips, 100);
    assert!(expectations.holds(report.accepted), "{}", expectations.description);
    assert_eq!(report.throttled, 0);
}

#[tokio::test]
async fn test_replay_storm_accepts_once() {
    let app = TestApp::new(|_| {});
    let attack = AttackConfig::replay_storm();
    let expectations = attack.expectations(30);

    let report = run_attack(&attack, &app).await.report();
    println!("{}", report);

    assert!(expectations.holds(report.accepted), "{}", expectations.description);
    assert_eq!(report.duplicate, attack.total_requests - 1);
    assert_eq!(app.ledger_entries(), 1);
}

#[tokio::test]
async fn test_forged_tokens_rejected() {
    let app = TestApp::new(|_| {});
    let attack = AttackConfig::forged_tokens();

    let report = run_attack(&attack, &app).await.report();
    println!("{}", report);

    assert_eq!(report.accepted, 0);
    assert_eq!(report.token_rejected, attack.total_requests);
    assert_eq!(app.ledger_entries(), 0);
}

#[tokio::test]
async fn test_honeypot_bots_burn_their_tokens() {
    let app = TestApp::new(|c| c.security.honeypot_response = HoneypotResponse::HardFail);
    let attack = AttackConfig::honeypot_bots();

    let report = run_attack(&attack, &app).await.report();
    println!("{}", report);

    assert_eq!(report.accepted, 0);
    assert_eq!(report.honeypot, attack.total_requests);
    // Every token was valid, so every one was burned
    assert_eq!(app.ledger_entries(), attack.total_requests);
}

#[tokio::test]
async fn test_stealth_honeypot_reports_success_without_commit() {
    let app = TestApp::new(|c| c.security.honeypot_response = HoneypotResponse::StealthSuccess);
    let attack = AttackConfig::honeypot_bots();

    let report = run_attack(&attack, &app).await.report();

    assert_eq!(report.accepted, 0);
    assert_eq!(report.honeypot, attack.total_requests);
}

#[tokio::test]
async fn test_tokenless_submissions_follow_cookie_policy() {
    let attack = AttackConfig::tokenless();

    let hard = TestApp::new(|c| c.security.cookie_missing_policy = CookieMissingPolicy::Hard);
    let report = run_attack(&attack, &hard).await.report();
    assert_eq!(report.token_rejected, attack.total_requests);

    let soft = TestApp::new(|c| c.security.cookie_missing_policy = CookieMissingPolicy::Soft);
    let report = run_attack(&attack, &soft).await.report();
    assert!(attack.expectations(30).holds(report.accepted));
    assert_eq!(report.accepted, attack.total_requests);
    // Nothing to reserve without a token
    assert_eq!(soft.ledger_entries(), 0);
}

#[tokio::test]
async fn test_cross_origin_submissions_under_hard_mode() {
    let app = TestApp::new(|c| c.security.origin_mode = OriginMode::Hard);
    let ip = generators::generate_ips(1)[0];

    for origin in generators::generate_foreign_origins() {
        let minted = app.mint(TokenMode::Hidden);
        let mut request = submission(Some(&minted), ip);
        request.origin = origin.map(String::from);

        let outcome = Outcome::from_result(&app.state.pipeline.submit(&request).await);
        let expected = match origin {
            // A missing header is only soft unless origin_missing_hard is set
            None => Outcome::Accepted,
            Some(_) => Outcome::OriginForbidden,
        };
        assert_eq!(outcome, expected, "Origin {:?}", origin);
    }
}

// ============================================================================
// Throttle Tests
// ============================================================================

#[tokio::test]
async fn test_cooldown_outlasts_window() {
    let app = TestApp::new(|c| {
        c.throttle.enable = true;
        c.throttle.max_per_minute = 2;
        c.throttle.cooldown_seconds = 120;
    });
    let throttle = Throttle::new(
        &app.config.storage.root,
        app.config.throttle.clone(),
        app.config.gc.throttle_stale_seconds,
        app.clock.clone(),
    );
    let key = "ab".repeat(32);

    assert!(assert_ok!(throttle.check(&key)).allowed());
    assert!(assert_ok!(throttle.check(&key)).allowed());
    let over = assert_ok!(throttle.check(&key));
    assert_eq!(over.state, ThrottleState::Over);
    assert_eq!(over.retry_after, 120);

    // New window, still cooling down
    app.clock.advance(61);
    let cooling = assert_ok!(throttle.check(&key));
    assert_eq!(cooling.state, ThrottleState::Over);
    assert!(cooling.retry_after >= 1);

    app.clock.advance(60);
    assert!(assert_ok!(throttle.check(&key)).allowed());
}

#[tokio::test]
async fn test_hard_block_beyond_multiplier() {
    let app = TestApp::new(|c| {
        c.throttle.enable = true;
        c.throttle.max_per_minute = 2;
        c.throttle.hard_multiplier = 2.0;
    });
    let throttle = app.state.pipeline.throttle();
    let key = "cd".repeat(32);

    let states: Vec<ThrottleState> = (0..6)
        .map(|_| assert_ok!(throttle.check(&key)).state)
        .collect();
    assert_eq!(
        states,
        vec![
            ThrottleState::Ok,
            ThrottleState::Ok,
            ThrottleState::Over,
            ThrottleState::Over,
            ThrottleState::Hard,
            ThrottleState::Hard,
        ]
    );
}

// ============================================================================
// Latency Tests
// ============================================================================

#[tokio::test]
async fn test_throttle_latency() {
    let app = TestApp::new(throttled(120));
    let throttle = app.state.pipeline.throttle();
    let key = "ef".repeat(32);

    let mut latencies = Vec::new();

    for _ in 0..100 {
        let start = Instant::now();
        let _ = assert_ok!(throttle.check(&key));
        latencies.push(start.elapsed());
    }

    latencies.sort();
    let median = latencies[latencies.len() / 2];
    let p99 = latencies[(latencies.len() as f64 * 0.99) as usize];

    println!("Throttle latency: median={:?}, p99={:?}", median, p99);

    // One locked read-modify-write of a small file
    assert!(
        median < Duration::from_millis(100),
        "Median latency {:?} should be < 100ms",
        median
    );
}
