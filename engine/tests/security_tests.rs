//! Security tests for the per-call mediation path
//!
//! These exercise failure isolation and enforcement through `secure_execute`:
//! circuit breaking, timeouts, concurrency caps, resource breaches and
//! outbound network policy.

mod common;

use bastion_engine::circuit_breaker::CircuitState;
use bastion_engine::config::Config;
use bastion_engine::events::{EventFilter, SecurityEventType, Severity};
use bastion_engine::message_bus::{Event, EventType};
use bastion_engine::sandbox::PluginStatus;
use common::{key_pair, manifest_json, orchestrator, orchestrator_with, sign};
use sdk::errors::EngineError;
use sdk::limits::{ResourceDimension, ResourceSample};
use sdk::method::PluginMethod;
use sdk::permissions::{DenialReason, TrustLevel};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

fn breaker_config() -> Config {
    let mut config = Config::default();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.cooldown_ms = 50;
    config
}

async fn install_basic(
    orch: &bastion_engine::orchestrator::SecurityOrchestrator,
    raw: &Value,
) {
    let outcome = orch
        .secure_install(raw, b"", None, TrustLevel::Basic)
        .await
        .unwrap();
    if outcome.instance.is_none() {
        let id = raw["id"].as_str().unwrap();
        orch.approve_plugin(id, "admin", None).await.unwrap();
    }
}

async fn read(
    orch: &bastion_engine::orchestrator::SecurityOrchestrator,
    id: &str,
) -> Result<(), EngineError> {
    orch.secure_execute(id, PluginMethod::ReadStorage, json!({}), None)
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_repeated_failures_open_circuit_and_trial_call_recovers() {
    let (orch, runtime) = orchestrator_with(breaker_config());
    let mut rx = orch.message_bus().subscribe(EventType::CircuitOpened).await;
    install_basic(&orch, &manifest_json("flaky", &["storage:read"])).await;

    runtime.set_failing(true);
    for _ in 0..3 {
        assert!(matches!(read(&orch, "flaky").await, Err(EngineError::Plugin(_))));
    }

    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Error);
    assert!(matches!(rx.recv().await.unwrap(), Event::CircuitOpened { .. }));
    let open = orch.get_security_events(&EventFilter {
        event_type: Some(SecurityEventType::CircuitOpen),
        ..EventFilter::for_plugin("flaky")
    });
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].severity, Severity::High);

    // Rejected without reaching the runtime
    assert!(matches!(
        read(&orch, "flaky").await,
        Err(EngineError::CircuitOpen { .. })
    ));
    assert_eq!(runtime.call_count(), 3);
    assert_eq!(orch.get_security_dashboard().open_circuits.len(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    runtime.set_failing(false);
    read(&orch, "flaky").await.unwrap();

    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Active);
    let status = orch.get_sandbox_status(Some("flaky")).remove(0);
    assert_eq!(status.circuit_breaker.unwrap().state, CircuitState::Closed);
}

#[tokio::test]
async fn test_failed_trial_call_reopens_circuit() {
    let (orch, runtime) = orchestrator_with(breaker_config());
    install_basic(&orch, &manifest_json("flaky", &["storage:read"])).await;

    runtime.set_failing(true);
    for _ in 0..3 {
        let _ = read(&orch, "flaky").await;
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(read(&orch, "flaky").await, Err(EngineError::Plugin(_))));
    assert!(matches!(
        read(&orch, "flaky").await,
        Err(EngineError::CircuitOpen { .. })
    ));
    assert_eq!(runtime.call_count(), 4);
    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Error);
}

#[tokio::test]
async fn test_call_started_before_opening_cannot_close_circuit() {
    let (orch, runtime) = orchestrator_with(breaker_config());
    install_basic(&orch, &manifest_json("flaky", &["storage:read"])).await;

    let breaker_state = || {
        orch.get_sandbox_status(Some("flaky"))[0]
            .circuit_breaker
            .as_ref()
            .map(|b| b.state)
    };

    runtime.set_delay(Duration::from_millis(300));
    let stale = read(&orch, "flaky");

    let rest = async {
        runtime.set_delay(Duration::ZERO);
        runtime.set_failing(true);
        for _ in 0..3 {
            let _ = read(&orch, "flaky").await;
        }
        assert_eq!(breaker_state(), Some(CircuitState::Open));

        tokio::time::sleep(Duration::from_millis(80)).await;
        runtime.set_failing(false);
        runtime.set_delay(Duration::from_millis(600));
        let trial = read(&orch, "flaky");

        let observe = async {
            // The stale call has finished by now; the trial call has not
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(breaker_state(), Some(CircuitState::HalfOpen));
            assert!(matches!(
                read(&orch, "flaky").await,
                Err(EngineError::CircuitOpen { .. })
            ));
            assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Error);
        };

        let (trial, ()) = tokio::join!(trial, observe);
        trial
    };

    let (stale, trial) = tokio::join!(stale, rest);
    stale.unwrap();
    trial.unwrap();

    assert_eq!(breaker_state(), Some(CircuitState::Closed));
    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Active);
    assert_eq!(runtime.call_count(), 5);
}

#[tokio::test]
async fn test_reset_circuit_breaker_restores_plugin() {
    let (orch, runtime) = orchestrator_with(breaker_config());
    install_basic(&orch, &manifest_json("flaky", &["storage:read"])).await;

    runtime.set_failing(true);
    for _ in 0..3 {
        let _ = read(&orch, "flaky").await;
    }
    runtime.set_failing(false);

    orch.reset_circuit_breaker("flaky").await.unwrap();
    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Active);
    read(&orch, "flaky").await.unwrap();
}

#[tokio::test]
async fn test_pause_survives_failures_and_reset() {
    let (orch, runtime) = orchestrator_with(breaker_config());
    install_basic(&orch, &manifest_json("flaky", &["storage:read"])).await;

    runtime.set_failing(true);
    runtime.set_delay(Duration::from_millis(50));
    let pause_midway = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        orch.pause_plugin("flaky").unwrap();
    };
    let (a, b, c, ()) = tokio::join!(
        read(&orch, "flaky"),
        read(&orch, "flaky"),
        read(&orch, "flaky"),
        pause_midway
    );
    assert!(a.is_err() && b.is_err() && c.is_err());

    let status = orch.get_sandbox_status(Some("flaky")).remove(0);
    assert_eq!(status.instance.status, PluginStatus::Paused);
    assert_eq!(status.circuit_breaker.unwrap().state, CircuitState::Open);

    orch.reset_circuit_breaker("flaky").await.unwrap();
    assert_eq!(orch.get_instance("flaky").unwrap().status, PluginStatus::Paused);
    assert!(matches!(
        read(&orch, "flaky").await,
        Err(EngineError::PermissionDenied {
            reason: DenialReason::PluginNotActive,
            ..
        })
    ));

    runtime.set_failing(false);
    runtime.set_delay(Duration::ZERO);
    orch.resume_plugin("flaky").unwrap();
    read(&orch, "flaky").await.unwrap();
}

#[tokio::test]
async fn test_slow_call_times_out() {
    let (orch, runtime) = orchestrator();
    install_basic(&orch, &manifest_json("slow", &["storage:read"])).await;
    runtime.set_delay(Duration::from_millis(200));

    let started = Instant::now();
    let err = orch
        .secure_execute(
            "slow",
            PluginMethod::ReadStorage,
            json!({}),
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(matches!(err, EngineError::Timeout { timeout_ms: 20, .. }));
    let timeouts = orch.get_security_events(&EventFilter {
        event_type: Some(SecurityEventType::ExecutionTimeout),
        ..EventFilter::default()
    });
    assert_eq!(timeouts.len(), 1);
    assert_eq!(
        orch.get_sandbox_status(Some("slow"))[0]
            .circuit_breaker
            .as_ref()
            .unwrap()
            .consecutive_failures,
        1
    );
}

#[tokio::test]
async fn test_untrusted_plugin_is_throttled_when_busy() {
    let (orch, runtime) = orchestrator();
    let outcome = orch
        .secure_install(
            &manifest_json("busy", &["storage:read"]),
            b"",
            None,
            TrustLevel::Untrusted,
        )
        .await
        .unwrap();
    let instance = outcome.instance.unwrap();
    assert_eq!(instance.resource_limits.max_concurrent_calls, 1);
    assert_eq!(instance.resource_limits.max_memory_mb, 64);

    runtime.set_delay(Duration::from_millis(100));
    let (first, second) = tokio::join!(read(&orch, "busy"), read(&orch, "busy"));

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(EngineError::ResourceLimitExceeded {
            dimension: ResourceDimension::Concurrency,
            ..
        })
    )));
    assert_eq!(runtime.call_count(), 1);
}

#[tokio::test]
async fn test_verified_plugin_waits_for_a_slot() {
    let (orch, runtime) = orchestrator();
    let (key, pem) = key_pair(11);
    orch.add_trusted_signer("Fixture Co", &pem, "admin").unwrap();

    let mut raw = manifest_json("queued", &["storage:read"]);
    raw["resourceLimits"] = json!({ "maxConcurrentCalls": 1 });
    let signature = sign(&raw, &key, &pem);
    let outcome = orch
        .secure_install(&raw, b"", Some(signature), TrustLevel::Verified)
        .await
        .unwrap();
    assert!(outcome.review.signature_verified);
    assert_eq!(outcome.instance.unwrap().resource_limits.max_concurrent_calls, 1);

    runtime.set_delay(Duration::from_millis(50));
    let started = Instant::now();
    let (first, second) = tokio::join!(read(&orch, "queued"), read(&orch, "queued"));

    first.unwrap();
    second.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(runtime.call_count(), 2);
}

#[tokio::test]
async fn test_reported_breach_blocks_next_call() {
    let (orch, runtime) = orchestrator();
    install_basic(&orch, &manifest_json("hungry", &["storage:read"])).await;

    runtime.set_usage(ResourceSample {
        cpu_pct: 5.0,
        memory_mb: 1000.0,
        network_bytes: 0,
    });
    let result = orch
        .secure_execute("hungry", PluginMethod::ReadStorage, json!({}), None)
        .await
        .unwrap();
    assert_eq!(result.usage.unwrap().memory_mb, 1000.0);

    let err = read(&orch, "hungry").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::ResourceLimitExceeded {
            dimension: ResourceDimension::Memory,
            ..
        }
    ));
    assert_eq!(runtime.call_count(), 1);

    let breaches = orch.get_security_events(&EventFilter {
        event_type: Some(SecurityEventType::ResourceLimitExceeded),
        ..EventFilter::for_plugin("hungry")
    });
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].severity, Severity::High);

    let snapshots = orch.get_resource_snapshots(Some("hungry"));
    assert_eq!(snapshots["hungry"].len(), 1);
}

#[tokio::test]
async fn test_breach_is_announced_on_the_bus() {
    let (orch, runtime) = orchestrator();
    install_basic(&orch, &manifest_json("hungry", &["storage:read"])).await;
    let mut rx = orch
        .message_bus()
        .subscribe(EventType::SecurityEventRaised)
        .await;

    runtime.set_usage(ResourceSample {
        cpu_pct: 5.0,
        memory_mb: 100_000.0,
        network_bytes: 0,
    });
    read(&orch, "hungry").await.unwrap();

    let stored = orch.get_security_events(&EventFilter::for_plugin("hungry"));
    assert_eq!(stored.len(), 1);
    match rx.try_recv().unwrap() {
        Event::SecurityEventRaised {
            event_id,
            plugin_id,
            event_type,
            severity,
        } => {
            assert_eq!(event_id, stored[0].id);
            assert_eq!(plugin_id, "hungry");
            assert_eq!(event_type, SecurityEventType::ResourceLimitExceeded);
            assert_eq!(severity, Severity::High);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_network_policy_is_enforced() {
    let (orch, _) = orchestrator();
    let mut raw = manifest_json("fetcher", &["network:http"]);
    raw["networkPolicy"] = json!({
        "allowedHosts": ["api.example.com", "*.cdn.example.net"],
        "allowedPorts": [443]
    });
    install_basic(&orch, &raw).await;

    let call = |args: Value| {
        let orch = &orch;
        async move {
            orch.secure_execute("fetcher", PluginMethod::HttpRequest, args, None)
                .await
        }
    };

    call(json!({"url": "https://api.example.com/v1/data"}))
        .await
        .unwrap();
    call(json!({"url": "https://eu.cdn.example.net/asset.js"}))
        .await
        .unwrap();
    call(json!({"host": "api.example.com"})).await.unwrap();

    for denied in [
        json!({"url": "https://evil.example.org/"}),
        json!({"url": "http://api.example.com/"}),
        json!({"host": "api.example.com", "port": 8443}),
        json!({"url": "https://10.0.0.5/"}),
        json!({}),
    ] {
        assert!(matches!(
            call(denied).await,
            Err(EngineError::NetworkPolicyViolation { .. })
        ));
    }

    let violations = orch.get_security_events(&EventFilter {
        event_type: Some(SecurityEventType::NetworkPolicyViolation),
        ..EventFilter::for_plugin("fetcher")
    });
    assert_eq!(violations.len(), 5);
}

#[tokio::test]
async fn test_missing_policy_denies_private_targets() {
    let (orch, _) = orchestrator();
    install_basic(&orch, &manifest_json("open", &["network:ws"])).await;

    orch.secure_execute(
        "open",
        PluginMethod::OpenWebsocket,
        json!({"url": "wss://stream.example.com/feed"}),
        None,
    )
    .await
    .unwrap();

    for target in ["ws://localhost:9000", "ws://192.168.1.10/", "wss://[::1]:8443"] {
        assert!(matches!(
            orch.secure_execute(
                "open",
                PluginMethod::OpenWebsocket,
                json!({ "url": target }),
                None
            )
            .await,
            Err(EngineError::NetworkPolicyViolation { .. })
        ));
    }
}

#[tokio::test]
async fn test_paused_plugin_is_refused() {
    let (orch, runtime) = orchestrator();
    install_basic(&orch, &manifest_json("store", &["storage:read"])).await;

    orch.pause_plugin("store").unwrap();
    assert!(matches!(
        read(&orch, "store").await,
        Err(EngineError::PermissionDenied {
            reason: DenialReason::PluginNotActive,
            ..
        })
    ));
    assert!(matches!(
        orch.pause_plugin("store"),
        Err(EngineError::InvalidState(_))
    ));

    orch.resume_plugin("store").unwrap();
    read(&orch, "store").await.unwrap();
    assert_eq!(runtime.call_count(), 1);
}

#[tokio::test]
async fn test_undeclared_method_is_denied_and_recorded() {
    let (orch, runtime) = orchestrator();
    install_basic(&orch, &manifest_json("store", &["storage:read"])).await;

    let err = orch
        .secure_execute(
            "store",
            PluginMethod::HttpRequest,
            json!({"url": "https://api.example.com"}),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::PermissionDenied {
            reason: DenialReason::NotDeclared,
            ..
        }
    ));
    assert_eq!(runtime.call_count(), 0);

    let denials = orch.get_security_events(&EventFilter {
        event_type: Some(SecurityEventType::PermissionDenied),
        ..EventFilter::for_plugin("store")
    });
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].severity, Severity::Low);

    let overview = orch.get_security_overview("store");
    assert!(overview
        .recent_audit
        .iter()
        .any(|entry| !entry.allowed && entry.reason.as_deref() == Some("not_declared")));
}
