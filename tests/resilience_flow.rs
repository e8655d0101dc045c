/// End-to-end tests of the resilience core through its public API
///
/// Covers:
/// - Retry timing and statistics
/// - Circuit breakers stopping retries
/// - Escalation of critical errors
/// - Supervised operations with notifications, rollback and cancellation
mod common;

use common::{fast_policy, initial_document, Harness};
use opguard::cancellation::{CancelReason, CancellationScope, OperationState, ProgressUpdate};
use opguard::checkpoint::{CheckpointManager, RollbackKind, RollbackScope, SharedState};
use opguard::error::{
    ErrorCategory, ErrorContext, ErrorResponse, ErrorSeverity, FnHandler,
    UnifiedErrorCoordinator,
};
use opguard::notification::Notification;
use opguard::retry::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSettings,
    PolicyRegistry, RetryEngine, RetryPolicy, WorkerPool,
};
use opguard::{CancellationToken, OpguardError, OperationRequest};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn engine_with(policy: RetryPolicy) -> RetryEngine {
    let policies = Arc::new(PolicyRegistry::new(RetryPolicy::default()));
    policies.set_policy(policy).unwrap();
    RetryEngine::new(
        policies,
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings::default())),
        Arc::new(WorkerPool::new(1)),
    )
}

#[tokio::test(start_paused = true)]
async fn test_exponential_retry_waits_one_then_two_seconds() {
    let engine = engine_with(
        RetryPolicy::new("report")
            .with_max_attempts(3)
            .with_backoff(
                BackoffStrategy::Exponential,
                Duration::from_secs(1),
                Duration::from_secs(30),
            )
            .with_circuit_breaker(CircuitBreakerSettings::disabled()),
    );
    let token = CancellationToken::new("op-report");
    let start = Instant::now();
    let offsets = Mutex::new(Vec::new());
    let calls = AtomicU32::new(0);

    let result = engine
        .run_with_retry("report", "filings", &token, |_token| {
            offsets.lock().unwrap().push(start.elapsed());
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    anyhow::bail!("service unavailable");
                }
                Ok(n)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 3);
    let offsets = offsets.into_inner().unwrap();
    assert_eq!(offsets.len(), 3);
    let first_wait = offsets[1] - offsets[0];
    let second_wait = offsets[2] - offsets[1];
    assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1100));
    assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2100));

    let stats = engine.stats_for("report");
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 2);
}

#[test]
fn test_breaker_opens_after_threshold() {
    let breaker = CircuitBreaker::new("search", 2, 1, Duration::from_secs(30));
    assert!(breaker.can_proceed());
    breaker.record_failure();
    assert!(breaker.can_proceed());
    breaker.record_failure();
    assert!(!breaker.can_proceed());
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_stops_retry_loop() {
    let engine = engine_with(
        fast_policy("search", 5).with_circuit_breaker(CircuitBreakerSettings {
            enabled: true,
            failure_threshold: 2,
            success_threshold: 1,
            cooldown: Duration::from_secs(60),
        }),
    );
    let token = CancellationToken::new("op-search");
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = engine
        .run_with_retry("search", "search-api", &token, |_token| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("connection reset")) }
        })
        .await;

    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.breakers().open_services(), vec!["search-api".to_string()]);
}

#[test]
fn test_critical_error_escalates_regardless_of_handler() {
    let coordinator = UnifiedErrorCoordinator::default();
    coordinator.register_handler(Arc::new(FnHandler::new(
        "optimistic",
        0,
        |_record| true,
        |record, _context| ErrorResponse::for_record(record, "optimistic").retryable(true),
    )));

    let error = OpguardError::from(anyhow::anyhow!("ledger checksum mismatch"));
    let response = coordinator.handle(
        &error,
        ErrorContext::for_operation("op-ledger").with_severity(ErrorSeverity::Critical),
    );

    assert_eq!(response.handler, "optimistic");
    assert!(!response.retry_allowed);
    assert!(response.escalated);
    let reference = response.support_reference.unwrap();
    assert!(reference.starts_with("OPG-"));
}

#[test]
fn test_rollback_restores_state_and_discards_later_checkpoints() {
    let manager = CheckpointManager::new(50);
    let document = SharedState::new(initial_document());
    manager
        .register_accessor(RollbackScope::DocumentState, Arc::new(document.clone()))
        .unwrap();

    let first = manager
        .create_checkpoint("op-edit", RollbackScope::DocumentState, "before outline")
        .unwrap();
    document.update(|doc| doc["revision"] = json!(2));
    manager
        .create_checkpoint("op-edit", RollbackScope::DocumentState, "before body")
        .unwrap();
    document.update(|doc| doc["sections"] = json!(["cover"]));
    manager
        .create_checkpoint("op-edit", RollbackScope::DocumentState, "before appendix")
        .unwrap();
    assert_eq!(manager.len(), 3);

    manager
        .rollback(&first, "user undo", RollbackKind::Manual)
        .unwrap();

    assert_eq!(document.get(), initial_document());
    assert!(manager.is_empty());
    assert_eq!(manager.stats().manual_rollbacks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_supervised_success_reports_monotone_progress() {
    let mut harness = Harness::new();
    harness.set_policy(fast_policy("edit", 3));
    let calls = AtomicU32::new(0);

    let request = OperationRequest::new("edit", "docs")
        .with_id("op-progress")
        .with_scope(RollbackScope::DocumentState)
        .with_total_steps(4);
    let result = harness
        .supervisor
        .run_operation(request, |ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    anyhow::bail!("connection reset by peer");
                }
                for step in 1..=4u32 {
                    ctx.report(
                        ProgressUpdate::new()
                            .state(OperationState::DocumentUpdating)
                            .step_number(step)
                            .percentage(f64::from(step) * 25.0),
                    );
                    // out-of-order report must not move progress back
                    ctx.report(ProgressUpdate::new().percentage(10.0));
                }
                Ok(())
            }
        })
        .await;
    assert!(result.is_ok());

    let percentages: Vec<f64> = harness
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            Notification::Progress(p) if p.operation_id == "op-progress" => Some(p.percentage),
            _ => None,
        })
        .collect();
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percentages.last().copied(), Some(100.0));

    let progress = harness
        .supervisor
        .orchestrator()
        .get_progress("op-progress")
        .unwrap();
    assert_eq!(progress.state, OperationState::Completed);
    assert_eq!(progress.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_notifies_and_is_recorded() {
    let mut harness = Harness::new();
    harness.set_policy(fast_policy("filings", 2));

    let failure = harness
        .supervisor
        .run_operation(
            OperationRequest::new("filings", "edgar").with_id("op-filings"),
            |_ctx| async { Err::<(), _>(anyhow::anyhow!("upstream returned 503")) },
        )
        .await
        .unwrap_err();

    let response = failure.response.clone().unwrap();
    assert_eq!(response.category, ErrorCategory::ExternalService);

    let errors: Vec<_> = harness
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            Notification::Error(response) => Some(response),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_id, response.error_id);

    let record = harness
        .supervisor
        .coordinator()
        .get(&response.error_id)
        .unwrap();
    assert_eq!(record.operation_id.as_deref(), Some("op-filings"));
    assert_eq!(failure.final_state(), Some(OperationState::Error));
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_parent_cancels_supervised_child() {
    let harness = Harness::new();
    harness.set_policy(fast_policy("edit", 3));
    let orchestrator = harness.supervisor.orchestrator();
    let _parent = orchestrator.start_operation("parent", "req-1", None).unwrap();

    let child = harness.supervisor.run_operation(
        OperationRequest::new("edit", "docs")
            .with_id("child")
            .with_parent("parent")
            .with_scope(RollbackScope::DocumentState),
        |ctx| {
            let document = harness.document.clone();
            async move {
                document.update(|doc| doc["revision"] = json!(99));
                ctx.token.cancelled().await;
                ctx.check()?;
                Ok(())
            }
        },
    );
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator
            .cancel(
                "parent",
                CancelReason::UserRequested,
                "request withdrawn",
                CancellationScope::OperationAndChildren,
            )
            .unwrap()
    };

    let (result, report) = tokio::join!(child, cancel);

    assert_eq!(report.cancelled.len(), 2);
    let failure = result.unwrap_err();
    assert_eq!(failure.error.cancel_reason(), Some(CancelReason::ParentCancelled));
    assert_eq!(failure.final_state(), Some(OperationState::Cancelled));
    assert_eq!(harness.document.get(), initial_document());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_operations_are_isolated() {
    let harness = Harness::new();
    harness.set_policy(fast_policy("batch", 1));

    let runs = (0..8).map(|i| {
        harness.supervisor.run_operation(
            OperationRequest::new("batch", "worker").with_id(format!("op-{}", i)),
            move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                if i % 2 == 0 {
                    Ok(i)
                } else {
                    Err(anyhow::anyhow!("invalid input for item {}", i))
                }
            },
        )
    });
    let results = futures::future::join_all(runs).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    let stats = harness.supervisor.orchestrator().stats();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.active, 0);
    assert_eq!(
        harness
            .supervisor
            .coordinator()
            .stats()
            .by_category
            .get(&ErrorCategory::Validation)
            .copied(),
        Some(4)
    );
}

#[tokio::test]
async fn test_blocking_action_runs_on_worker_pool() {
    let engine = engine_with(fast_policy("export", 2));
    let token = CancellationToken::new("op-export");
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = Arc::clone(&attempts);

    let bytes = engine
        .run_blocking_with_retry("export", "disk", &token, move |_token| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("resource temporarily unavailable");
            }
            Ok(4096usize)
        })
        .await
        .unwrap();

    assert_eq!(bytes, 4096);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(engine.pool().completed(), 2);
}
