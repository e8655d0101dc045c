//! Shared fixtures for integration tests
//!
//! - Fast retry policies that do not wait on real time
//! - A supervisor wired to an in-memory document and a notification channel
#![allow(dead_code)]

use opguard::checkpoint::{RollbackScope, SharedState};
use opguard::notification::{ChannelSink, Notification, NotificationHub};
use opguard::retry::{BackoffStrategy, CircuitBreakerSettings, RetryPolicy};
use opguard::{OpguardConfig, OperationSupervisor};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fixed 10ms backoff without a circuit breaker
pub fn fast_policy(operation_type: &str, attempts: u32) -> RetryPolicy {
    RetryPolicy::new(operation_type)
        .with_max_attempts(attempts)
        .with_backoff(
            BackoffStrategy::Fixed,
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .with_circuit_breaker(CircuitBreakerSettings::disabled())
}

pub fn initial_document() -> Value {
    json!({
        "title": "Annual filing",
        "sections": ["cover", "summary"],
        "revision": 1,
    })
}

/// Supervisor owning a document scope, with events forwarded to a channel
pub struct Harness {
    pub supervisor: OperationSupervisor,
    pub document: SharedState,
    pub events: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = OpguardConfig::default();
        config.worker_pool.size = Some(2);
        config.orchestrator.default_timeout = None;
        Self::with_config(config)
    }

    pub fn with_config(config: OpguardConfig) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let (sink, events) = ChannelSink::new(1024);
        hub.register(Arc::new(sink));

        let supervisor = OperationSupervisor::from_config(&config, hub).expect("valid config");
        let document = SharedState::new(initial_document());
        supervisor
            .register_accessor(RollbackScope::DocumentState, Arc::new(document.clone()))
            .expect("accessor registered");

        Self {
            supervisor,
            document,
            events,
        }
    }

    pub fn set_policy(&self, policy: RetryPolicy) {
        self.supervisor
            .engine()
            .policies()
            .set_policy(policy)
            .expect("valid policy");
    }

    /// Every event received so far
    pub fn drain(&mut self) -> Vec<Notification> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
