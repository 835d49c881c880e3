//! Confirmation state machine tests against the public API.
//!
//! These cover the guarantees approvers rely on: an action runs at most once,
//! only for its proposer, and never after it expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use hitl_gateway::Error;
use hitl_gateway::config::{ConfirmationConfig, RetryConfig};
use hitl_gateway::confirmation::{
    ActionExecutor, ActionProposal, ConfirmationMachine, ConfirmationStatus, ConfirmationStore,
    InMemoryConfirmationStore, PendingConfirmation,
};
use hitl_gateway::identity::Principal;

/// Counts executions; optionally slow or failing.
#[derive(Default)]
struct RecordingExecutor {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
}

#[async_trait::async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, _: &Principal, action: &str, _: &Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("ledger service returned 500");
        }
        Ok(json!({"ran": action}))
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        enabled: true,
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn machine_with(config: &ConfirmationConfig) -> ConfirmationMachine {
    ConfirmationMachine::new(Arc::new(InMemoryConfirmationStore::new()), config)
}

fn machine() -> ConfirmationMachine {
    machine_with(&ConfirmationConfig {
        retry: fast_retry(),
        ..ConfirmationConfig::default()
    })
}

fn proposal() -> ActionProposal {
    ActionProposal::new(
        "approve_invoice",
        "Approve invoice INV-7 for 1,200.00 EUR",
        json!({"invoice": "INV-7"}),
    )
}

#[tokio::test]
async fn concurrent_confirms_execute_exactly_once() {
    // GIVEN: one pending confirmation and a slow executor
    let machine = Arc::new(machine());
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();
    let executor = Arc::new(RecordingExecutor {
        delay: Duration::from_millis(50),
        ..RecordingExecutor::default()
    });

    // WHEN: eight confirms race for it
    let mut handles = Vec::new();
    for _ in 0..8 {
        let machine = Arc::clone(&machine);
        let executor = Arc::clone(&executor);
        let alice = alice.clone();
        let id = pending.confirmation_id.clone();
        handles.push(tokio::spawn(async move {
            machine
                .confirm(&alice, "finance", &id, true, executor.as_ref())
                .await
        }));
    }
    let mut succeeded = 0;
    let mut not_found = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(Error::ConfirmationNotFound(_)) => not_found += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // THEN: exactly one winner, everyone else sees not-found
    assert_eq!(succeeded, 1);
    assert_eq!(not_found, 7);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejection_is_final() {
    let machine = machine();
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    let outcome = machine
        .confirm(&alice, "finance", &pending.confirmation_id, false, &executor)
        .await
        .unwrap();
    assert_eq!(outcome.status(), ConfirmationStatus::Rejected);

    // A later approval of the same id finds nothing.
    let again = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;
    assert!(matches!(again, Err(Error::ConfirmationNotFound(_))));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn other_principal_cannot_consume_the_record() {
    // GIVEN: alice's proposal
    let machine = machine();
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let mallory = Principal::with_roles("mallory", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    // WHEN: mallory tries to approve it
    let result = machine
        .confirm(&mallory, "finance", &pending.confirmation_id, true, &executor)
        .await;

    // THEN: refused, nothing ran, and the record is still there for alice
    assert!(matches!(result, Err(Error::ConfirmationPrincipalMismatch(_))));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert!(machine.exists("finance", &pending.confirmation_id).await.unwrap());
}

#[tokio::test]
async fn record_is_gone_after_round_trip() {
    let machine = machine();
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();
    assert!(machine.exists("finance", &pending.confirmation_id).await.unwrap());

    machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await
        .unwrap();
    assert!(!machine.exists("finance", &pending.confirmation_id).await.unwrap());
}

#[tokio::test]
async fn failed_execution_is_not_retryable_by_confirming_again() {
    let machine = machine();
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor {
        fail: true,
        ..RecordingExecutor::default()
    };
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    let first = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;
    assert!(matches!(first, Err(Error::ExecutionFailed { .. })));

    let second = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;
    assert!(matches!(second, Err(Error::ConfirmationNotFound(_))));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_within_grace_reports_expired() {
    // GIVEN: a 1s TTL with a long grace window
    let machine = machine_with(&ConfirmationConfig {
        ttl: Duration::from_secs(1),
        expiry_grace: Duration::from_secs(60),
        retry: fast_retry(),
        ..ConfirmationConfig::default()
    });
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    // WHEN: confirming after the TTL
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;

    // THEN: expired, never executed, and gone afterwards
    assert!(matches!(result, Err(Error::ConfirmationExpired(_))));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    assert!(!machine.exists("finance", &pending.confirmation_id).await.unwrap());
}

#[tokio::test]
async fn expired_past_grace_reports_not_found() {
    let machine = machine_with(&ConfirmationConfig {
        ttl: Duration::from_secs(1),
        expiry_grace: Duration::ZERO,
        retry: fast_retry(),
        ..ConfirmationConfig::default()
    });
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let result = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;
    assert!(matches!(result, Err(Error::ConfirmationNotFound(_))));
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

/// Fails the first `failures` reads, then delegates.
struct FlakyStore {
    inner: InMemoryConfirmationStore,
    failures: AtomicUsize,
}

impl FlakyStore {
    fn trip(&self) -> hitl_gateway::Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::ConfirmationStoreUnavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfirmationStore for FlakyStore {
    async fn create(
        &self,
        prefix: &str,
        id: &str,
        record: &PendingConfirmation,
        ttl: Duration,
    ) -> hitl_gateway::Result<()> {
        self.inner.create(prefix, id, record, ttl).await
    }

    async fn get(&self, prefix: &str, id: &str) -> hitl_gateway::Result<Option<PendingConfirmation>> {
        self.trip()?;
        self.inner.get(prefix, id).await
    }

    async fn delete(&self, prefix: &str, id: &str) -> hitl_gateway::Result<bool> {
        self.inner.delete(prefix, id).await
    }

    async fn exists(&self, prefix: &str, id: &str) -> hitl_gateway::Result<bool> {
        self.inner.exists(prefix, id).await
    }

    async fn take(&self, prefix: &str, id: &str) -> hitl_gateway::Result<Option<PendingConfirmation>> {
        self.inner.take(prefix, id).await
    }
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    // GIVEN: a store whose first two reads fail
    let store = Arc::new(FlakyStore {
        inner: InMemoryConfirmationStore::new(),
        failures: AtomicUsize::new(2),
    });
    let machine = ConfirmationMachine::new(
        store,
        &ConfirmationConfig {
            retry: fast_retry(),
            ..ConfirmationConfig::default()
        },
    );
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    // WHEN / THEN: the confirm succeeds within the retry budget
    let outcome = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await
        .unwrap();
    assert_eq!(outcome.status(), ConfirmationStatus::Confirmed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_store_failure_surfaces_as_unavailable() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryConfirmationStore::new(),
        failures: AtomicUsize::new(100),
    });
    let machine = ConfirmationMachine::new(
        store,
        &ConfirmationConfig {
            retry: fast_retry(),
            ..ConfirmationConfig::default()
        },
    );
    let alice = Principal::with_roles("alice", &["finance-write"]);
    let executor = RecordingExecutor::default();
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    let result = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::ConfirmationStoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

/// Writes every record but loses the first `lost_acks` replies.
struct LossyStore {
    inner: InMemoryConfirmationStore,
    lost_acks: AtomicUsize,
    creates: AtomicUsize,
}

#[async_trait::async_trait]
impl ConfirmationStore for LossyStore {
    async fn create(
        &self,
        prefix: &str,
        id: &str,
        record: &PendingConfirmation,
        ttl: Duration,
    ) -> hitl_gateway::Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(prefix, id, record, ttl).await?;
        if self.lost_acks.load(Ordering::SeqCst) > 0 {
            self.lost_acks.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ConfirmationStoreUnavailable("reply lost".into()));
        }
        Ok(())
    }

    async fn get(&self, prefix: &str, id: &str) -> hitl_gateway::Result<Option<PendingConfirmation>> {
        self.inner.get(prefix, id).await
    }

    async fn delete(&self, prefix: &str, id: &str) -> hitl_gateway::Result<bool> {
        self.inner.delete(prefix, id).await
    }

    async fn exists(&self, prefix: &str, id: &str) -> hitl_gateway::Result<bool> {
        self.inner.exists(prefix, id).await
    }

    async fn take(&self, prefix: &str, id: &str) -> hitl_gateway::Result<Option<PendingConfirmation>> {
        self.inner.take(prefix, id).await
    }
}

#[tokio::test]
async fn retried_create_after_lost_reply_keeps_the_proposal() {
    // GIVEN: a store that persists the first write but never acknowledges it
    let store = Arc::new(LossyStore {
        inner: InMemoryConfirmationStore::new(),
        lost_acks: AtomicUsize::new(1),
        creates: AtomicUsize::new(0),
    });
    let machine = ConfirmationMachine::new(
        store.clone(),
        &ConfirmationConfig {
            retry: fast_retry(),
            ..ConfirmationConfig::default()
        },
    );
    let alice = Principal::with_roles("alice", &["finance-write"]);

    // WHEN: proposing
    let pending = machine.propose(&alice, "finance", proposal()).await.unwrap();

    // THEN: the retry recognised its own record, which can still be confirmed once
    assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    let executor = RecordingExecutor::default();
    let outcome = machine
        .confirm(&alice, "finance", &pending.confirmation_id, true, &executor)
        .await
        .unwrap();
    assert_eq!(outcome.status(), ConfirmationStatus::Confirmed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    assert!(!machine.exists("finance", &pending.confirmation_id).await.unwrap());
}
