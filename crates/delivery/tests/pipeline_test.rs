//! End-to-end tests for admission and delivery
//!
//! Loops are driven one `tick()` at a time so every step is observable;
//! webhook targets are wiremock servers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_core::{DeliveryStatus, Event, Registration, Shop};
use courier_delivery::prelude::*;
use courier_delivery::queue::{JobFailureOutcome, WebhookJob};
use courier_delivery::scheduler::AdmissionTick;
use courier_delivery::worker::WorkerTick;
use courier_delivery::{CircuitState, JobDrop, RetryPolicy};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Fixtures
// =============================================================================

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default().with_idle_wait(Duration::from_millis(10));
    config.multiplexer.retry = RetryPolicy::fixed(Duration::ZERO, 5);
    config.circuit = config.circuit.with_cooldown(Duration::from_millis(150));
    config.worker = config.worker.with_worker_id("test-worker");
    config
}

struct Harness {
    store: Arc<InMemoryDeliveryStore>,
    pipeline: DeliveryPipeline,
}

impl Harness {
    fn new(config: PipelineConfig) -> Self {
        let store = Arc::new(InMemoryDeliveryStore::new());
        let pipeline = DeliveryPipeline::in_memory(store.clone(), config).unwrap();
        Self { store, pipeline }
    }

    async fn shop(&self, name: &str) -> Shop {
        self.store.create_shop(name).await.unwrap()
    }

    async fn register(&self, shop_id: Uuid, url: String, event_types: &[&str]) -> Registration {
        self.store
            .create_registration(NewRegistration {
                shop_id,
                target_url: url,
                event_types: event_types.iter().map(|s| s.to_string()).collect(),
                secret: "whsec_test".into(),
                active: true,
            })
            .await
            .unwrap()
    }

    async fn event(&self, shop_id: Uuid, event_type: &str) -> Event {
        self.store
            .insert_event(NewEvent {
                shop_id,
                event_type: event_type.into(),
                payload: json!({"order": 1}),
            })
            .await
            .unwrap()
    }

    async fn admitted_event(&self, shop_id: Uuid, event_type: &str) -> Event {
        let event = self.event(shop_id, event_type).await;
        self.pipeline.admit_event(&event).await.unwrap();
        event
    }

    async fn attempt(&self, event: &Event, registration: &Registration) -> courier_core::DeliveryAttempt {
        self.store
            .find_attempt(event.id, registration.id)
            .await
            .unwrap()
            .unwrap()
    }
}

async fn target(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn webhook_url(server: &MockServer) -> String {
    format!("{}/webhook", server.uri())
}

// =============================================================================
// Admission
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_one_admission_iteration_fans_out() {
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    h.register(shop.id, "http://a.test/hook".into(), &["order.created"])
        .await;
    h.register(shop.id, "http://b.test/hook".into(), &["order.created", "order.paid"])
        .await;
    h.register(shop.id, "http://c.test/hook".into(), &["order.paid"])
        .await;
    let event = h.event(shop.id, "order.created").await;

    let mut scheduler = h.pipeline.admission_scheduler();
    let tick = scheduler.tick().await.unwrap();

    assert_eq!(
        tick,
        AdmissionTick::Admitted {
            shop_id: shop.id,
            event_id: event.id,
            jobs: 2
        }
    );
    assert_eq!(h.pipeline.shop_depth(shop.id).await.unwrap(), 2);
    assert_eq!(
        h.pipeline.multiplexer().active_shops().await.unwrap(),
        vec![shop.id]
    );
    assert!(h
        .store
        .get_event(event.id)
        .await
        .unwrap()
        .unwrap()
        .queued_at
        .is_some());
    assert_eq!(scheduler.tick().await.unwrap(), AdmissionTick::Idle);
}

#[tokio::test]
async fn test_admission_is_fifo_per_shop_and_alternates_shops() {
    let h = Harness::new(test_config());
    let a = h.shop("a").await;
    let b = h.shop("b").await;
    h.register(a.id, "http://a.test".into(), &["e"]).await;
    h.register(b.id, "http://b.test".into(), &["e"]).await;

    let mut created: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for _ in 0..3 {
        for shop in [&a, &b] {
            let event = h.event(shop.id, "e").await;
            created.entry(shop.id).or_default().push(event.id);
        }
    }

    let mut scheduler = h.pipeline.admission_scheduler();
    let mut admitted: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut sequence = Vec::new();
    for _ in 0..6 {
        match scheduler.tick().await.unwrap() {
            AdmissionTick::Admitted {
                shop_id, event_id, ..
            } => {
                admitted.entry(shop_id).or_default().push(event_id);
                sequence.push(shop_id);
            }
            other => panic!("unexpected tick: {other:?}"),
        }
    }

    assert_eq!(admitted, created);
    // Both shops stay backlogged until the last round, so selection alternates
    for pair in sequence.windows(2).take(4) {
        assert_ne!(pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_round_robin_gives_each_backlogged_shop_its_share() {
    let h = Harness::new(test_config());
    let mut shops = Vec::new();
    for i in 0..3 {
        let shop = h.shop(&format!("shop-{i}")).await;
        h.register(shop.id, "http://x.test".into(), &["e"]).await;
        for _ in 0..10 {
            h.event(shop.id, "e").await;
        }
        shops.push(shop.id);
    }

    let iterations = 9;
    let mut scheduler = h.pipeline.admission_scheduler();
    let mut selected: HashMap<Uuid, usize> = HashMap::new();
    for _ in 0..iterations {
        if let AdmissionTick::Admitted { shop_id, .. } = scheduler.tick().await.unwrap() {
            *selected.entry(shop_id).or_default() += 1;
        }
    }

    for shop in shops {
        assert!(selected.get(&shop).copied().unwrap_or(0) >= iterations / 3);
    }
}

#[test_log::test(tokio::test)]
async fn test_global_backpressure_pauses_and_resumes_admission() {
    let server = target(200).await;
    let mut config = test_config();
    config.backpressure = config.backpressure.with_tenant_thresholds(1_000, 500);
    let h = Harness::new(config);
    let shop = h.shop("busy").await;
    h.register(shop.id, webhook_url(&server), &["e"]).await;

    for _ in 0..10 {
        h.admitted_event(shop.id, "e").await;
    }
    h.event(shop.id, "e").await;
    let mut scheduler = h.pipeline.admission_scheduler();

    // depth 10: admission runs
    assert!(matches!(
        scheduler.tick().await.unwrap(),
        AdmissionTick::Admitted { .. }
    ));
    for _ in 0..49 {
        h.admitted_event(shop.id, "e").await;
    }
    h.event(shop.id, "e").await;

    // depth 60: paused
    assert_eq!(
        scheduler.tick().await.unwrap(),
        AdmissionTick::GlobalBackpressure
    );
    assert!(h.pipeline.global_backpressure().await.unwrap());

    // Drain to 30: still inside the hysteresis band
    let mut worker = h.pipeline.worker(0);
    for _ in 0..30 {
        assert!(matches!(
            worker.tick().await.unwrap(),
            WorkerTick::Delivered { .. }
        ));
    }
    assert_eq!(
        scheduler.tick().await.unwrap(),
        AdmissionTick::GlobalBackpressure
    );

    // Drain to 24: resolved, admission resumes
    for _ in 0..6 {
        worker.tick().await.unwrap();
    }
    assert!(matches!(
        scheduler.tick().await.unwrap(),
        AdmissionTick::Admitted { .. }
    ));
    assert!(!h.pipeline.global_backpressure().await.unwrap());
}

#[tokio::test]
async fn test_admitted_event_without_jobs_is_never_readmitted() {
    // Marking and enqueueing are separate writes; a crash between them
    // leaves the event admitted with nothing queued.
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    h.register(shop.id, "http://a.test".into(), &["e"]).await;
    let event = h.event(shop.id, "e").await;

    h.store
        .mark_event_admitted(event.id, chrono::Utc::now())
        .await
        .unwrap();

    let mut scheduler = h.pipeline.admission_scheduler();
    assert_eq!(scheduler.tick().await.unwrap(), AdmissionTick::Idle);
    assert_eq!(h.pipeline.shop_depth(shop.id).await.unwrap(), 0);
    assert_eq!(
        h.pipeline.admit_event(&event).await.unwrap(),
        AdmissionResult::AlreadyAdmitted
    );
}

// =============================================================================
// Delivery
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_successful_delivery_settles_attempt_and_metrics() {
    let server = target(200).await;
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    let registration = h.register(shop.id, webhook_url(&server), &["e"]).await;
    let event = h.admitted_event(shop.id, "e").await;

    let mut worker = h.pipeline.worker(0);
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Delivered { .. }
    ));

    let attempt = h.attempt(&event, &registration).await;
    assert_eq!(attempt.status, DeliveryStatus::Success);
    assert_eq!(attempt.attempts, 1);
    assert_eq!(attempt.response_code, Some(200));

    let metrics = h.pipeline.metrics().snapshot().await.unwrap();
    assert_eq!(metrics.attempts.total, 1);
    assert_eq!(metrics.attempts.success, 1);
    assert_eq!(metrics.deliveries.success, 1);
    assert_eq!(metrics.latency.samples, 1);

    // Queue drained: the shop leaves the active set on the next miss
    assert_eq!(
        worker.tick().await.unwrap(),
        WorkerTick::NoJob {
            shop_id: shop.id,
            drained: true
        }
    );
    assert!(h.pipeline.multiplexer().active_shops().await.unwrap().is_empty());
    assert_eq!(worker.tick().await.unwrap(), WorkerTick::Idle);
}

#[test_log::test(tokio::test)]
async fn test_five_failures_kill_attempt_open_circuit_and_defer_next_job() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(5)
        .expect(5)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    let registration = h.register(shop.id, webhook_url(&server), &["e"]).await;
    let first = h.admitted_event(shop.id, "e").await;
    let mut worker = h.pipeline.worker(0);

    for n in 1..=5u32 {
        let tick = worker.tick().await.unwrap();
        let WorkerTick::Failed { retry, .. } = tick else {
            panic!("expected failure, got {tick:?}");
        };
        if n < 5 {
            assert!(matches!(retry, JobFailureOutcome::WillRetry { attempts_made, .. } if attempts_made == n));
        } else {
            assert_eq!(retry, JobFailureOutcome::Exhausted { attempts_made: 5 });
        }
        assert_eq!(h.attempt(&first, &registration).await.attempts, n);
    }

    let attempt = h.attempt(&first, &registration).await;
    assert_eq!(attempt.status, DeliveryStatus::Dead);
    assert_eq!(attempt.response_code, Some(500));
    assert_eq!(attempt.response_body.as_deref(), Some("boom"));
    assert_eq!(
        h.pipeline.circuit().state(registration.id).await.unwrap(),
        CircuitState::Open
    );
    assert_eq!(h.pipeline.delivery_counts().await.unwrap().dead, 1);

    // Sixth job is deferred without touching its attempt row
    let second = h.admitted_event(shop.id, "e").await;
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Deferred { .. }
    ));
    let pending = h.attempt(&second, &registration).await;
    assert_eq!(pending.status, DeliveryStatus::Pending);
    assert_eq!(pending.attempts, 0);
    assert_eq!(h.pipeline.attempt_counts().await.unwrap().total, 5);

    // The circuit closes by itself after the cooldown and the job runs
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(
        h.pipeline.circuit().state(registration.id).await.unwrap(),
        CircuitState::Closed
    );
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Delivered { .. }
    ));
    assert_eq!(
        h.attempt(&second, &registration).await.status,
        DeliveryStatus::Success
    );
}

#[tokio::test]
async fn test_transport_failure_records_error_text() {
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    // Nothing listens on port 9 on the loopback interface
    let registration = h
        .register(shop.id, "http://127.0.0.1:9/webhook".into(), &["e"])
        .await;
    let event = h.admitted_event(shop.id, "e").await;

    let mut worker = h.pipeline.worker(0);
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Failed { .. }
    ));

    let attempt = h.attempt(&event, &registration).await;
    assert_eq!(attempt.status, DeliveryStatus::Failed);
    assert_eq!(attempt.attempts, 1);
    assert_eq!(attempt.response_code, None);
    assert!(attempt.response_body.is_some());
    assert_eq!(
        h.pipeline.circuit().failure_count(registration.id).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_settled_attempt_is_frozen_against_duplicate_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    let registration = h.register(shop.id, webhook_url(&server), &["e"]).await;
    let event = h.admitted_event(shop.id, "e").await;
    let mut worker = h.pipeline.worker(0);
    worker.tick().await.unwrap();

    // A duplicate job for the same pair must not send again
    h.pipeline
        .multiplexer()
        .queue(shop.id)
        .add(WebhookJob {
            event_id: event.id,
            shop_id: shop.id,
            registration_id: registration.id,
        })
        .await
        .unwrap();

    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::AlreadySettled { .. }
    ));
    let attempt = h.attempt(&event, &registration).await;
    assert_eq!(attempt.attempts, 1);
    assert_eq!(attempt.status, DeliveryStatus::Success);
    assert_eq!(h.store.attempt_count(), 1);
}

#[tokio::test]
async fn test_success_does_not_reset_circuit_failures() {
    let server = target(200).await;
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    let registration = h.register(shop.id, webhook_url(&server), &["e"]).await;

    for _ in 0..3 {
        h.pipeline
            .circuit()
            .record_failure(registration.id)
            .await
            .unwrap();
    }
    h.admitted_event(shop.id, "e").await;
    let mut worker = h.pipeline.worker(0);
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Delivered { .. }
    ));

    // Known asymmetry: only the window expiry clears the counter
    assert_eq!(
        h.pipeline
            .circuit()
            .failure_count(registration.id)
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn test_unroutable_jobs_are_dropped() {
    let h = Harness::new(test_config());
    let shop = h.shop("acme").await;
    let paid_only = h.register(shop.id, "http://a.test".into(), &["order.paid"]).await;
    let event = h.event(shop.id, "order.created").await;
    let queue = h.pipeline.multiplexer().queue(shop.id);
    h.pipeline.multiplexer().mark_active(shop.id).await.unwrap();

    queue
        .add(WebhookJob {
            event_id: event.id,
            shop_id: shop.id,
            registration_id: paid_only.id,
        })
        .await
        .unwrap();
    queue
        .add(WebhookJob {
            event_id: Uuid::now_v7(),
            shop_id: shop.id,
            registration_id: paid_only.id,
        })
        .await
        .unwrap();
    queue
        .add(WebhookJob {
            event_id: event.id,
            shop_id: shop.id,
            registration_id: Uuid::now_v7(),
        })
        .await
        .unwrap();

    let mut worker = h.pipeline.worker(0);
    let mut reasons = Vec::new();
    for _ in 0..3 {
        match worker.tick().await.unwrap() {
            WorkerTick::Dropped { reason, .. } => reasons.push(reason),
            other => panic!("unexpected tick: {other:?}"),
        }
    }

    assert_eq!(
        reasons,
        vec![
            JobDrop::SubscriptionMismatch,
            JobDrop::EventNotFound,
            JobDrop::RegistrationNotFound
        ]
    );
    assert_eq!(h.pipeline.shop_depth(shop.id).await.unwrap(), 0);
    assert_eq!(h.store.attempt_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_expired_lease_lets_another_worker_claim() {
    let server = target(200).await;
    let mut config = test_config();
    config.delivery = config
        .delivery
        .with_request_timeout(Duration::from_millis(50));
    config.multiplexer = config
        .multiplexer
        .with_lock_duration(Duration::from_millis(100));
    let h = Harness::new(config);
    let shop = h.shop("acme").await;
    let registration = h.register(shop.id, webhook_url(&server), &["e"]).await;
    let event = h.admitted_event(shop.id, "e").await;

    // A first consumer claims and then stalls past its lease
    let stalled = h
        .pipeline
        .multiplexer()
        .consumer(shop.id)
        .next_job("stalled-worker")
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut worker = h.pipeline.worker(0);
    assert!(matches!(
        worker.tick().await.unwrap(),
        WorkerTick::Delivered { job_id, .. } if job_id == stalled.id
    ));
    assert_eq!(
        h.attempt(&event, &registration).await.status,
        DeliveryStatus::Success
    );

    let late = h
        .pipeline
        .multiplexer()
        .queue(shop.id)
        .complete(stalled.id, "stalled-worker")
        .await;
    assert!(late.is_err());
}

// =============================================================================
// Running loops
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_spawned_pipeline_delivers_backlog() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(12)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.worker = config.worker.with_concurrency(3);
    let h = Harness::new(config);
    for i in 0..3 {
        let shop = h.shop(&format!("shop-{i}")).await;
        h.register(shop.id, webhook_url(&server), &["e"]).await;
        for _ in 0..4 {
            h.event(shop.id, "e").await;
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.pipeline.spawn(shutdown_rx);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if h.pipeline.delivery_counts().await.unwrap().success == 12 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "backlog not delivered in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown_tx.send(true).unwrap();
    handles.join().await.unwrap();
    assert_eq!(h.store.unadmitted_event_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_worker_error_is_fatal_by_default() {
    let h = Harness::new(test_config());
    // Active set key holding the wrong type makes every iteration fail
    h.pipeline
        .state()
        .set("active_shop_queues", "corrupt", None)
        .await
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.pipeline.worker(0).run(shutdown_rx),
    )
    .await
    .unwrap();

    assert!(result.is_err());
}

#[tokio::test]
async fn test_error_boundary_keeps_worker_alive() {
    let mut config = test_config();
    config.worker = config.worker.with_error_boundary(true);
    let h = Harness::new(config);
    h.pipeline
        .state()
        .set("active_shop_queues", "corrupt", None)
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(h.pipeline.worker(0).run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());

    shutdown_tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());
}

#[test_log::test(tokio::test)]
async fn test_failed_admission_loop_ends_join_while_workers_run() {
    let h = Harness::new(test_config());
    // Only the admission loop reads the global flag; a set under that key breaks it
    h.pipeline
        .state()
        .sadd("backpressure:global:active", "corrupt")
        .await
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = h.pipeline.spawn(shutdown_rx);
    assert_eq!(handles.len(), 2);

    let result = tokio::time::timeout(Duration::from_secs(2), handles.join())
        .await
        .expect("join should return once a loop fails");

    assert!(matches!(result, Err(PipelineError::Admission(_))));
}
