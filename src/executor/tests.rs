//! Executor Module Tests
//!
//! ## Test Scopes
//! - **Registry**: Verifies task registration, lookup, and execution mechanics.
//! - **Data Types**: Task name resolution and argument validation.
//! - **Dispatcher**: Submit returns immediately, polling unknown or queued ids.
//! - **Worker**: Every delivery ends in a terminal record, including panics and bad input.
//! - **HTTP**: Handlers over in-memory backends.

#[cfg(test)]
mod tests {
    use crate::broker::memory::MemoryBroker;
    use crate::broker::types::{Broker, BrokerError, TaskMessage};
    use crate::executor::dispatcher::TaskDispatcher;
    use crate::executor::executor::TaskExecutor;
    use crate::executor::handlers::*;
    use crate::executor::protocol::*;
    use crate::executor::registry::TaskHandlerRegistry;
    use crate::executor::types::*;
    use crate::results::memory::MemoryResultStore;
    use crate::results::types::{ResultStore, TaskState};
    use crate::stats::engine::StatsEngine;
    use crate::stats::lock::LocalSingleFlight;
    use crate::stats::store::{MemoryOrderStore, OrderStore};
    use crate::stats::types::{Order, OrderItem};
    use axum::{extract::Path, http::StatusCode, Extension, Json};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const NAME: &str = "calculate_order_stats";

    struct Harness {
        broker: Arc<MemoryBroker>,
        results: Arc<MemoryResultStore>,
        registry: Arc<TaskHandlerRegistry>,
        dispatcher: Arc<TaskDispatcher>,
        executor: Arc<TaskExecutor>,
    }

    fn harness(visibility_timeout: Duration) -> Harness {
        let broker = Arc::new(MemoryBroker::new(visibility_timeout));
        let results = Arc::new(MemoryResultStore::new());
        let registry = TaskHandlerRegistry::new();
        let dispatcher = TaskDispatcher::new(broker.clone(), results.clone());
        let executor = TaskExecutor::new(broker.clone(), results.clone(), registry.clone(), 2);
        Harness {
            broker,
            results,
            registry,
            dispatcher,
            executor,
        }
    }

    fn order(id: &str, quantity: u64, total: f64) -> Order {
        Order {
            id: id.to_string(),
            total: Some(total),
            created_at: Utc::now() - chrono::Duration::seconds(1),
            items: vec![OrderItem {
                id: format!("{}-item", id),
                order_id: id.to_string(),
                quantity,
            }],
        }
    }

    async fn wait_for_terminal(dispatcher: &TaskDispatcher, task_id: &TaskId) -> TaskState {
        for _ in 0..200 {
            let state = dispatcher.poll(task_id).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached a terminal state", task_id);
    }

    // ============================================================
    // TEST 1: TaskHandlerRegistry - Registration and Execution
    // ============================================================

    #[tokio::test]
    async fn test_registry_register_and_execute() {
        // ARRANGE: Create registry and call counter
        let registry = TaskHandlerRegistry::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        // ACT: Register handler
        registry.register(TaskKind::CalculateOrderStats, move |_request| {
            let count = call_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            }
        });

        // ASSERT: Handler is registered
        assert!(registry.has_handler(TaskKind::CalculateOrderStats));
        assert_eq!(registry.handler_count(), 1);
        assert!(registry.missing_kinds().is_empty());

        // ACT: Execute task
        let result = registry.execute(TaskRequest::CalculateOrderStats).await;

        // ASSERT: Handler was called and its value returned
        assert_eq!(result.unwrap(), json!({"ok": true}));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_registry_without_handler_returns_error() {
        let registry = TaskHandlerRegistry::new();

        assert_eq!(registry.missing_kinds(), vec![TaskKind::CalculateOrderStats]);

        let result = registry.execute(TaskRequest::CalculateOrderStats).await;
        assert_eq!(
            result.unwrap_err(),
            TaskError::NoHandler(TaskKind::CalculateOrderStats)
        );
    }

    #[tokio::test]
    async fn test_registry_handler_can_fail() {
        let registry = TaskHandlerRegistry::new();

        registry.register(TaskKind::CalculateOrderStats, |_request| async {
            Err(TaskError::Execution("Intentional error".to_string()))
        });

        let result = registry.execute(TaskRequest::CalculateOrderStats).await;

        assert!(result.unwrap_err().to_string().contains("Intentional error"));
    }

    #[tokio::test]
    async fn test_registry_overwrite_handler() {
        let registry = TaskHandlerRegistry::new();

        registry.register(TaskKind::CalculateOrderStats, |_| async { Ok(json!(1)) });
        registry.register(TaskKind::CalculateOrderStats, |_| async { Ok(json!(2)) });

        assert_eq!(registry.handler_count(), 1);
        let result = registry.execute(TaskRequest::CalculateOrderStats).await;
        assert_eq!(result.unwrap(), json!(2));
    }

    // ============================================================
    // TEST 2: Task names and arguments
    // ============================================================

    #[test]
    fn test_task_kind_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(TaskKind::CalculateOrderStats.to_string(), NAME);
        assert_eq!(TaskKind::from_name("calculateOrderStats"), None);
    }

    #[test]
    fn test_decode_rejects_unknown_task() {
        let err = TaskRequest::decode("send_invoices", &[]).unwrap_err();
        assert_eq!(err, TaskError::UnknownTask("send_invoices".to_string()));
    }

    #[test]
    fn test_decode_rejects_unexpected_arguments() {
        let err = TaskRequest::decode(NAME, &[json!(42)]).unwrap_err();
        assert!(matches!(err, TaskError::InvalidArguments { .. }));

        let request = TaskRequest::decode(NAME, &[]).unwrap();
        assert_eq!(request, TaskRequest::CalculateOrderStats);
        assert_eq!(request.kind(), TaskKind::CalculateOrderStats);
        assert!(request.args().is_empty());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(serde_json::to_value(&a).unwrap(), Value::String(a.0.clone()));
    }

    // ============================================================
    // TEST 3: Dispatcher
    // ============================================================

    #[tokio::test]
    async fn test_submit_publishes_and_records_pending() {
        let h = harness(Duration::from_secs(30));

        let task_id = h.dispatcher.submit(NAME, vec![]).await.unwrap();

        assert_eq!(h.broker.ready_len().await, 1);
        assert_eq!(h.dispatcher.poll(&task_id).await.unwrap(), TaskState::Pending);
        let record = h.results.get(&task_id).await.unwrap().unwrap();
        assert_eq!(record.name, NAME);
    }

    #[tokio::test]
    async fn test_poll_unknown_id_reads_pending() {
        let h = harness(Duration::from_secs(30));

        let state = h.dispatcher.poll(&TaskId("never-submitted".to_string())).await;

        assert_eq!(state.unwrap(), TaskState::Pending);
    }

    #[tokio::test]
    async fn test_submit_with_broker_down_issues_no_id() {
        let h = harness(Duration::from_secs(30));
        h.broker.set_online(false);

        let result = h.dispatcher.submit(NAME, vec![]).await;

        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
        assert!(h.results.is_empty());
    }

    #[tokio::test]
    async fn test_submit_survives_result_store_outage() {
        let h = harness(Duration::from_secs(30));
        h.results.set_online(false);

        let task_id = h.dispatcher.submit(NAME, vec![]).await;

        assert!(task_id.is_ok());
        assert_eq!(h.broker.ready_len().await, 1);
    }

    // ============================================================
    // TEST 4: Worker - process one delivery
    // ============================================================

    #[tokio::test]
    async fn test_process_records_success_and_acks() {
        let h = harness(Duration::from_secs(30));
        h.registry
            .register(TaskKind::CalculateOrderStats, |_| async { Ok(json!({"n": 1})) });

        let task_id = h.dispatcher.submit(NAME, vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.executor.process(delivery).await;

        assert_eq!(
            h.dispatcher.poll(&task_id).await.unwrap(),
            TaskState::Success {
                result: json!({"n": 1})
            }
        );
        assert_eq!(h.broker.in_flight_len(), 0);
        assert_eq!(h.results.get(&task_id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_process_records_handler_failure() {
        let h = harness(Duration::from_secs(30));
        h.registry.register(TaskKind::CalculateOrderStats, |_| async {
            Err(TaskError::Execution("database unreachable".to_string()))
        });

        let task_id = h.dispatcher.submit(NAME, vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.executor.process(delivery).await;

        match h.dispatcher.poll(&task_id).await.unwrap() {
            TaskState::Failure { error } => assert!(error.contains("database unreachable")),
            other => panic!("expected FAILURE, got {:?}", other),
        }
        assert_eq!(h.broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_process_contains_panics() {
        let h = harness(Duration::from_secs(30));
        h.registry.register(TaskKind::CalculateOrderStats, |_| async {
            if true {
                panic!("division by zero");
            }
            Ok(Value::Null)
        });

        let task_id = h.dispatcher.submit(NAME, vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.executor.process(delivery).await;

        match h.dispatcher.poll(&task_id).await.unwrap() {
            TaskState::Failure { error } => {
                assert!(error.contains("panicked"));
                assert!(error.contains("division by zero"));
            }
            other => panic!("expected FAILURE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_unknown_task_fails() {
        let h = harness(Duration::from_secs(30));

        let task_id = h.dispatcher.submit("send_invoices", vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.executor.process(delivery).await;

        match h.dispatcher.poll(&task_id).await.unwrap() {
            TaskState::Failure { error } => assert!(error.contains("unknown task")),
            other => panic!("expected FAILURE, got {:?}", other),
        }
        assert_eq!(h.broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_process_invalid_arguments_fail() {
        let h = harness(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        h.registry.register(TaskKind::CalculateOrderStats, move |_| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let task_id = h.dispatcher.submit(NAME, vec![json!("x")]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.executor.process(delivery).await;

        assert!(matches!(
            h.dispatcher.poll(&task_id).await.unwrap(),
            TaskState::Failure { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivery_of_finished_task_is_skipped() {
        let h = harness(Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        h.registry.register(TaskKind::CalculateOrderStats, move |_| {
            let calls = calls_clone.clone();
            async move {
                Ok(json!(calls.fetch_add(1, Ordering::SeqCst)))
            }
        });

        // The same message delivered twice, e.g. after a lost ack.
        let message = TaskMessage::new(NAME, vec![]);
        let task_id = message.id.clone();
        h.broker.publish(message.clone()).await.unwrap();
        h.broker.publish(message).await.unwrap();

        let first = h.broker.receive().await.unwrap();
        h.executor.process(first).await;
        let second = h.broker.receive().await.unwrap();
        h.executor.process(second).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.dispatcher.poll(&task_id).await.unwrap(),
            TaskState::Success { result: json!(0) }
        );
        assert_eq!(h.broker.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_result_store_outage_leaves_delivery_unacked() {
        let h = harness(Duration::from_secs(30));
        h.registry
            .register(TaskKind::CalculateOrderStats, |_| async { Ok(Value::Null) });

        h.dispatcher.submit(NAME, vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();
        h.results.set_online(false);
        h.executor.process(delivery).await;

        assert_eq!(h.broker.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_long_task_keeps_its_lease() {
        let h = harness(Duration::from_millis(60));
        h.registry.register(TaskKind::CalculateOrderStats, |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        });

        h.dispatcher.submit(NAME, vec![]).await.unwrap();
        let delivery = h.broker.receive().await.unwrap();

        let executor = h.executor.clone();
        let worker = tokio::spawn(async move { executor.process(delivery).await });

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert_eq!(h.broker.requeue_expired().await.unwrap(), 0);
        }

        worker.await.unwrap();
        assert_eq!(h.broker.in_flight_len(), 0);
        assert_eq!(h.broker.ready_len().await, 0);
    }

    // ============================================================
    // TEST 5: Worker pool end to end
    // ============================================================

    #[tokio::test]
    async fn test_start_requires_every_handler() {
        let h = harness(Duration::from_secs(30));

        let result = h.executor.clone().start();

        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_submitted_stats_task_completes() {
        let h = harness(Duration::from_secs(30));
        let orders = Arc::new(MemoryOrderStore::new());
        orders.insert_order(order("o-1", 2, 10.0)).await;
        orders.insert_order(order("o-2", 3, 15.5)).await;

        let engine = Arc::new(StatsEngine::new(
            orders.clone(),
            Arc::new(LocalSingleFlight::new()),
        ));
        engine.register(&h.registry);
        let handles = h.executor.clone().start().unwrap();

        let task_id = h
            .dispatcher
            .submit_request(&TaskRequest::CalculateOrderStats)
            .await
            .unwrap();
        let state = wait_for_terminal(&h.dispatcher, &task_id).await;

        assert_eq!(
            state,
            TaskState::Success {
                result: json!({"totalOrders": 2, "totalUnits": 5, "totalAmount": 25.5})
            }
        );
        assert_eq!(orders.checkpoints().await.len(), 1);

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abandoned_delivery_is_redelivered() {
        let h = harness(Duration::from_millis(50));
        h.registry
            .register(TaskKind::CalculateOrderStats, |_| async { Ok(json!("done")) });

        let task_id = h.dispatcher.submit(NAME, vec![]).await.unwrap();

        // A worker that claims the task and dies without acking.
        let lost = h.broker.receive().await.unwrap();
        drop(lost);

        let handles = h.executor.clone().start().unwrap();
        let state = wait_for_terminal(&h.dispatcher, &task_id).await;

        assert_eq!(state, TaskState::Success { result: json!("done") });
        for handle in handles {
            handle.abort();
        }
    }

    // ============================================================
    // TEST 6: HTTP handlers
    // ============================================================

    #[tokio::test]
    async fn test_http_submit_and_poll() {
        let h = harness(Duration::from_secs(30));

        let (status, Json(submitted)) = handle_submit_task(
            Extension(h.dispatcher.clone()),
            Json(SubmitTaskRequest {
                name: NAME.to_string(),
                args: vec![],
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, Json(polled)) = handle_get_task_status(
            Extension(h.dispatcher.clone()),
            Path(submitted.task_id.0.clone()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(polled.task_id, submitted.task_id);
        assert_eq!(
            serde_json::to_value(&polled).unwrap(),
            json!({"task_id": submitted.task_id.0, "status": "PENDING"})
        );
    }

    #[tokio::test]
    async fn test_http_submit_with_broker_down_is_503() {
        let h = harness(Duration::from_secs(30));
        h.broker.set_online(false);

        let err = handle_submit_stats(Extension(h.dispatcher.clone()))
            .await
            .unwrap_err();

        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_http_latest_stats() {
        let orders = Arc::new(MemoryOrderStore::new());
        let store: Arc<dyn OrderStore> = orders.clone();

        let (_, Json(empty)) = handle_latest_stats(Extension(store.clone())).await.unwrap();
        assert_eq!(
            empty,
            StatsResponse {
                total_orders: 0,
                total_units: 0,
                total_amount: 0.0,
                last_updated: None,
            }
        );

        orders.insert_order(order("o-1", 4, 12.25)).await;
        let engine = StatsEngine::new(store.clone(), Arc::new(LocalSingleFlight::new()));
        let checkpoint = engine.run().await.unwrap();

        let (_, Json(latest)) = handle_latest_stats(Extension(store)).await.unwrap();
        assert_eq!(latest.total_orders, 1);
        assert_eq!(latest.total_units, 4);
        assert_eq!(latest.total_amount, 12.25);
        assert_eq!(latest.last_updated, Some(checkpoint.updated_at));
    }
}
