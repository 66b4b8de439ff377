//! Integration tests for the full dispatch pipeline.
//!
//! Tests: event log → ListenerWorker → CursorLock → QueueManager → JobHandler
//!
//! Verifies:
//! - Listener batches enqueue jobs that the queue drains
//! - Tenants get a bounded share of every tick
//! - Competing managers never run the same job twice

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use lattice_core::{ListenerId, TenantId};
    use lattice_events::{EventCursor, EventListener, LoggedEvent, ProcessOutcome, process_in_order};

    use crate::clock::{SharedClock, TokioClock};
    use crate::config::{CursorLockConfig, DebounceConfig, QueueConfig};
    use crate::cursor_lock::{CursorLock, InMemoryCursorStore};
    use crate::jobs::{InMemoryQueueStore, JobContext, QueueManager, SendOptions};
    use crate::workers::ListenerWorker;

    fn clock() -> SharedClock {
        Arc::new(TokioClock::new())
    }

    /// Enqueues one embedding job per logged message.
    struct EmbeddingListener {
        id: ListenerId,
        log: Mutex<Vec<LoggedEvent>>,
        queue: QueueManager<InMemoryQueueStore>,
    }

    #[async_trait]
    impl EventListener for EmbeddingListener {
        fn listener_id(&self) -> &ListenerId {
            &self.id
        }

        async fn process_events(&self, cursor: EventCursor) -> ProcessOutcome {
            let events = self.log.lock().unwrap().clone();
            process_in_order(&events, cursor, |event| async move {
                let data = serde_json::json!({
                    "tenantId": event.tenant_id.as_str(),
                    "eventId": event.id.position(),
                });
                self.queue
                    .send_json("embeddings", data, SendOptions::default())
                    .await
                    .map(|_| ())
            })
            .await
        }
    }

    fn message(id: u64, tenant: &str) -> LoggedEvent {
        LoggedEvent {
            id: EventCursor::new(id),
            tenant_id: TenantId::new(tenant).unwrap(),
            event_type: "message_created".to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn listener_batches_feed_the_queue() {
        lattice_observability::init_for_tests();
        let clock = clock();
        let queue = QueueManager::with_clock(
            Arc::new(InMemoryQueueStore::new()),
            QueueConfig::default(),
            clock.clone(),
        )
        .unwrap();

        let embedded = Arc::new(Mutex::new(Vec::new()));
        let e = embedded.clone();
        queue
            .register_handler("embeddings", move |job: JobContext| {
                let e = e.clone();
                async move {
                    e.lock().unwrap().push(job.data["eventId"].as_u64().unwrap_or(0));
                    anyhow::Ok(())
                }
            })
            .unwrap();
        queue.start().unwrap();

        let listener = Arc::new(EmbeddingListener {
            id: ListenerId::new("embedding-listener").unwrap(),
            log: Mutex::new(Vec::new()),
            queue: queue.clone(),
        });
        let lock = Arc::new(
            CursorLock::register_with_clock(
                Arc::new(InMemoryCursorStore::new()),
                listener.id.clone(),
                CursorLockConfig::default(),
                clock.clone(),
            )
            .await
            .unwrap(),
        );
        let worker = ListenerWorker::spawn(listener.clone(), lock.clone(), DebounceConfig::default());

        for (id, tenant) in [(1, "ws1"), (2, "ws2"), (3, "ws1")] {
            listener.log.lock().unwrap().push(message(id, tenant));
            worker.handle();
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        worker.shutdown().await;
        queue.stop().await;

        let mut seen = embedded.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(lock.cursor().await.unwrap(), EventCursor::new(3));
        assert_eq!(queue.queue_stats("embeddings").await.unwrap().completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_tenant_gets_a_share_of_each_tick() {
        let queue = QueueManager::with_clock(
            Arc::new(InMemoryQueueStore::new()),
            QueueConfig {
                claim_batch_size: 2,
                ..QueueConfig::default()
            },
            clock(),
        )
        .unwrap();

        let per_tenant: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let p = per_tenant.clone();
        queue
            .register_handler("digest", move |job: JobContext| {
                let p = p.clone();
                async move {
                    *p.lock().unwrap().entry(job.tenant_id.to_string()).or_default() += 1;
                    anyhow::Ok(())
                }
            })
            .unwrap();

        for _ in 0..20 {
            queue
                .send_json("digest", serde_json::json!({"tenantId": "busy"}), SendOptions::default())
                .await
                .unwrap();
        }
        queue
            .send_json("digest", serde_json::json!({"tenantId": "quiet"}), SendOptions::default())
            .await
            .unwrap();

        queue.tick().await;

        let counts = per_tenant.lock().unwrap().clone();
        assert_eq!(counts.get("busy"), Some(&2));
        assert_eq!(counts.get("quiet"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn competing_managers_never_share_a_job() {
        let store = Arc::new(InMemoryQueueStore::new());
        let clock = clock();
        let runs = Arc::new(AtomicUsize::new(0));

        let mut managers = Vec::new();
        for _ in 0..2 {
            let manager = QueueManager::with_clock(
                store.clone(),
                QueueConfig {
                    claim_batch_size: 3,
                    ..QueueConfig::default()
                },
                clock.clone(),
            )
            .unwrap();
            let r = runs.clone();
            manager
                .register_handler("Q", move |_job: JobContext| {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        anyhow::Ok(())
                    }
                })
                .unwrap();
            managers.push(manager);
        }

        for i in 0..12 {
            let tenant = format!("ws{}", i % 3);
            managers[0]
                .send_json("Q", serde_json::json!({"tenantId": tenant}), SendOptions::default())
                .await
                .unwrap();
        }

        for manager in &managers {
            manager.start().unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        for manager in &managers {
            manager.stop().await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 12);
        assert_eq!(managers[0].queue_stats("Q").await.unwrap().completed, 12);
    }
}
