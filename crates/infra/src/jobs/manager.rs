//! Queue manager: leases tokens on every tick and drains each token's jobs.
//!
//! ## Flow
//!
//! 1. The interval driver fires `tick()`.
//! 2. A tick leases up to `token_batch_size` `(queue, tenant)` tokens and runs
//!    one worker per token concurrently.
//! 3. A worker claims up to `claim_batch_size` jobs for its pair, renews the
//!    whole batch's claims on a single timer, runs the jobs with at most
//!    `processing_concurrency` in flight, then releases the token.
//! 4. Each job is completed, retried with exponential backoff, or
//!    dead-lettered once `max_retries` failures have been recorded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use lattice_core::{JobId, TenantId, calculate_backoff};

use super::handler::{JobContext, JobHandler};
use super::store::QueueStore;
use super::ticker::Ticker;
use super::types::{ClaimRequest, Job, LeaseRequest, NewJob, QueueStats, Token};
use crate::clock::{SharedClock, add_duration, system_clock};
use crate::config::{ConfigError, QueueConfig};
use crate::error::StoreError;
use crate::lease::LeaseRenewer;

/// Error recorded when a job's queue has no registered handler.
pub const NO_HANDLER_ERROR: &str = "No handler registered for queue";

/// Error recorded when a handler panics.
pub const HANDLER_PANICKED_ERROR: &str = "handler panicked";

/// Longest accepted recurring-send interval (one year).
pub const MAX_SCHEDULE_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("cannot register handler for {0}: queue manager already started")]
    HandlerRegistrationClosed(String),

    #[error("handler already registered for queue {0}")]
    DuplicateHandler(String),

    #[error("queue {0} is already scheduled")]
    AlreadyScheduled(String),

    #[error("queue manager already started")]
    AlreadyStarted,

    #[error("invalid queue configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options for [`QueueManager::send`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Earliest processing time; defaults to now.
    pub process_after: Option<DateTime<Utc>>,
}

impl SendOptions {
    pub fn delayed_until(at: DateTime<Utc>) -> Self {
        Self {
            process_after: Some(at),
        }
    }
}

/// Orchestrates the token pool, the job store and the interval driver.
///
/// Cheap to clone; clones share the same manager.
pub struct QueueManager<S: QueueStore> {
    inner: Arc<Inner<S>>,
}

impl<S: QueueStore> Clone for QueueManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S: QueueStore> {
    store: Arc<S>,
    config: QueueConfig,
    clock: SharedClock,
    worker_id: String,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    started: AtomicBool,
    stopping: AtomicBool,
    ticker: Mutex<Option<Ticker>>,
    schedules: Mutex<HashMap<String, CancellationToken>>,
    scheduled_tasks: TaskTracker,
    workers: TaskTracker,
}

impl<S: QueueStore> QueueManager<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_clock(store, config, system_clock())
    }

    pub fn with_clock(
        store: Arc<S>,
        config: QueueConfig,
        clock: SharedClock,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let worker_id = format!("worker-{}", uuid::Uuid::new_v4());
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                clock,
                worker_id,
                handlers: RwLock::new(HashMap::new()),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                ticker: Mutex::new(None),
                schedules: Mutex::new(HashMap::new()),
                scheduled_tasks: TaskTracker::new(),
                workers: TaskTracker::new(),
            }),
        })
    }

    /// Identity stamped into `leased_by` / `claimed_by`.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Register the handler for `queue_name`. Only allowed before `start()`.
    pub fn register_handler<H>(&self, queue_name: &str, handler: H) -> Result<(), QueueError>
    where
        H: JobHandler,
    {
        if self.inner.started.load(Ordering::SeqCst) {
            return Err(QueueError::HandlerRegistrationClosed(queue_name.to_string()));
        }
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(queue_name) {
            return Err(QueueError::DuplicateHandler(queue_name.to_string()));
        }
        handlers.insert(queue_name.to_string(), Arc::new(handler));
        debug!(queue = queue_name, "handler registered");
        Ok(())
    }

    /// Enqueue a job. `data` must carry a non-empty tenant id under the
    /// configured tenant field.
    pub async fn send<T>(
        &self,
        queue_name: &str,
        data: &T,
        options: SendOptions,
    ) -> Result<JobId, QueueError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        self.send_json(queue_name, data, options).await
    }

    #[instrument(skip(self, queue_name, data, options), fields(queue = queue_name, job_id, tenant_id), err)]
    pub async fn send_json(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: SendOptions,
    ) -> Result<JobId, QueueError> {
        self.inner.send_json(queue_name, data, options).await
    }

    /// Enqueue `data` on `queue_name` every `interval_secs`, starting one
    /// interval from now. In-process only: schedules do not survive restarts.
    pub fn schedule(
        &self,
        queue_name: &str,
        interval_secs: u64,
        data: serde_json::Value,
    ) -> Result<(), QueueError> {
        if interval_secs == 0 || interval_secs > MAX_SCHEDULE_INTERVAL_SECS {
            return Err(QueueError::Validation(format!(
                "schedule interval must be between 1 and {MAX_SCHEDULE_INTERVAL_SECS} seconds"
            )));
        }
        self.inner.extract_tenant(&data)?;
        let period = Duration::from_secs(interval_secs);
        let Some(first_fire) = Instant::now().checked_add(period) else {
            return Err(QueueError::Validation(format!(
                "schedule interval of {interval_secs}s is not representable"
            )));
        };

        let mut schedules = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if schedules.contains_key(queue_name) {
            return Err(QueueError::AlreadyScheduled(queue_name.to_string()));
        }

        let cancel = CancellationToken::new();
        schedules.insert(queue_name.to_string(), cancel.clone());

        let inner = Arc::downgrade(&self.inner);
        let queue = queue_name.to_string();
        let span = info_span!("schedule", queue = %queue, interval_secs);
        self.inner.scheduled_tasks.spawn(
            async move {
                let mut ticks = tokio::time::interval_at(first_fire, period);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    let Some(inner) = inner.upgrade() else { break };
                    match inner
                        .send_json(&queue, data.clone(), SendOptions::default())
                        .await
                    {
                        Ok(job_id) => debug!(%job_id, "scheduled job sent"),
                        Err(e) => warn!(error = %e, "scheduled send failed"),
                    }
                }
            }
            .instrument(span),
        );

        info!(queue = queue_name, interval_secs, "recurring job scheduled");
        Ok(())
    }

    /// Start the interval driver. Handlers are frozen from here on.
    pub fn start(&self) -> Result<(), QueueError> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyStarted);
        }

        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let ticker = Ticker::start(
            self.inner.config.poll_interval,
            self.inner.config.max_concurrent_ticks,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.tick().await;
                    }
                }
            },
        );
        *self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ticker);

        info!(
            worker_id = %self.inner.worker_id,
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "queue manager started"
        );
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Cancels schedules, stops new ticks, then waits for in-flight ticks and
    /// token workers up to `shutdown_timeout`. Work still running after the
    /// deadline is abandoned; its claims expire on their own.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(worker_id = %self.inner.worker_id, "queue manager stopping");

        let schedules: Vec<CancellationToken> = self
            .inner
            .schedules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, cancel)| cancel)
            .collect();
        for cancel in schedules {
            cancel.cancel();
        }
        self.inner.scheduled_tasks.close();

        let ticker = self
            .inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = &ticker {
            ticker.stop();
        }

        let deadline = Instant::now() + self.inner.config.shutdown_timeout;
        let workers = self.inner.workers.clone();
        let drained = tokio::time::timeout_at(deadline, async {
            if let Some(ticker) = &ticker {
                ticker.drain().await;
            }
            workers.close();
            workers.wait().await;
        })
        .await;

        match drained {
            Ok(()) => info!(worker_id = %self.inner.worker_id, "queue manager stopped"),
            Err(_) => warn!(
                worker_id = %self.inner.worker_id,
                active_workers = self.inner.workers.len(),
                timeout_ms = self.inner.config.shutdown_timeout.as_millis() as u64,
                "shutdown timed out; abandoning active workers"
            ),
        }
    }

    /// Run one tick inline, exactly as the interval driver does.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.store.get_job(job_id).await?)
    }

    pub async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, QueueError> {
        let now = self.inner.clock.now();
        Ok(self.inner.store.queue_stats(queue_name, now).await?)
    }

    pub async fn list_dead_letters(
        &self,
        queue_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.store.list_dead_letters(queue_name, limit).await?)
    }

    /// Make a dead-lettered job claimable again with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, job_id: JobId) -> Result<bool, QueueError> {
        let now = self.inner.clock.now();
        let requeued = self.inner.store.requeue_dead_letter(job_id, now).await?;
        if requeued {
            info!(%job_id, "dead-lettered job requeued");
        }
        Ok(requeued)
    }
}

impl<S: QueueStore> Inner<S> {
    fn extract_tenant(&self, data: &serde_json::Value) -> Result<TenantId, QueueError> {
        let field = &self.config.tenant_field;
        let raw = data
            .get(field)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                QueueError::Validation(format!("job data must include a string `{field}`"))
            })?;
        TenantId::new(raw)
            .map_err(|_| QueueError::Validation(format!("job data `{field}` must not be empty")))
    }

    async fn send_json(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: SendOptions,
    ) -> Result<JobId, QueueError> {
        if queue_name.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }
        let tenant_id = self.extract_tenant(&data)?;
        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(&tenant_id));

        let now = self.clock.now();
        let job = NewJob::new(queue_name, tenant_id, data, now)
            .process_after(options.process_after.unwrap_or(now));
        let job_id = self.store.insert_job(job).await?;

        span.record("job_id", tracing::field::display(job_id));
        Ok(job_id)
    }

    async fn tick(self: &Arc<Self>) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }

        let now = self.clock.now();
        let request = LeaseRequest {
            leased_by: self.worker_id.clone(),
            now,
            lease_until: add_duration(now, self.config.lock_duration),
            limit: self.config.token_batch_size,
        };
        let tokens = match self.store.batch_lease_tokens(&request).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(error = %e, "token lease failed");
                return;
            }
        };
        if tokens.is_empty() {
            return;
        }
        debug!(tokens = tokens.len(), "tokens leased");

        let handles: Vec<_> = tokens
            .into_iter()
            .map(|token| {
                let inner = self.clone();
                self.workers.spawn(async move { inner.process_token(token).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "token worker panicked");
            }
        }
    }

    #[instrument(
        skip(self, token),
        fields(
            worker_id = %self.worker_id,
            queue = %token.queue_name,
            tenant_id = %token.tenant_id,
            token_id = %token.id
        )
    )]
    async fn process_token(self: Arc<Self>, token: Token) {
        self.drain_token(&token).await;

        // Release even after failures so the pair is available next tick.
        if let Err(e) = self.store.delete_token(token.id, &self.worker_id).await {
            warn!(error = %e, "token release failed; lease will expire");
        }
    }

    async fn drain_token(self: &Arc<Self>, token: &Token) {
        let now = self.clock.now();
        let request = ClaimRequest::for_token(
            token,
            self.worker_id.clone(),
            now,
            add_duration(now, self.config.lock_duration),
            self.config.claim_batch_size,
        );
        let jobs = match self.store.batch_claim_jobs(&request).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "job claim failed");
                return;
            }
        };
        if jobs.is_empty() {
            return;
        }
        debug!(jobs = jobs.len(), "jobs claimed");

        let unresolved: Arc<Mutex<HashSet<JobId>>> =
            Arc::new(Mutex::new(jobs.iter().map(|j| j.id).collect()));
        let renewer = self.spawn_claim_renewer(unresolved.clone());

        let permits = Arc::new(Semaphore::new(self.config.processing_concurrency));
        let mut running = JoinSet::new();
        for job in jobs {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let inner = self.clone();
            let unresolved = unresolved.clone();
            running.spawn(
                async move {
                    let _permit = permit;
                    let job_id = job.id;
                    inner.run_job(job).await;
                    unresolved
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&job_id);
                }
                .in_current_span(),
            );
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "job task failed");
            }
        }

        renewer.stop().await;
    }

    fn spawn_claim_renewer(&self, unresolved: Arc<Mutex<HashSet<JobId>>>) -> LeaseRenewer {
        let store = self.store.clone();
        let clock = self.clock.clone();
        let worker_id = self.worker_id.clone();
        let lock_duration = self.config.lock_duration;

        LeaseRenewer::spawn(self.config.refresh_interval, move || {
            let store = store.clone();
            let clock = clock.clone();
            let worker_id = worker_id.clone();
            let ids: Vec<JobId> = unresolved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect();

            async move {
                if ids.is_empty() {
                    return;
                }
                let until = add_duration(clock.now(), lock_duration);
                match store.batch_renew_claims(&ids, &worker_id, until).await {
                    Ok(renewed) if renewed < ids.len() as u64 => warn!(
                        expected = ids.len(),
                        renewed, "some job claims were lost before renewal"
                    ),
                    Ok(renewed) => debug!(renewed, "job claims renewed"),
                    Err(e) => warn!(error = %e, "job claim renewal failed"),
                }
            }
        })
    }

    async fn run_job(&self, job: Job) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job.queue_name)
            .cloned();

        let Some(handler) = handler else {
            warn!(job_id = %job.id, "no handler registered; dead-lettering");
            self.dead_letter(&job, job.failed_count, NO_HANDLER_ERROR).await;
            return;
        };

        let context = JobContext::from_job(&job, self.config.lock_duration);
        let result = match tokio::spawn(async move { handler.handle(context).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(HANDLER_PANICKED_ERROR)),
            Err(e) => Err(anyhow::anyhow!(e)),
        };

        match result {
            Ok(()) => self.complete(&job).await,
            Err(e) => self.fail(&job, &e.to_string()).await,
        }
    }

    async fn complete(&self, job: &Job) {
        match self
            .store
            .complete_job(job.id, &self.worker_id, self.clock.now())
            .await
        {
            Ok(true) => debug!(job_id = %job.id, "job completed"),
            Ok(false) => warn!(job_id = %job.id, "job claim lost before completion"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to mark job completed"),
        }
    }

    async fn fail(&self, job: &Job, message: &str) {
        let failed_count = job.failed_count.saturating_add(1);
        if failed_count >= self.config.max_retries {
            self.dead_letter(job, failed_count, message).await;
            return;
        }

        let backoff = calculate_backoff(self.config.base_backoff, failed_count);
        let process_after = add_duration(self.clock.now(), backoff);
        match self
            .store
            .retry_job(job.id, &self.worker_id, failed_count, message, process_after)
            .await
        {
            Ok(true) => debug!(
                job_id = %job.id,
                failed_count,
                backoff_ms = backoff.as_millis() as u64,
                error = message,
                "job failed; retry scheduled"
            ),
            Ok(false) => warn!(job_id = %job.id, "job claim lost before retry"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to schedule job retry"),
        }
    }

    async fn dead_letter(&self, job: &Job, failed_count: u32, message: &str) {
        match self
            .store
            .dead_letter_job(
                job.id,
                &self.worker_id,
                failed_count,
                message,
                self.clock.now(),
            )
            .await
        {
            Ok(true) => info!(
                job_id = %job.id,
                queue = %job.queue_name,
                tenant_id = %job.tenant_id,
                failed_count,
                error = message,
                "job dead-lettered"
            ),
            Ok(false) => warn!(job_id = %job.id, "job claim lost before dead-lettering"),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to dead-letter job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use lattice_core::TokenId;

    use crate::clock::TokioClock;
    use crate::jobs::store::{InMemoryQueueStore, JobStore, TokenPool};
    use crate::jobs::types::JobState;

    type Manager = QueueManager<InMemoryQueueStore>;

    fn manager_with(config: QueueConfig) -> (Manager, SharedClock) {
        let clock: SharedClock = Arc::new(TokioClock::new());
        let manager =
            QueueManager::with_clock(Arc::new(InMemoryQueueStore::new()), config, clock.clone())
                .unwrap();
        (manager, clock)
    }

    fn manager() -> (Manager, SharedClock) {
        manager_with(QueueConfig::default())
    }

    fn ws1(extra: i64) -> serde_json::Value {
        serde_json::json!({"tenantId": "ws1", "x": extra})
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_without_handler_are_dead_lettered_after_one_tick() {
        let (manager, _) = manager();
        let mut ids = Vec::new();
        for x in 0..3 {
            ids.push(manager.send_json("Q", ws1(x), SendOptions::default()).await.unwrap());
        }

        manager.tick().await;

        for id in ids {
            let job = manager.get_job(id).await.unwrap().unwrap();
            assert!(job.dead_lettered_at.is_some());
            assert_eq!(job.last_error.as_deref(), Some(NO_HANDLER_ERROR));
        }
        assert_eq!(manager.list_dead_letters(Some("Q"), 10).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_retries_with_backoff_then_dead_letters() {
        let (manager, clock) = manager_with(QueueConfig {
            max_retries: 2,
            base_backoff: Duration::from_millis(100),
            ..QueueConfig::default()
        });
        manager
            .register_handler("Q", |_job: JobContext| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.tick().await;
        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failed_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert_eq!(job.state_at(clock.now()), JobState::Delayed);
        let backoff = calculate_backoff(Duration::from_millis(100), 1);
        assert!(job.process_after > clock.now());
        assert!(job.process_after <= add_duration(clock.now(), backoff));

        // Still backing off: nothing to lease.
        manager.tick().await;
        assert_eq!(manager.get_job(id).await.unwrap().unwrap().failed_count, 1);

        tokio::time::advance(backoff).await;
        manager.tick().await;
        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failed_count, 2);
        assert!(job.dead_lettered_at.is_some());
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        tokio::time::advance(Duration::from_secs(3_600)).await;
        assert!(!job.is_claimable_at(clock.now()));
        manager.tick().await;
        assert_eq!(manager.get_job(id).await.unwrap().unwrap().failed_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_handler_completes_job() {
        let (manager, _) = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        manager
            .register_handler("embeddings", move |job: JobContext| {
                let s = s.clone();
                async move {
                    s.lock().unwrap().push((job.tenant_id.to_string(), job.data["x"].clone()));
                    anyhow::Ok(())
                }
            })
            .unwrap();
        let id = manager
            .send("embeddings", &ws1(7), SendOptions::default())
            .await
            .unwrap();

        manager.tick().await;

        let job = manager.get_job(id).await.unwrap().unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.claimed_by, None);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[("ws1".to_string(), serde_json::json!(7))]
        );
        let stats = manager.queue_stats("embeddings").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_send_waits_for_process_after() {
        let (manager, clock) = manager();
        manager
            .register_handler("Q", |_job: JobContext| async { anyhow::Ok(()) })
            .unwrap();
        let at = add_duration(clock.now(), Duration::from_secs(5));
        let id = manager
            .send_json("Q", ws1(1), SendOptions::delayed_until(at))
            .await
            .unwrap();

        manager.tick().await;
        assert!(manager.get_job(id).await.unwrap().unwrap().completed_at.is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        manager.tick().await;
        assert!(manager.get_job(id).await.unwrap().unwrap().completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_counts_as_failure() {
        let (manager, _) = manager();
        manager
            .register_handler("Q", |_job: JobContext| async {
                if true {
                    panic!("handler exploded");
                }
                anyhow::Ok(())
            })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.tick().await;

        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failed_count, 1);
        assert_eq!(job.last_error.as_deref(), Some(HANDLER_PANICKED_ERROR));
        assert!(job.dead_lettered_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_abort_siblings() {
        let (manager, _) = manager();
        manager
            .register_handler("Q", |job: JobContext| async move {
                anyhow::ensure!(job.data["x"] != 1, "bad input");
                anyhow::Ok(())
            })
            .unwrap();
        let mut ids = Vec::new();
        for x in 0..4 {
            ids.push(manager.send_json("Q", ws1(x), SendOptions::default()).await.unwrap());
        }

        manager.tick().await;

        let stats = manager.queue_stats("Q").await.unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending, 1);
        let failed = manager.get_job(ids[1]).await.unwrap().unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("bad input"));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_respects_processing_concurrency() {
        let (manager, _) = manager_with(QueueConfig {
            processing_concurrency: 3,
            claim_batch_size: 10,
            ..QueueConfig::default()
        });
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        manager
            .register_handler("Q", move |_job: JobContext| {
                let (f, p) = (f.clone(), p.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();
        for x in 0..8 {
            manager.send_json("Q", ws1(x), SendOptions::default()).await.unwrap();
        }

        manager.tick().await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(manager.queue_stats("Q").await.unwrap().completed, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn claims_are_renewed_while_handlers_run() {
        let (manager, clock) = manager_with(QueueConfig {
            lock_duration: Duration::from_millis(300),
            refresh_interval: Duration::from_millis(100),
            ..QueueConfig::default()
        });
        manager
            .register_handler("Q", |_job: JobContext| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                anyhow::Ok(())
            })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        let ticking = manager.clone();
        let tick = tokio::spawn(async move { ticking.tick().await });

        tokio::time::sleep(Duration::from_millis(700)).await;
        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state_at(clock.now()), JobState::Claimed);

        tick.await.unwrap();
        assert!(manager.get_job(id).await.unwrap().unwrap().completed_at.is_some());
    }

    /// Delegates to the in-memory store, except that claim renewal always
    /// fails (`Err`) or silently renews nothing (`Ok(0)`).
    #[derive(Debug)]
    struct BrokenRenewals {
        inner: InMemoryQueueStore,
        error: bool,
        renew_calls: AtomicUsize,
        released: AtomicUsize,
    }

    impl BrokenRenewals {
        fn new(error: bool) -> Self {
            Self {
                inner: InMemoryQueueStore::new(),
                error,
                renew_calls: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenPool for BrokenRenewals {
        async fn batch_lease_tokens(&self, request: &LeaseRequest) -> Result<Vec<Token>, StoreError> {
            self.inner.batch_lease_tokens(request).await
        }

        async fn delete_token(&self, token_id: TokenId, leased_by: &str) -> Result<(), StoreError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.inner.delete_token(token_id, leased_by).await
        }
    }

    #[async_trait::async_trait]
    impl JobStore for BrokenRenewals {
        async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
            self.inner.insert_job(job).await
        }

        async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
            self.inner.get_job(job_id).await
        }

        async fn batch_claim_jobs(&self, request: &ClaimRequest) -> Result<Vec<Job>, StoreError> {
            self.inner.batch_claim_jobs(request).await
        }

        async fn batch_renew_claims(
            &self,
            _job_ids: &[JobId],
            _claimed_by: &str,
            _claimed_until: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.renew_calls.fetch_add(1, Ordering::SeqCst);
            if self.error {
                return Err(StoreError::Database {
                    operation: "batch_renew_claims".to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(0)
        }

        async fn complete_job(
            &self,
            job_id: JobId,
            claimed_by: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.complete_job(job_id, claimed_by, now).await
        }

        async fn retry_job(
            &self,
            job_id: JobId,
            claimed_by: &str,
            failed_count: u32,
            error: &str,
            process_after: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner
                .retry_job(job_id, claimed_by, failed_count, error, process_after)
                .await
        }

        async fn dead_letter_job(
            &self,
            job_id: JobId,
            claimed_by: &str,
            failed_count: u32,
            error: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner
                .dead_letter_job(job_id, claimed_by, failed_count, error, now)
                .await
        }

        async fn list_dead_letters(
            &self,
            queue_name: Option<&str>,
            limit: usize,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.list_dead_letters(queue_name, limit).await
        }

        async fn requeue_dead_letter(
            &self,
            job_id: JobId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.requeue_dead_letter(job_id, now).await
        }

        async fn queue_stats(
            &self,
            queue_name: &str,
            now: DateTime<Utc>,
        ) -> Result<QueueStats, StoreError> {
            self.inner.queue_stats(queue_name, now).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_failures_do_not_fail_the_batch() {
        for error in [true, false] {
            let store = Arc::new(BrokenRenewals::new(error));
            let manager = QueueManager::with_clock(
                store.clone(),
                QueueConfig {
                    lock_duration: Duration::from_millis(300),
                    refresh_interval: Duration::from_millis(100),
                    ..QueueConfig::default()
                },
                Arc::new(TokioClock::new()),
            )
            .unwrap();
            manager
                .register_handler("Q", |_job: JobContext| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    anyhow::Ok(())
                })
                .unwrap();
            let a = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();
            let b = manager.send_json("Q", ws1(2), SendOptions::default()).await.unwrap();

            manager.tick().await;

            assert!(store.renew_calls.load(Ordering::SeqCst) >= 1);
            assert_eq!(store.released.load(Ordering::SeqCst), 1);
            for id in [a, b] {
                assert!(manager.get_job(id).await.unwrap().unwrap().completed_at.is_some());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn token_is_released_after_each_batch() {
        let (manager, clock) = manager_with(QueueConfig {
            claim_batch_size: 2,
            ..QueueConfig::default()
        });
        manager
            .register_handler("Q", |_job: JobContext| async { anyhow::Ok(()) })
            .unwrap();
        for x in 0..5 {
            manager.send_json("Q", ws1(x), SendOptions::default()).await.unwrap();
        }

        manager.tick().await;
        assert!(manager.store().live_tokens(clock.now()).unwrap().is_empty());
        assert_eq!(manager.queue_stats("Q").await.unwrap().completed, 2);

        manager.tick().await;
        manager.tick().await;
        assert_eq!(manager.queue_stats("Q").await.unwrap().completed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_tenant_id() {
        let (manager, _) = manager();
        for data in [
            serde_json::json!({"x": 1}),
            serde_json::json!({"tenantId": ""}),
            serde_json::json!({"tenantId": "   "}),
            serde_json::json!({"tenantId": 42}),
        ] {
            let err = manager
                .send_json("Q", data, SendOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, QueueError::Validation(_)), "{err}");
        }
        assert!(manager.store().all_jobs().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_field_is_configurable() {
        let (manager, _) = manager_with(QueueConfig {
            tenant_field: "workspaceId".to_string(),
            ..QueueConfig::default()
        });
        let id = manager
            .send_json(
                "Q",
                serde_json::json!({"workspaceId": "ws9"}),
                SendOptions::default(),
            )
            .await
            .unwrap();
        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.tenant_id.as_str(), "ws9");
    }

    #[tokio::test(start_paused = true)]
    async fn handler_registration_rules() {
        let (manager, _) = manager();
        manager
            .register_handler("Q", |_job: JobContext| async { anyhow::Ok(()) })
            .unwrap();
        assert!(matches!(
            manager.register_handler("Q", |_job: JobContext| async { anyhow::Ok(()) }),
            Err(QueueError::DuplicateHandler(_))
        ));

        manager.start().unwrap();
        assert!(matches!(
            manager.register_handler("R", |_job: JobContext| async { anyhow::Ok(()) }),
            Err(QueueError::HandlerRegistrationClosed(_))
        ));
        assert!(matches!(manager.start(), Err(QueueError::AlreadyStarted)));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn started_manager_processes_on_its_own() {
        let (manager, _) = manager();
        manager
            .register_handler("Q", |_job: JobContext| async { anyhow::Ok(()) })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        manager.stop().await;

        assert!(manager.get_job(id).await.unwrap().unwrap().completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_sends_every_interval_until_stopped() {
        let (manager, _) = manager();
        manager.schedule("digest", 1, ws1(0)).unwrap();
        assert!(matches!(
            manager.schedule("digest", 5, ws1(0)),
            Err(QueueError::AlreadyScheduled(_))
        ));
        assert!(matches!(
            manager.schedule("other", 1, serde_json::json!({})),
            Err(QueueError::Validation(_))
        ));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(manager.store().all_jobs().unwrap().len(), 3);

        manager.stop().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.store().all_jobs().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_schedule_interval_is_rejected() {
        let (manager, _) = manager();
        for interval in [u64::MAX, MAX_SCHEDULE_INTERVAL_SECS + 1] {
            assert!(matches!(
                manager.schedule("digest", interval, ws1(0)),
                Err(QueueError::Validation(_))
            ));
        }

        // The rejected calls left nothing registered for the queue.
        manager.schedule("digest", 1, ws1(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(manager.store().all_jobs().unwrap().len(), 2);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_jobs() {
        let (manager, _) = manager();
        let finished = Arc::new(AtomicU32::new(0));
        let f = finished.clone();
        manager
            .register_handler("Q", move |_job: JobContext| {
                let f = f.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .unwrap();
        manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        manager.stop().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_workers_after_timeout() {
        let (manager, clock) = manager_with(QueueConfig {
            shutdown_timeout: Duration::from_secs(1),
            ..QueueConfig::default()
        });
        manager
            .register_handler("Q", |_job: JobContext| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                anyhow::Ok(())
            })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        let started = tokio::time::Instant::now();
        manager.stop().await;

        assert!(started.elapsed() <= Duration::from_millis(1_100));
        let job = manager.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state_at(clock.now()), JobState::Claimed);
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_dead_letter_is_processed_again() {
        let (manager, _) = manager_with(QueueConfig {
            max_retries: 1,
            ..QueueConfig::default()
        });
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        manager
            .register_handler("Q", move |_job: JobContext| {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("first attempt fails");
                    }
                    anyhow::Ok(())
                }
            })
            .unwrap();
        let id = manager.send_json("Q", ws1(1), SendOptions::default()).await.unwrap();

        manager.tick().await;
        assert!(manager.get_job(id).await.unwrap().unwrap().dead_lettered_at.is_some());

        assert!(manager.requeue_dead_letter(id).await.unwrap());
        manager.tick().await;

        let job = manager.get_job(id).await.unwrap().unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
