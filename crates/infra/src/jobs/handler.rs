//! Job handler contract.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use lattice_core::{JobId, TenantId};

use super::types::Job;

/// What a handler sees of the job it is processing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    /// Queue name.
    pub name: String,
    pub tenant_id: TenantId,
    pub data: serde_json::Value,
    /// Failures recorded before this attempt.
    pub failed_count: u32,
    /// Claim lifetime granted to this attempt.
    pub expire_in: Duration,
    /// Never cancelled; in-flight handlers are not interrupted.
    pub signal: CancellationToken,
}

impl JobContext {
    pub(crate) fn from_job(job: &Job, expire_in: Duration) -> Self {
        Self {
            id: job.id,
            name: job.queue_name.clone(),
            tenant_id: job.tenant_id.clone(),
            data: job.payload.clone(),
            failed_count: job.failed_count,
            expire_in,
            signal: CancellationToken::new(),
        }
    }

    /// Deserialize the payload into a typed value.
    pub fn payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Processes jobs of one queue. Returning `Err` marks the attempt as failed;
/// the error's display string is stored as `last_error`.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: JobContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: JobContext) -> anyhow::Result<()> {
        (self)(job).await
    }
}
