//! Work-queue plumbing.
//!
//! The broker is an outside service; all we need from it is "put a job in a
//! tube on that host", "block until a job shows up in my tube" and "this job
//! is done, drop it". [`Broker`] and [`Consumer`] capture exactly that, with a
//! beanstalkd implementation for production and an in-process one for tests.

pub mod beanstalk;
#[doc(hidden)]
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::core::host::Host;
use crate::core::messages::Tube;
use crate::errors::QueueError;

pub use beanstalk::{BeanstalkBroker, BeanstalkConnection};
#[doc(hidden)]
pub use memory::MemoryBroker;

pub type JobId = u64;

/// A reserved unit of work. The body is whatever bytes the producer put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit `body` to `tube` on `host` with the given time-to-run (seconds).
    async fn put(&self, host: &Host, tube: Tube, body: &[u8], ttr: u64)
        -> Result<JobId, QueueError>;

    /// Open a consumer that only sees jobs from `tube` on `host`.
    async fn watch(&self, host: &Host, tube: Tube) -> Result<Box<dyn Consumer>, QueueError>;
}

/// A consumer session. Deletion must go through the session that reserved
/// the job.
#[async_trait]
pub trait Consumer: Send {
    /// Block until a job is available and reserve it.
    async fn reserve(&mut self) -> Result<Job, QueueError>;

    /// Acknowledge a reserved job so it is never handed out again.
    async fn delete(&mut self, id: JobId) -> Result<(), QueueError>;
}

/// JSON-encode `message` and put it on `host`.
pub async fn submit<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    host: &Host,
    tube: Tube,
    message: &T,
    ttr: u64,
) -> Result<JobId, QueueError> {
    let body = serde_json::to_vec(message)?;
    let id = broker.put(host, tube, &body, ttr).await?;
    debug!(%host, %tube, job = id, ttr, "Job submitted");
    Ok(id)
}
