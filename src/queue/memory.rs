//! Test double for [`Broker`]. Not part of the supported API.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Broker, Consumer, Job, JobId};
use crate::core::host::Host;
use crate::core::messages::Tube;
use crate::errors::QueueError;

/// In-process broker: one FIFO per (host, tube). `reserve` on an empty tube
/// fails with [`QueueError::Empty`] instead of blocking.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: JobId,
    ready: HashMap<(Host, Tube), VecDeque<Job>>,
    reserved: HashMap<JobId, (Host, Tube)>,
    deleted: Vec<JobId>,
    unreachable: HashSet<Host>,
    ttrs: HashMap<JobId, u64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every operation against `host` fail as if it were down.
    pub fn mark_unreachable(&self, host: &Host) {
        self.lock().unreachable.insert(host.clone());
    }

    /// Raw bodies still waiting in `tube` on `host`, oldest first.
    pub fn pending(&self, host: &Host, tube: Tube) -> Vec<Vec<u8>> {
        self.lock()
            .ready
            .get(&(host.clone(), tube))
            .map(|jobs| jobs.iter().map(|j| j.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Pending bodies decoded as `T`; undecodable ones are skipped.
    pub fn pending_as<T: DeserializeOwned>(&self, host: &Host, tube: Tube) -> Vec<T> {
        self.pending(host, tube)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    /// Ids acknowledged so far, in deletion order.
    pub fn deleted(&self) -> Vec<JobId> {
        self.lock().deleted.clone()
    }

    pub fn ttr_of(&self, id: JobId) -> Option<u64> {
        self.lock().ttrs.get(&id).copied()
    }

    fn check_reachable(state: &MemoryState, host: &Host) -> Result<(), QueueError> {
        if state.unreachable.contains(host) {
            return Err(QueueError::Connect {
                host: host.clone(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn put(
        &self,
        host: &Host,
        tube: Tube,
        body: &[u8],
        ttr: u64,
    ) -> Result<JobId, QueueError> {
        let mut state = self.lock();
        Self::check_reachable(&state, host)?;

        state.next_id += 1;
        let id = state.next_id;
        state.ttrs.insert(id, ttr);
        state
            .ready
            .entry((host.clone(), tube))
            .or_default()
            .push_back(Job {
                id,
                body: body.to_vec(),
            });
        Ok(id)
    }

    async fn watch(&self, host: &Host, tube: Tube) -> Result<Box<dyn Consumer>, QueueError> {
        Self::check_reachable(&self.lock(), host)?;
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            host: host.clone(),
            tube,
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    host: Host,
    tube: Tube,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn reserve(&mut self) -> Result<Job, QueueError> {
        let mut state = self.broker.lock();
        let job = state
            .ready
            .get_mut(&(self.host.clone(), self.tube))
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| QueueError::Empty(self.tube.to_string()))?;
        state
            .reserved
            .insert(job.id, (self.host.clone(), self.tube));
        Ok(job)
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.broker.lock();
        if state.reserved.remove(&id).is_none() {
            return Err(QueueError::Rejected {
                command: format!("delete {id}"),
                reply: "NOT_FOUND".to_string(),
            });
        }
        state.deleted.push(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_per_host_and_tube() {
        let broker = MemoryBroker::new();
        let a = Host::new("a", 1);
        broker.put(&a, Tube::Create, b"one", 60).await.unwrap();
        broker.put(&a, Tube::Create, b"two", 60).await.unwrap();
        broker.put(&a, Tube::Destroy, b"other", 60).await.unwrap();

        let mut consumer = broker.watch(&a, Tube::Create).await.unwrap();
        assert_eq!(consumer.reserve().await.unwrap().body, b"one");
        assert_eq!(consumer.reserve().await.unwrap().body, b"two");
        assert!(matches!(consumer.reserve().await, Err(QueueError::Empty(_))));
        assert_eq!(broker.pending(&a, Tube::Destroy).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_only_once() {
        let broker = MemoryBroker::new();
        let a = Host::new("a", 1);
        let id = broker.put(&a, Tube::Status, b"{}", 30).await.unwrap();
        assert_eq!(broker.ttr_of(id), Some(30));

        let mut consumer = broker.watch(&a, Tube::Status).await.unwrap();
        let job = consumer.reserve().await.unwrap();
        consumer.delete(job.id).await.unwrap();
        assert!(consumer.delete(job.id).await.is_err());
        assert_eq!(broker.deleted(), vec![id]);
    }

    #[tokio::test]
    async fn test_unreachable_hosts_refuse_connections() {
        let broker = MemoryBroker::new();
        let down = Host::new("down", 1);
        broker.mark_unreachable(&down);
        assert!(matches!(
            broker.put(&down, Tube::Create, b"x", 1).await,
            Err(QueueError::Connect { .. })
        ));
    }
}
