use std::collections::HashMap;
use std::mem;

use svclog_core::RingBuffer;
use tokio::sync::{mpsc, Mutex};

use crate::puller::{PulledEntry, Puller};

/// Owns the lifecycle of every puller feeding one gatherer.
///
/// Every mutating operation takes the group's single async mutex for its
/// whole duration, including the wait for a killed puller to actually exit.
/// That is what keeps `Add` after `Remove` from racing with `Done`: there is
/// never a window where two tasks disagree about which puller is current
/// for a service.
pub struct PullerGroup {
    pullers: Mutex<HashMap<String, Puller>>,
}

impl Default for PullerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl PullerGroup {
    pub fn new() -> Self {
        Self {
            pullers: Mutex::new(HashMap::new()),
        }
    }

    /// Kills any prior puller for `service`, waits for it to exit, then
    /// installs a new one over `buffer`.
    pub async fn add(&self, service: String, buffer: RingBuffer, sender: mpsc::Sender<PulledEntry>) {
        let mut guard = self.pullers.lock().await;
        if let Some(prior) = guard.remove(&service) {
            prior.kill_and_wait().await;
        }
        let puller = Puller::spawn(service.clone(), buffer, sender);
        guard.insert(service, puller);
    }

    /// Kills the puller for `service`, if any, and waits for it to exit.
    pub async fn remove(&self, service: &str) {
        let mut guard = self.pullers.lock().await;
        if let Some(prior) = guard.remove(service) {
            prior.kill_and_wait().await;
        }
    }

    /// Signals every currently tracked puller to stop, without waiting.
    pub async fn kill_all(&self) {
        let guard = self.pullers.lock().await;
        for puller in guard.values() {
            puller.kill();
        }
    }

    /// Resolves once every puller tracked at the time of the call has
    /// exited. Pullers added afterward are not waited on.
    pub async fn done(&self) {
        let pullers: Vec<Puller> = {
            let mut guard = self.pullers.lock().await;
            mem::take(&mut *guard).into_values().collect()
        };
        for puller in pullers {
            puller.wait().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.pullers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_replaces_prior_puller_for_same_service() {
        let group = PullerGroup::new();
        let buffer_a = RingBuffer::new(64);
        let buffer_b = RingBuffer::new(64);
        let (tx, _rx) = mpsc::channel(16);

        group.add("svc1".to_string(), buffer_a, tx.clone()).await;
        assert_eq!(group.len().await, 1);
        group.add("svc1".to_string(), buffer_b, tx).await;
        assert_eq!(group.len().await, 1);
    }

    #[tokio::test]
    async fn kill_all_then_done_drains_every_puller() {
        let group = PullerGroup::new();
        let (tx, _rx) = mpsc::channel(16);
        group.add("svc1".to_string(), RingBuffer::new(64), tx.clone()).await;
        group.add("svc2".to_string(), RingBuffer::new(64), tx).await;

        group.kill_all().await;
        group.done().await;
        assert_eq!(group.len().await, 0);
    }
}
