use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::Client;
use crate::error::ForwardError;
use crate::gatherer::{Gatherer, GathererConfig};
use crate::plan::{PlanView, ServiceView, TargetView};

/// Builds the client for a newly-seen target. Failing to construct one (an
/// unknown target type, a location that doesn't parse) is not fatal to the
/// rest of the plan: the manager logs it and carries on without that target.
pub type GathererFactory = Arc<dyn Fn(&dyn TargetView) -> Result<Box<dyn Client>, ForwardError> + Send + Sync>;

struct State {
    gatherers: HashMap<String, Arc<Gatherer>>,
    services: HashMap<String, Arc<dyn ServiceView>>,
}

/// Reconciles a declarative plan (services × targets) against a live set of
/// gatherers and per-service pullers.
///
/// All mutation goes through one async mutex held only across the map edits
/// themselves; the slow parts (`gatherer.plan_changed`, `gatherer.stop`) run
/// with the lock released or in a detached task, so one misbehaving target
/// never stalls reconciliation of the others.
pub struct Manager {
    state: Mutex<State>,
    factory: GathererFactory,
    config: GathererConfig,
}

impl Manager {
    pub fn new(factory: GathererFactory) -> Self {
        Self::with_config(factory, GathererConfig::default())
    }

    pub fn with_config(factory: GathererFactory, config: GathererConfig) -> Self {
        Self {
            state: Mutex::new(State {
                gatherers: HashMap::new(),
                services: HashMap::new(),
            }),
            factory,
            config,
        }
    }

    /// Reconciles the live gatherer set against `plan`:
    ///
    /// 1. Reuse the gatherer for every target name already running; build a
    ///    new one (via the factory) for every target that's new to the plan,
    ///    skipping (with a logged error) any whose client can't be built.
    /// 2. Tell every gatherer in the new map about the plan, so it can
    ///    reconcile its own matched-service set.
    /// 3. Any gatherer that survives only in the old map belongs to a target
    ///    the plan dropped: stop it in a detached task rather than blocking
    ///    this call on its (bounded, but non-trivial) teardown.
    /// 4. Forget any service the new plan no longer has.
    pub async fn plan_changed(&self, plan: &dyn PlanView) {
        let mut state = self.state.lock().await;

        let mut next_gatherers = HashMap::with_capacity(plan.targets().len());
        for (name, target) in plan.targets() {
            if let Some(existing) = state.gatherers.remove(name) {
                next_gatherers.insert(name.clone(), existing);
                continue;
            }
            match (self.factory)(target.as_ref()) {
                Ok(client) => {
                    let gatherer = Gatherer::spawn(name.clone(), client, self.config);
                    next_gatherers.insert(name.clone(), gatherer);
                }
                Err(err) => {
                    tracing::error!(target = name.as_str(), error = %err, "failed to construct client for target, skipping it");
                }
            }
        }

        for gatherer in next_gatherers.values() {
            gatherer.plan_changed(plan).await;
        }

        let retired: Vec<Arc<Gatherer>> = state.gatherers.drain().map(|(_, g)| g).collect();
        for gatherer in retired {
            tokio::spawn(async move {
                gatherer.stop().await;
            });
        }

        state.services.retain(|name, _| plan.services().contains_key(name));
        state.gatherers = next_gatherers;
    }

    /// Tells every gatherer whose target currently matches `service` about a
    /// changed environment and/or a changed buffer identity (a restart), by
    /// comparing against whatever was previously recorded for that service
    /// name. A service seen for the first time is treated as both having
    /// changed. Gatherers that don't currently select this service silently
    /// ignore the notification.
    pub async fn service_started(&self, service: Arc<dyn ServiceView>) {
        let mut state = self.state.lock().await;
        let name = service.name().to_string();

        let (env_changed, buffer_changed) = match state.services.get(&name) {
            Some(prior) => (prior.env() != service.env(), prior.buffer_id() != service.buffer_id()),
            None => (true, true),
        };

        for gatherer in state.gatherers.values() {
            if env_changed {
                gatherer.env_changed(service.as_ref()).await;
            }
            if buffer_changed {
                gatherer.service_started(service.as_ref()).await;
            }
        }

        state.services.insert(name, service);
    }

    /// Stops every live gatherer concurrently and waits for all of them to
    /// finish tearing down.
    pub async fn stop(&self) {
        let gatherers: Vec<Arc<Gatherer>> = {
            let mut state = self.state.lock().await;
            state.gatherers.drain().map(|(_, g)| g).collect()
        };

        let mut handles = Vec::with_capacity(gatherers.len());
        for gatherer in gatherers {
            handles.push(tokio::spawn(async move {
                gatherer.stop().await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    async fn gatherer_count(&self) -> usize {
        self.state.lock().await.gatherers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use svclog_core::RingBuffer;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::plan::{BufferId, Selector, TargetKind};
    use crate::puller::PulledEntry;

    struct FakeService {
        name: String,
        env: HashMap<String, String>,
        buffer_id: BufferId,
        buffer: RingBuffer,
    }

    impl ServiceView for FakeService {
        fn name(&self) -> &str {
            &self.name
        }
        fn env(&self) -> &HashMap<String, String> {
            &self.env
        }
        fn buffer_id(&self) -> BufferId {
            self.buffer_id
        }
        fn buffer(&self) -> RingBuffer {
            self.buffer.clone()
        }
    }

    struct FakeTarget {
        name: String,
        selector: Selector,
        labels: HashMap<String, String>,
    }

    impl TargetView for FakeTarget {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> TargetKind {
            TargetKind::Loki
        }
        fn location(&self) -> &str {
            "http://example.invalid"
        }
        fn label_templates(&self) -> &HashMap<String, String> {
            &self.labels
        }
        fn selector(&self) -> &Selector {
            &self.selector
        }
    }

    #[derive(Default)]
    struct FakePlan {
        services: HashMap<String, Arc<dyn ServiceView>>,
        targets: HashMap<String, Arc<dyn TargetView>>,
    }

    impl PlanView for FakePlan {
        fn services(&self) -> &HashMap<String, Arc<dyn ServiceView>> {
            &self.services
        }
        fn targets(&self) -> &HashMap<String, Arc<dyn TargetView>> {
            &self.targets
        }
    }

    struct NullClient;

    #[async_trait]
    impl Client for NullClient {
        fn add(&mut self, _entry: PulledEntry) {}
        async fn flush(&mut self, _cancel: &CancellationToken) -> Result<(), ForwardError> {
            Ok(())
        }
        fn set_labels(&mut self, _service: &str, _labels: Option<HashMap<String, String>>) {}
    }

    fn counting_factory(calls: Arc<AtomicU64>) -> GathererFactory {
        Arc::new(move |_target: &dyn TargetView| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullClient) as Box<dyn Client>)
        })
    }

    fn plan_with_target(name: &str) -> FakePlan {
        let mut plan = FakePlan::default();
        plan.targets.insert(
            name.to_string(),
            Arc::new(FakeTarget {
                name: name.to_string(),
                selector: Selector::parse(Vec::<String>::new()),
                labels: HashMap::new(),
            }),
        );
        plan
    }

    #[tokio::test]
    async fn plan_changed_creates_a_gatherer_per_new_target() {
        let calls = Arc::new(AtomicU64::new(0));
        let manager = Manager::new(counting_factory(calls.clone()));

        manager.plan_changed(&plan_with_target("tgt1")).await;
        assert_eq!(manager.gatherer_count().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn plan_changed_reuses_existing_gatherer_for_unchanged_target() {
        let calls = Arc::new(AtomicU64::new(0));
        let manager = Manager::new(counting_factory(calls.clone()));

        manager.plan_changed(&plan_with_target("tgt1")).await;
        manager.plan_changed(&plan_with_target("tgt1")).await;

        assert_eq!(manager.gatherer_count().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "factory should only run once for the same target");
    }

    #[tokio::test]
    async fn plan_changed_retires_gatherers_for_removed_targets() {
        let calls = Arc::new(AtomicU64::new(0));
        let manager = Manager::new(counting_factory(calls));

        manager.plan_changed(&plan_with_target("tgt1")).await;
        manager.plan_changed(&FakePlan::default()).await;

        assert_eq!(manager.gatherer_count().await, 0);
    }

    #[tokio::test]
    async fn factory_failure_skips_only_that_target() {
        let manager = Manager::new(Arc::new(|target: &dyn TargetView| {
            if target.name() == "bad" {
                Err(ForwardError::UnknownTargetType("mystery".to_string()))
            } else {
                Ok(Box::new(NullClient) as Box<dyn Client>)
            }
        }));

        let mut plan = plan_with_target("good");
        plan.targets.insert(
            "bad".to_string(),
            Arc::new(FakeTarget {
                name: "bad".to_string(),
                selector: Selector::parse(Vec::<String>::new()),
                labels: HashMap::new(),
            }),
        );

        manager.plan_changed(&plan).await;
        assert_eq!(manager.gatherer_count().await, 1);
    }

    #[tokio::test]
    async fn stop_clears_every_gatherer() {
        let calls = Arc::new(AtomicU64::new(0));
        let manager = Manager::new(counting_factory(calls));
        manager.plan_changed(&plan_with_target("tgt1")).await;

        manager.stop().await;
        assert_eq!(manager.gatherer_count().await, 0);
    }

    #[tokio::test]
    async fn service_started_forgotten_after_removal_from_plan() {
        let calls = Arc::new(AtomicU64::new(0));
        let manager = Manager::new(counting_factory(calls));
        let mut plan = plan_with_target("tgt1");
        let service: Arc<dyn ServiceView> = Arc::new(FakeService {
            name: "svc1".to_string(),
            env: HashMap::new(),
            buffer_id: BufferId(1),
            buffer: RingBuffer::new(64),
        });
        plan.services.insert("svc1".to_string(), service.clone());

        manager.plan_changed(&plan).await;
        manager.service_started(service).await;

        manager.plan_changed(&FakePlan::default()).await;
        assert_eq!(manager.state.lock().await.services.len(), 0);
    }
}
