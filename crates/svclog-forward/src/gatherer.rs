use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::plan::{resolve_labels, PlanView, Selector, ServiceView, TargetView};
use crate::puller::PulledEntry;
use crate::puller_group::PullerGroup;
use crate::task::Tomb;

const ENTRY_CHANNEL_CAPACITY: usize = 1024;
const SET_LABELS_CHANNEL_CAPACITY: usize = 64;

/// Tunables for one gatherer's batching loop and teardown timing.
#[derive(Debug, Clone, Copy)]
pub struct GathererConfig {
    pub max_buffered_entries: usize,
    pub buffer_timeout: Duration,
    pub timeout_current_flush: Duration,
    pub timeout_pullers: Duration,
    pub timeout_main_loop: Duration,
    pub timeout_final_flush: Duration,
}

impl Default for GathererConfig {
    fn default() -> Self {
        Self {
            max_buffered_entries: 100,
            buffer_timeout: Duration::from_secs(1),
            timeout_current_flush: Duration::from_secs(1),
            timeout_pullers: Duration::from_secs(2),
            timeout_main_loop: Duration::from_secs(3),
            timeout_final_flush: Duration::from_secs(2),
        }
    }
}

enum SetLabelsMsg {
    Set(String, HashMap<String, String>),
    Clear(String),
}

/// The per-target batching engine: multiplexes every service matched by one
/// target into that target's client, flushing on a size threshold or a
/// timer, and tearing down in four bounded phases.
pub struct Gatherer {
    target_name: String,
    pullers: Arc<PullerGroup>,
    entry_tx: mpsc::Sender<PulledEntry>,
    set_labels_tx: mpsc::Sender<SetLabelsMsg>,
    label_templates: RwLock<HashMap<String, String>>,
    selector: RwLock<Selector>,
    matched: Mutex<HashSet<String>>,
    client_cancel: CancellationToken,
    config: GathererConfig,
    tomb: Tomb,
}

impl Gatherer {
    pub fn spawn(target_name: impl Into<String>, client: Box<dyn Client>, config: GathererConfig) -> Arc<Self> {
        let target_name = target_name.into();
        let (entry_tx, entry_rx) = mpsc::channel(ENTRY_CHANNEL_CAPACITY);
        let (set_labels_tx, set_labels_rx) = mpsc::channel(SET_LABELS_CHANNEL_CAPACITY);
        let dying = CancellationToken::new();
        let client_cancel = CancellationToken::new();

        let task_dying = dying.clone();
        let task_client_cancel = client_cancel.clone();
        let task_target_name = target_name.clone();
        let handle = tokio::spawn(async move {
            run_main_loop(client, entry_rx, set_labels_rx, task_dying, task_client_cancel, config, task_target_name).await;
        });

        Arc::new(Self {
            target_name,
            pullers: Arc::new(PullerGroup::new()),
            entry_tx,
            set_labels_tx,
            label_templates: RwLock::new(HashMap::new()),
            selector: RwLock::new(Selector::parse(Vec::<String>::new())),
            matched: Mutex::new(HashSet::new()),
            client_cancel,
            config,
            tomb: Tomb::new(dying, handle),
        })
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Reconciles every service in `plan` against this gatherer's target.
    /// Services that stopped matching lose their puller and their labels;
    /// services that now match get labels and, if their buffer is known, a
    /// puller.
    pub async fn plan_changed(&self, plan: &dyn PlanView) {
        let Some(target) = plan.targets().get(&self.target_name) else {
            return;
        };

        *self.label_templates.write().await = target.label_templates().clone();
        *self.selector.write().await = target.selector().clone();

        let mut matched = self.matched.lock().await;
        let mut next_matched = HashSet::new();

        for (name, service) in plan.services() {
            if !target.selector().matches(name) {
                continue;
            }
            next_matched.insert(name.clone());
            let labels = resolve_labels(target.label_templates(), service.env());
            let _ = self.set_labels_tx.send(SetLabelsMsg::Set(name.clone(), labels)).await;
            self.pullers.add(name.clone(), service.buffer(), self.entry_tx.clone()).await;
        }

        for name in matched.iter() {
            if !next_matched.contains(name) {
                self.pullers.remove(name).await;
                let _ = self.set_labels_tx.send(SetLabelsMsg::Clear(name.clone())).await;
            }
        }

        *matched = next_matched;
    }

    /// A service's buffer identity changed (restart, or first sighting of a
    /// service this target's selector matches): reattach the puller over the
    /// new buffer. A no-op for services this gatherer's target does not
    /// select, judged directly against the target's selector rather than
    /// against the (plan-snapshot-only) `matched` bookkeeping set, since this
    /// is the path a service takes to reach a gatherer *before* it has ever
    /// appeared in a plan's `services` map.
    pub async fn service_started(&self, service: &dyn ServiceView) {
        if !self.selector.read().await.matches(service.name()) {
            return;
        }
        self.matched.lock().await.insert(service.name().to_string());
        self.pullers.add(service.name().to_string(), service.buffer(), self.entry_tx.clone()).await;
    }

    /// A service's environment changed: recompute its labels from this
    /// gatherer's cached target templates and push them to the client. A
    /// no-op for services this gatherer's target does not currently select.
    pub async fn env_changed(&self, service: &dyn ServiceView) {
        if !self.selector.read().await.matches(service.name()) {
            return;
        }
        let templates = self.label_templates.read().await;
        let labels = resolve_labels(&templates, service.env());
        let _ = self
            .set_labels_tx
            .send(SetLabelsMsg::Set(service.name().to_string(), labels))
            .await;
    }

    /// Four bounded teardown phases: unblock an in-progress flush, force a
    /// puller shutdown if the cooperative signal doesn't land in time, wait
    /// for pullers to exit, then kill the main loop and wait for its final
    /// flush.
    pub async fn stop(&self) {
        let client_cancel = self.client_cancel.clone();
        let timeout_current_flush = self.config.timeout_current_flush;
        tokio::spawn(async move {
            tokio::time::sleep(timeout_current_flush).await;
            client_cancel.cancel();
        });

        let pullers = self.pullers.clone();
        let timeout_pullers = self.config.timeout_pullers;
        tokio::spawn(async move {
            tokio::time::sleep(timeout_pullers).await;
            pullers.kill_all().await;
        });

        self.pullers.kill_all().await;
        let _ = tokio::time::timeout(self.config.timeout_main_loop, self.pullers.done()).await;

        self.tomb.kill();
        self.tomb.wait().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_main_loop(
    mut client: Box<dyn Client>,
    mut entry_rx: mpsc::Receiver<PulledEntry>,
    mut set_labels_rx: mpsc::Receiver<SetLabelsMsg>,
    dying: CancellationToken,
    client_cancel: CancellationToken,
    config: GathererConfig,
    target_name: String,
) {
    let mut counter = 0usize;
    let mut timer_armed = false;
    let flush_sleep = tokio::time::sleep(config.buffer_timeout);
    tokio::pin!(flush_sleep);

    loop {
        tokio::select! {
            biased;

            () = dying.cancelled() => break,

            () = &mut flush_sleep, if timer_armed => {
                timer_armed = false;
                do_flush(client.as_mut(), &client_cancel, &target_name, &mut counter).await;
            }

            msg = set_labels_rx.recv() => {
                let Some(msg) = msg else { continue };
                do_flush(client.as_mut(), &client_cancel, &target_name, &mut counter).await;
                timer_armed = false;
                match msg {
                    SetLabelsMsg::Set(service, labels) => client.set_labels(&service, Some(labels)),
                    SetLabelsMsg::Clear(service) => client.set_labels(&service, None),
                }
            }

            pulled = entry_rx.recv() => {
                let Some(pulled) = pulled else { continue };
                client.add(pulled);
                counter += 1;
                if counter >= config.max_buffered_entries {
                    do_flush(client.as_mut(), &client_cancel, &target_name, &mut counter).await;
                    timer_armed = false;
                } else if !timer_armed {
                    flush_sleep.as_mut().reset(tokio::time::Instant::now() + config.buffer_timeout);
                    timer_armed = true;
                }
            }
        }
    }

    let final_cancel = CancellationToken::new();
    let bound = final_cancel.clone();
    let final_flush_timeout = config.timeout_final_flush;
    tokio::spawn(async move {
        tokio::time::sleep(final_flush_timeout).await;
        bound.cancel();
    });
    // `final_cancel` only unblocks a flush that checks it cooperatively. A
    // client whose `Flush` ignores cancellation and never returns must not be
    // able to hang teardown forever, so the whole attempt is additionally
    // bounded by a hard timeout of the same duration: past it, the flush
    // future is dropped outright rather than waited on.
    let _ = tokio::time::timeout(
        final_flush_timeout,
        do_flush(client.as_mut(), &final_cancel, &target_name, &mut counter),
    )
    .await;
    client.close().await;
}

async fn do_flush(client: &mut dyn Client, cancel: &CancellationToken, target_name: &str, counter: &mut usize) {
    if *counter == 0 {
        return;
    }
    if let Err(err) = client.flush(cancel).await {
        tracing::warn!(target_name, error = %err, "gatherer flush failed");
    }
    *counter = 0;
}
