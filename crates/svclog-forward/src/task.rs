use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle handle for one long-lived task: a gatherer main loop, a puller
/// loop, or a manager async-stop task.
///
/// Every such task is spawned with a clone of the tomb's [`CancellationToken`]
/// so it can observe [`Tomb::dying`] cooperatively; the tomb itself only
/// tracks when to ask it to stop and how to wait for it to actually finish.
pub struct Tomb {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Tomb {
    pub fn new(cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals the task to stop. Does not wait for it to actually exit.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// A token that resolves once [`Tomb::kill`] has been called.
    pub fn dying(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_dying(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the task to exit. Idempotent: a second call returns
    /// immediately.
    pub async fn wait(&self) {
        let handle = self.handle.lock().expect("tomb lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "tomb-managed task panicked");
            }
        }
    }

    pub async fn kill_and_wait(&self) {
        self.kill();
        self.wait().await;
    }
}
