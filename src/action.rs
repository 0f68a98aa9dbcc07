//! The action invocation controller (§4.7): a shared worker pool per device that runs
//! `Action` callables off the caller's task, with both a synchronous wait and an async
//! callback completion path. Local (host-side) invocation goes through here; a control
//! point's remote invocation (`crate::control_point`) bypasses this entirely since the
//! callable lives on the other host.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::{
    error::ActionCallError,
    model::{Action, ActionInputs, ActionOutputs},
};

struct Job {
    id: Uuid,
    action: Arc<Action>,
    inputs: ActionInputs,
    responder: oneshot::Sender<Result<ActionOutputs, crate::soap::ActionError>>,
}

/// A single enqueued call. Callers either `wait()` it synchronously (optionally bounded
/// by a timeout) or hand it to [`ActionInvoker::invoke_with_callback`] instead of ever
/// touching this type.
pub struct Invocation {
    pub id: Uuid,
    completion: oneshot::Receiver<Result<ActionOutputs, crate::soap::ActionError>>,
}

impl Invocation {
    pub async fn wait(self) -> Result<ActionOutputs, ActionCallError> {
        match self.completion.await {
            Ok(result) => result.map_err(ActionCallError::from),
            Err(_) => Err(ActionCallError::Network(anyhow::anyhow!(
                "invocation worker dropped without completing"
            ))),
        }
    }

    pub async fn wait_timeout(
        self,
        timeout: std::time::Duration,
    ) -> Result<ActionOutputs, ActionCallError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ActionCallError::TimedOut),
        }
    }
}

/// Per-device worker pool, sized `max(1, actionCount/4)` (§4.7). Owns the only sender
/// half of its job queue's `mpsc` channel; the receiver is shared behind an async mutex
/// so any idle worker can pick up the next job, the usual tokio worker-pool shape when
/// there's no crate already providing one.
pub struct ActionInvoker {
    tx: mpsc::Sender<Job>,
    shutting_down: Arc<AtomicBool>,
    workers: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for ActionInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionInvoker")
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl ActionInvoker {
    /// `action_count` is the total number of actions across every service in the device
    /// tree this invoker serves; the pool is sized once, at tree-build time, and never
    /// resized afterwards.
    pub fn new(action_count: usize) -> Arc<Self> {
        let worker_count = (action_count / 4).max(1);
        let (tx, rx) = mpsc::channel(128);
        let rx = Arc::new(AsyncMutex::new(rx));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let rx = rx.clone();
            workers.push(tokio::spawn(Self::run_worker(worker_id, rx)));
        }
        Arc::new(Self {
            tx,
            shutting_down,
            workers: AsyncMutex::new(workers),
        })
    }

    async fn run_worker(worker_id: usize, rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                tracing::debug!(worker_id, "action invoker worker exiting, channel closed");
                return;
            };
            tracing::trace!(worker_id, action = %job.action.name, invocation = %job.id, "running action");
            let outcome = match job.action.handler() {
                Some(handler) => handler(job.inputs).await,
                None => Err(crate::soap::ActionError::with_description(
                    crate::soap::ActionErrorCode::ActionFailed,
                    "action has no local implementation installed",
                )),
            };
            let _ = job.responder.send(outcome);
        }
    }

    /// Enqueues `inputs` against `action` and returns a handle the caller can `wait()`
    /// on. Fails immediately, without touching the queue, once [`ActionInvoker::shutdown`]
    /// has been called (§4.7: cancellation is cooperative, a shutdown drains the pool
    /// rather than aborting in-flight work, but it must stop admitting new jobs).
    pub async fn invoke(
        &self,
        action: Arc<Action>,
        inputs: ActionInputs,
    ) -> Result<Invocation, ActionCallError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ActionCallError::ShuttingDown);
        }
        let id = Uuid::new_v4();
        let (responder, completion) = oneshot::channel();
        self.tx
            .send(Job {
                id,
                action,
                inputs,
                responder,
            })
            .await
            .map_err(|_| ActionCallError::ShuttingDown)?;
        Ok(Invocation { id, completion })
    }

    /// Like [`ActionInvoker::invoke`], but instead of returning a waitable handle it
    /// spawns a task that runs `callback` once the result is ready. The spawned task
    /// owns the completion receiver, so callers with no interest in blocking their own
    /// task on the result (e.g. the GENA worker reacting to a state change) never need
    /// to.
    pub async fn invoke_with_callback<F>(
        &self,
        action: Arc<Action>,
        inputs: ActionInputs,
        callback: F,
    ) -> Result<(), ActionCallError>
    where
        F: FnOnce(Result<ActionOutputs, ActionCallError>) + Send + 'static,
    {
        let invocation = self.invoke(action, inputs).await?;
        tokio::spawn(async move {
            let result = invocation.wait().await;
            callback(result);
        });
        Ok(())
    }

    /// Cooperative shutdown (§4.7, §5): stop admitting new invocations, close the job
    /// queue so every worker drains its backlog and exits, then join them. Safe to call
    /// more than once; the second call just joins an already-empty worker list.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArgumentSpec;
    use std::collections::HashMap;

    fn noop_action(name: &str) -> Arc<Action> {
        let action = Arc::new(Action::new(name, Vec::<ArgumentSpec>::new()));
        action
            .set_handler(Arc::new(|_inputs| {
                Box::pin(async { Ok(HashMap::new()) })
            }))
            .ok();
        action
    }

    #[tokio::test]
    async fn pool_size_is_action_count_over_four_floored_at_one() {
        let invoker = ActionInvoker::new(3);
        assert_eq!(invoker.workers.lock().await.len(), 1);
        let invoker = ActionInvoker::new(12);
        assert_eq!(invoker.workers.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn invoke_runs_the_installed_handler_and_completes() {
        let invoker = ActionInvoker::new(4);
        let action = noop_action("GetStatus");
        let invocation = invoker.invoke(action, HashMap::new()).await.unwrap();
        let outputs = invocation.wait().await.unwrap();
        assert!(outputs.is_empty());
    }

    #[tokio::test]
    async fn invoke_without_handler_fails_with_action_failed() {
        let invoker = ActionInvoker::new(4);
        let action = Arc::new(Action::new("Unimplemented", Vec::<ArgumentSpec>::new()));
        let invocation = invoker.invoke(action, HashMap::new()).await.unwrap();
        let err = invocation.wait().await.unwrap_err();
        assert!(matches!(err, ActionCallError::Protocol(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_further_invocations() {
        let invoker = ActionInvoker::new(4);
        invoker.shutdown().await;
        let action = noop_action("SetTarget");
        let result = invoker.invoke(action, HashMap::new()).await;
        assert!(matches!(result, Err(ActionCallError::ShuttingDown)));
    }
}
