//! Per-workspace serialization queue (§4.1).
//!
//! At most one active container per workspace at a time; queued work runs
//! strictly after the active slot frees, FIFO within a workspace. Queues
//! across workspaces are independent and may run in parallel — each
//! workspace gets its own [`Slot`] guarded by its own lock, so one
//! workspace's activity never blocks another's.
//!
//! Grounded on the `ExecutionGuard`/`AtomicBool` RAII release idiom in
//! `cron::scheduler` for the active/idle bookkeeping, generalized here to a
//! FIFO task queue plus a live-process handle instead of a single flag.

use crate::error::{QueueError, Result};
use crate::WorkspaceId;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler the orchestrator injects so the queue can ask the pipeline to
/// re-examine a workspace's pending messages once it goes idle
/// (`set_process_messages_fn`).
pub type ProcessMessagesFn = Arc<dyn Fn(WorkspaceId) -> BoxFuture + Send + Sync>;

/// A unit of queued work (`enqueue_task`). Consumed exactly once.
type TaskFn = Box<dyn FnOnce() -> BoxFuture + Send>;

/// Handle to a running container, held by the queue so `send_message` and
/// `stop_active_process` can reach it without the caller keeping its own
/// bookkeeping.
pub struct ActiveProcessHandle {
    pub input_tx: mpsc::UnboundedSender<String>,
    pub close_tx: Option<mpsc::UnboundedSender<()>>,
    pub cancel: tokio_util::sync::CancellationToken,
}

struct Slot {
    active: Option<ActiveProcessHandle>,
    is_active_task: bool,
    recheck_pending: bool,
    pending_tasks: VecDeque<(String, TaskFn)>,
}

impl Slot {
    fn new() -> Self {
        Self {
            active: None,
            is_active_task: false,
            recheck_pending: false,
            pending_tasks: VecDeque::new(),
        }
    }
}

/// The per-workspace serializer (§4.1).
pub struct WorkspaceQueue {
    slots: RwLock<HashMap<WorkspaceId, Arc<Mutex<Slot>>>>,
    process_messages_fn: RwLock<Option<ProcessMessagesFn>>,
    shutting_down: AtomicBool,
}

impl Default for WorkspaceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceQueue {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            process_messages_fn: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
        }
    }

    async fn slot(&self, jid: &WorkspaceId) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().await.get(jid) {
            return slot.clone();
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(jid.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::new())))
            .clone()
    }

    /// Orchestrator injects the pipeline's per-workspace handler once at
    /// startup.
    pub async fn set_process_messages_fn(&self, f: ProcessMessagesFn) {
        *self.process_messages_fn.write().await = Some(f);
    }

    /// Claim the workspace's slot for an active container. Fails if one is
    /// already running (§4.1 invariant: at most one active process per
    /// JID).
    pub async fn begin_active(&self, jid: &WorkspaceId, is_task: bool, handle: ActiveProcessHandle) -> Result<()> {
        let slot = self.slot(jid).await;
        let mut slot = slot.lock().await;
        if slot.active.is_some() {
            return Err(QueueError::AlreadyActive {
                jid: jid.to_string(),
            }
            .into());
        }
        slot.active = Some(handle);
        slot.is_active_task = is_task;
        Ok(())
    }

    /// Called by the agent-run pipeline when a container process ends.
    /// Drains one queued task if present, otherwise honors a pending
    /// recheck signal — both strictly after the slot frees, matching the
    /// "queued tasks run strictly after the active slot frees" invariant.
    pub async fn finish_active(&self, jid: &WorkspaceId) {
        let slot_arc = self.slot(jid).await;
        let next_task = {
            let mut slot = slot_arc.lock().await;
            slot.active = None;
            slot.is_active_task = false;
            slot.pending_tasks.pop_front()
        };

        if let Some((_, task)) = next_task {
            slot_arc.lock().await.is_active_task = true;
            task().await;
            // The task is responsible for calling `finish_active` again
            // once its own container run concludes (it drives the same
            // agent-run pipeline as a user message would).
            return;
        }

        let recheck = {
            let mut slot = slot_arc.lock().await;
            std::mem::take(&mut slot.recheck_pending)
        };
        if recheck {
            if let Some(f) = self.process_messages_fn.read().await.clone() {
                f(jid.clone()).await;
            }
        }
    }

    /// Idempotent, coalescing: signal the pipeline to re-examine pending
    /// messages for `jid` once current activity ends.
    pub async fn enqueue_message_check(&self, jid: &WorkspaceId) {
        let slot = self.slot(jid).await;
        slot.lock().await.recheck_pending = true;
    }

    /// Schedule `fn` to run once the workspace goes idle. Multiple pending
    /// tasks queue FIFO.
    pub async fn enqueue_task(&self, jid: &WorkspaceId, task_id: impl Into<String>, f: TaskFn) {
        let slot = self.slot(jid).await;
        let mut slot = slot.lock().await;
        slot.pending_tasks.push_back((task_id.into(), f));
        drop(slot);

        // If nothing is active, kick off the queued task immediately rather
        // than waiting for some future `finish_active` call that may never
        // come.
        let slot_arc = self.slot(jid).await;
        let next = {
            let mut slot = slot_arc.lock().await;
            if slot.active.is_none() {
                slot.pending_tasks.pop_front()
            } else {
                None
            }
        };
        if let Some((_, task)) = next {
            slot_arc.lock().await.is_active_task = true;
            task().await;
        }
    }

    pub async fn is_active_task(&self, jid: &WorkspaceId) -> bool {
        self.slot(jid).await.lock().await.is_active_task
    }

    pub async fn is_active(&self, jid: &WorkspaceId) -> bool {
        self.slot(jid).await.lock().await.active.is_some()
    }

    /// Attempt to forward text into a running container's IPC input file.
    /// Returns `true` if a process was active to forward to.
    pub async fn send_message(&self, jid: &WorkspaceId, text: &str) -> bool {
        let slot = self.slot(jid).await;
        let slot = slot.lock().await;
        match &slot.active {
            Some(handle) => handle.input_tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Idle-signal the active container so it ends its current turn.
    pub async fn close_stdin(&self, jid: &WorkspaceId) {
        let slot = self.slot(jid).await;
        let slot = slot.lock().await;
        if let Some(handle) = &slot.active {
            if let Some(close_tx) = &handle.close_tx {
                let _ = close_tx.send(());
            }
        }
    }

    /// Drop queued work for a workspace without touching the active slot.
    pub async fn clear_pending_tasks(&self, jid: &WorkspaceId) {
        let slot = self.slot(jid).await;
        slot.lock().await.pending_tasks.clear();
    }

    /// Cooperatively terminate the active process, if any.
    pub async fn stop_active_process(&self, jid: &WorkspaceId) {
        let slot = self.slot(jid).await;
        let slot = slot.lock().await;
        if let Some(handle) = &slot.active {
            handle.cancel.cancel();
        }
    }

    /// Drain all active work and cancel everything queued.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().await.values().cloned().collect();
        for slot_arc in slots {
            let mut slot = slot_arc.lock().await;
            if let Some(handle) = &slot.active {
                handle.cancel.cancel();
            }
            slot.pending_tasks.clear();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> WorkspaceId {
        WorkspaceId::from(s)
    }

    #[tokio::test]
    async fn at_most_one_active_process_per_jid() {
        let queue = WorkspaceQueue::new();
        let w = jid("w1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ActiveProcessHandle {
            input_tx: tx,
            close_tx: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        queue.begin_active(&w, false, handle).await.unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let handle2 = ActiveProcessHandle {
            input_tx: tx2,
            close_tx: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        let err = queue.begin_active(&w, false, handle2).await.unwrap_err();
        assert!(matches!(err, crate::Error::Queue(QueueError::AlreadyActive { .. })));
    }

    #[tokio::test]
    async fn send_message_forwards_only_when_active() {
        let queue = WorkspaceQueue::new();
        let w = jid("w1");
        assert!(!queue.send_message(&w, "btw also check logs").await);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ActiveProcessHandle {
            input_tx: tx,
            close_tx: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        queue.begin_active(&w, false, handle).await.unwrap();
        assert!(queue.send_message(&w, "btw also check logs").await);
        assert_eq!(rx.recv().await.unwrap(), "btw also check logs");
    }

    #[tokio::test]
    async fn pending_tasks_run_fifo_after_slot_frees() {
        let queue = Arc::new(WorkspaceQueue::new());
        let w = jid("w1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ActiveProcessHandle {
            input_tx: tx,
            close_tx: None,
            cancel: tokio_util::sync::CancellationToken::new(),
        };
        queue.begin_active(&w, false, handle).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            queue
                .enqueue_task(
                    &w,
                    format!("t{i}"),
                    Box::new(move || {
                        Box::pin(async move {
                            order.lock().await.push(i);
                        })
                    }),
                )
                .await;
        }

        // First `finish_active` drains task 0; subsequent ones must be
        // driven explicitly the same way a real container completion would
        // call `finish_active` again.
        queue.finish_active(&w).await;
        queue.finish_active(&w).await;
        queue.finish_active(&w).await;
        queue.finish_active(&w).await;

        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn enqueue_message_check_is_idempotent_and_coalesces() {
        let queue = WorkspaceQueue::new();
        let w = jid("w1");
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = calls.clone();
        queue
            .set_process_messages_fn(Arc::new(move |_jid| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        queue.enqueue_message_check(&w).await;
        queue.enqueue_message_check(&w).await;
        queue.enqueue_message_check(&w).await;
        queue.finish_active(&w).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
