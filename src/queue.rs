use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::task::DownloadTask;

/// FIFO feeding the worker pool. Tasks may be pushed after workers have
/// started; `pop` only resolves to `None` once the queue is closed and
/// drained, so idle workers block awaiting new work or closure.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

struct QueueInner {
    pending: VecDeque<DownloadTask>,
    closed: bool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a task; hands the task back if intake has been closed.
    pub fn push(&self, task: DownloadTask) -> Result<(), DownloadTask> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(task);
            }
            inner.pending.push_back(task);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Stop accepting new work. Blocked `pop` calls resolve once the
    /// remaining tasks are drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Dequeue the next task, waiting while the queue is empty but open.
    pub async fn pop(&self) -> Option<DownloadTask> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(task) = inner.pending.pop_front() {
                    return Some(task);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Remove every pending task, e.g. to mark them cancelled.
    pub fn drain(&self) -> Vec<DownloadTask> {
        self.lock().pending.drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("task queue lock poisoned")
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
