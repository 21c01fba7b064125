use crate::Error;

use std::collections::VecDeque;

use codec::CloseCode;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

/// An outbound work item of a client.
///
/// Every frame written to a client's connection travels through its task
/// queue, which is what gives a client a total order of outbound frames and a
/// well defined flush point on close.
#[derive(Debug)]
pub enum Task {
    /// A packed protocol frame from the server to this client.
    Send(Vec<u8>),
    /// A raw frame relayed from a peer. Dropping the sender without sending
    /// reports the relay back as undeliverable.
    Relay(Vec<u8>, oneshot::Sender<()>),
    /// Delayed close of the connection, queued behind pending work.
    Close(CloseCode),
}

/// Lifecycle of a task queue. The state only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskQueueState {
    Open,
    Closed,
    Cancelled,
}

struct Inner {
    tasks: VecDeque<Task>,
    state: TaskQueueState,
    // Number of enqueued tasks that have not been marked as done yet. This
    // also counts tasks currently executed by the task loop.
    pending: usize,
}

/// Per-client FIFO of outbound work items.
///
/// The queue is filled by the server and by peers relaying frames towards
/// the client, and drained by the client's own task loop only.
///
/// # Test
///
/// ```
/// use salty_server_service::client::queue::{Task, TaskQueue, TaskQueueState};
///
/// tokio::runtime::Runtime::new().unwrap().block_on(async {
///     let queue = TaskQueue::default();
///     queue.enqueue(Task::Send(vec![1]), false).unwrap();
///
///     assert!(matches!(queue.dequeue().await, Some(Task::Send(_))));
///     queue.task_done().unwrap();
///
///     queue.close();
///     assert_eq!(queue.state(), TaskQueueState::Closed);
///     assert!(queue.enqueue(Task::Send(vec![2]), false).is_err());
///     assert!(queue.dequeue().await.is_none());
///
///     queue.join().await;
/// });
/// ```
pub struct TaskQueue {
    inner: Mutex<Inner>,
    readable: Notify,
    drained: Notify,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                state: TaskQueueState::Open,
                pending: 0,
            }),
            readable: Notify::new(),
            drained: Notify::new(),
        }
    }
}

impl TaskQueue {
    pub fn state(&self) -> TaskQueueState {
        self.inner.lock().state
    }

    /// Enqueue a task.
    ///
    /// Refused tasks are handed back so the caller can observe the
    /// cancellation; dropping a refused `Task::Relay` resolves the relay as
    /// undeliverable. `ignore_closed` admits a task into a closed (but not
    /// cancelled) queue, which is how `Client::drop` appends the delayed
    /// close behind work that is already queued.
    pub fn enqueue(&self, task: Task, ignore_closed: bool) -> Result<(), Task> {
        {
            let mut inner = self.inner.lock();
            let admitted = match inner.state {
                TaskQueueState::Open => true,
                TaskQueueState::Closed => ignore_closed,
                TaskQueueState::Cancelled => false,
            };

            if !admitted {
                return Err(task);
            }

            inner.tasks.push_back(task);
            inner.pending += 1;
        }

        self.readable.notify_one();
        Ok(())
    }

    /// Await the next task. Returns `None` once the queue is closed or
    /// cancelled and no task is left.
    ///
    /// Shall only be called by the client's task loop.
    pub async fn dequeue(&self) -> Option<Task> {
        loop {
            let readable = self.readable.notified();

            {
                let mut inner = self.inner.lock();
                if let Some(task) = inner.tasks.pop_front() {
                    return Some(task);
                }

                if inner.state > TaskQueueState::Open {
                    return None;
                }
            }

            readable.await;
        }
    }

    /// Mark a previously dequeued task as processed.
    pub fn task_done(&self) -> Result<(), Error> {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.pending == 0 {
                return Err(Error::Internal("more tasks marked as done than were enqueued"));
            }

            inner.pending -= 1;
            inner.pending == 0
        };

        if drained {
            self.drained.notify_waiters();
        }

        Ok(())
    }

    /// Forbid further enqueues without disturbing pending tasks.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state >= TaskQueueState::Closed {
                return;
            }

            inner.state = TaskQueueState::Closed;
        }

        log::debug!("closed task queue");
        self.readable.notify_one();
    }

    /// Cancel all pending tasks and forbid further enqueues.
    ///
    /// Each pending task is dropped before it is marked as done, so anyone
    /// observing the cancellation (for example a relay watcher producing a
    /// `send-error`) sees it before `join` unblocks.
    pub fn cancel(&self) {
        let tasks = {
            let mut inner = self.inner.lock();
            if inner.state == TaskQueueState::Cancelled {
                return;
            }

            inner.state = TaskQueueState::Cancelled;
            std::mem::take(&mut inner.tasks)
        };

        log::debug!("cancelling {} queued tasks", tasks.len());
        self.readable.notify_one();

        for task in tasks {
            drop(task);
            // The pending counter covers every queued task, this cannot
            // underflow.
            let _ = self.task_done();
        }
    }

    /// Await until every enqueued task has been marked as done.
    pub async fn join(&self) {
        loop {
            let drained = self.drained.notified();

            if self.inner.lock().pending == 0 {
                return;
            }

            drained.await;
        }
    }
}
