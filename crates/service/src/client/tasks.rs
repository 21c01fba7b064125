use crate::Error;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

#[derive(Default)]
struct Inner {
    cancelled: bool,
    task_loop: Option<AbortHandle>,
    receive_loop: Option<AbortHandle>,
    keep_alive_loop: Option<AbortHandle>,
}

/// The background activities of a connected client: the task loop, the
/// receive loop and the keep alive loop.
///
/// A drop request may arrive from a peer before the client's own connection
/// handler had a chance to spawn the loops. In that case the cancellation is
/// recorded and applied by `set` as soon as the handles arrive. The task loop
/// is always spared, it has to keep running to drain the queued writes.
#[derive(Default)]
pub struct ClientTasks {
    inner: Mutex<Inner>,
}

impl ClientTasks {
    /// Register the loop handles. Must be called exactly once.
    pub fn set(
        &self,
        task_loop: AbortHandle,
        receive_loop: Option<AbortHandle>,
        keep_alive_loop: Option<AbortHandle>,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.task_loop.is_some() {
            return Err(Error::Internal("client tasks already set"));
        }

        inner.task_loop = Some(task_loop);
        inner.receive_loop = receive_loop;
        inner.keep_alive_loop = keep_alive_loop;

        // A cancellation requested before the handles were known.
        if inner.cancelled {
            Self::abort_auxiliary(&inner);
        }

        Ok(())
    }

    /// Cancel the receive loop and the keep alive loop. Idempotent.
    pub fn cancel_all_but_task_loop(&self) {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        Self::abort_auxiliary(&inner);
    }

    fn abort_auxiliary(inner: &Inner) {
        if let Some(handle) = &inner.receive_loop {
            handle.abort();
        }

        if let Some(handle) = &inner.keep_alive_loop {
            handle.abort();
        }
    }
}
