//! Completion plumbing between the hardware submitter and the task registry.
//!
//! Every request handed to a [`DmaSubmitter`](crate::DmaSubmitter) carries a
//! [`DmaCompletion`] owning one reference on its task. The submitter fires it
//! from its completion callback, which drops the reference and records the
//! status.
//!
//! # Pattern
//!
//! 1. The core hands a [`DmaCompletion`] to the submitter along with the request
//! 2. A C submitter converts it via [`DmaCompletion::into_raw()`] and passes
//!    the pointer as callback context
//! 3. In the callback, it reconstructs the completion via [`DmaCompletion::from_raw()`]
//! 4. It reports the outcome with [`complete()`](DmaCompletion::complete)
//!
//! [`TaskWait`] is the async side: a future resolving once a task has left
//! the active registry.

use std::ffi::c_void;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_channel::oneshot;

use crate::error::{Error, Result};
use crate::task::{TaskId, TaskRef, TaskShared, WaitState};

/// Completion handle for one in-flight hardware request.
///
/// Dropping it without reporting an outcome records
/// [`Error::Cancelled`] on the task, so a lost callback can never leave
/// the task active forever.
pub struct DmaCompletion {
    task: Option<TaskRef>,
}

impl DmaCompletion {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self { task: Some(task) }
    }

    /// Task this request belongs to.
    pub fn task_id(&self) -> TaskId {
        match &self.task {
            Some(task) => task.id(),
            None => unreachable!("completion already consumed"),
        }
    }

    /// Convert the completion to a raw pointer for passing to C callbacks.
    ///
    /// # Safety
    ///
    /// The returned pointer must be passed to [`from_raw()`](Self::from_raw)
    /// exactly once, otherwise the task never completes.
    pub fn into_raw(self) -> *mut c_void {
        Box::into_raw(Box::new(self)) as *mut c_void
    }

    /// Reconstruct a completion from a raw pointer.
    ///
    /// # Safety
    ///
    /// The pointer must have been created by [`into_raw()`](Self::into_raw)
    /// and must not have been used already.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        unsafe { *Box::from_raw(ptr as *mut DmaCompletion) }
    }

    /// Report the outcome of the request.
    pub fn complete(mut self, result: Result<()>) {
        let status = match &result {
            Ok(()) => 0,
            Err(err) => err.status(),
        };
        if let Some(task) = self.task.take() {
            task.release(status);
        }
    }

    /// Report success.
    pub fn success(self) {
        self.complete(Ok(()));
    }

    /// Report failure.
    pub fn error(self, err: Error) {
        self.complete(Err(err));
    }
}

impl Drop for DmaCompletion {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            tracing::warn!(task_id = %task.id(), "DMA completion dropped without a result");
            task.release(Error::Cancelled.status());
        }
    }
}

impl std::fmt::Debug for DmaCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaCompletion")
            .field("task", &self.task.as_ref().map(TaskRef::id))
            .finish()
    }
}

/// Future resolving when a DMA task leaves the active registry.
///
/// Resolves to [`Error::Io`] carrying the task's first error if it failed,
/// collecting the failed task the same way a blocking wait does.
pub struct TaskWait {
    tasks: Arc<TaskShared>,
    id: TaskId,
    rx: Option<oneshot::Receiver<()>>,
}

impl TaskWait {
    pub(crate) fn new(tasks: Arc<TaskShared>, id: TaskId) -> Self {
        Self { tasks, id, rx: None }
    }

    /// Task being waited for.
    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(rx) = this.rx.as_mut() {
                // any task of the bucket finishing wakes us; recheck ours
                match Pin::new(rx).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(_) => this.rx = None,
                }
            }
            match this.tasks.poll_wait(this.id) {
                WaitState::Failed(status) => return Poll::Ready(Err(Error::Io { status })),
                WaitState::Done => return Poll::Ready(Ok(())),
                WaitState::Running(rx) => this.rx = Some(rx),
            }
        }
    }
}

impl std::fmt::Debug for TaskWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWait").field("id", &self.id).finish()
    }
}
