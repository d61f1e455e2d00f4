//! Control-surface sessions.
//!
//! Every request that creates DMA tasks is issued through a [`Session`],
//! the equivalent of the file handle an application opens to talk to the
//! driver. Tasks hold a strong reference to their session until they
//! finish, so a session is torn down only after its last task completes.
//!
//! A task that fails after its creator stopped caring is parked in the
//! Failed-Task Registry until somebody waits for it. Tearing down the
//! session discards whatever is still parked there, so an application
//! that never waits cannot leak failed tasks.

use std::fmt;
use std::sync::Weak;

use crate::task::TaskShared;

/// An owning context for DMA tasks.
pub struct Session {
    id: u64,
    tasks: Weak<TaskShared>,
}

impl Session {
    pub(crate) fn new(id: u64, tasks: Weak<TaskShared>) -> Self {
        Self { id, tasks }
    }

    /// Unique id of this session.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.collect_orphans(self.id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
