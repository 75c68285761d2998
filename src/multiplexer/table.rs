//! Job registrations, keyed by socket.
//!
//! While the poll loop runs a job the slot is marked running. Registrations
//! or removals that arrive from other threads in the meantime are recorded in
//! the slot and win over whatever the running job returns.

use super::job::{Job, JobResult, JobTarget};
use crate::events::SocketId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Idle(Job),
    Running,
    Replaced(Job),
    Removed,
}

struct Entry {
    target: Weak<dyn JobTarget>,
    slot: Slot,
}

#[derive(Default)]
pub(super) struct JobTable {
    entries: HashMap<SocketId, Entry>,
}

impl JobTable {
    /// Registers `job`, replacing any previous one. Returns true if one was
    /// replaced.
    pub fn insert(&mut self, id: SocketId, target: Weak<dyn JobTarget>, job: Job) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.target = target;
                let replaced = !matches!(entry.slot, Slot::Removed);
                entry.slot = match entry.slot {
                    Slot::Idle(_) => Slot::Idle(job),
                    Slot::Running | Slot::Replaced(_) | Slot::Removed => Slot::Replaced(job),
                };
                replaced
            }
            None => {
                self.entries.insert(
                    id,
                    Entry {
                        target,
                        slot: Slot::Idle(job),
                    },
                );
                false
            }
        }
    }

    /// Deregisters the socket's job. Returns false if none was registered.
    pub fn remove(&mut self, id: SocketId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        match entry.slot {
            Slot::Idle(_) => {
                self.entries.remove(&id);
                true
            }
            Slot::Running | Slot::Replaced(_) => {
                entry.slot = Slot::Removed;
                true
            }
            Slot::Removed => false,
        }
    }

    /// Marks an idle job as running and hands it out.
    ///
    /// Returns `None` if no idle job is registered or its socket is gone; a
    /// dead socket's entry is dropped.
    pub fn begin(&mut self, id: SocketId) -> Option<(Arc<dyn JobTarget>, Job)> {
        let entry = self.entries.get_mut(&id)?;
        let Slot::Idle(job) = entry.slot else {
            return None;
        };
        match entry.target.upgrade() {
            Some(target) => {
                entry.slot = Slot::Running;
                Some((target, job))
            }
            None => {
                self.entries.remove(&id);
                None
            }
        }
    }

    /// Applies the result of a finished job. Returns the job that is now
    /// registered, if any, so the caller can re-arm the socket.
    pub fn finish(&mut self, id: SocketId, ran: Job, result: JobResult) -> Option<Job> {
        let entry = self.entries.get_mut(&id)?;
        let next = match (entry.slot, result) {
            (Slot::Replaced(job), _) => Some(job),
            (Slot::Removed, _) => None,
            (_, JobResult::Continue) => Some(ran),
            (_, JobResult::Transition(job)) => Some(job),
            (_, JobResult::Done) => None,
        };
        match next {
            Some(job) => entry.slot = Slot::Idle(job),
            None => {
                self.entries.remove(&id);
            }
        }
        next
    }

    /// The job a socket will run next, if it has one.
    pub fn registered(&self, id: SocketId) -> Option<Job> {
        match self.entries.get(&id)?.slot {
            Slot::Idle(job) | Slot::Replaced(job) => Some(job),
            Slot::Running | Slot::Removed => None,
        }
    }

    /// Registered jobs, not counting removals that are waiting for a running
    /// job to return.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !matches!(entry.slot, Slot::Removed))
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
