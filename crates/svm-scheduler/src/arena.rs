//! InstructionArena — admitted instructions indexed by a stable id.
//!
//! Each entry carries an explicit holder count. The stream queue holds an
//! instruction from admission until it leaves the queue; the execution
//! context holds it while it runs; callers may add their own holds. The
//! entry is freed when the count reaches zero.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use svm_core::{InstructionId, StreamId};

use crate::error::{SchedulerError, SchedulerResult};
use crate::instruction::VmInstructionMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionState {
    /// Admitted, waiting in its stream's queue.
    Queued,
    /// Dispatched and currently executing.
    Running,
    Completed,
    Failed,
    /// Removed from its queue without running.
    Dropped,
}

impl InstructionState {
    pub fn has_run(self) -> bool {
        !matches!(self, InstructionState::Queued | InstructionState::Dropped)
    }
}

#[derive(Debug)]
struct ArenaEntry {
    msg: VmInstructionMsg,
    stream: StreamId,
    state: InstructionState,
    holders: u32,
}

#[derive(Debug, Default)]
pub struct InstructionArena {
    entries: BTreeMap<InstructionId, ArenaEntry>,
    next_id: u64,
}

impl InstructionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a message. The returned id starts with one holder (the queue).
    pub fn insert(&mut self, stream: StreamId, msg: VmInstructionMsg) -> InstructionId {
        let id = InstructionId::new(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ArenaEntry {
                msg,
                stream,
                state: InstructionState::Queued,
                holders: 1,
            },
        );
        id
    }

    pub fn get(&self, id: InstructionId) -> Option<&VmInstructionMsg> {
        self.entries.get(&id).map(|e| &e.msg)
    }

    pub fn stream_of(&self, id: InstructionId) -> Option<StreamId> {
        self.entries.get(&id).map(|e| e.stream)
    }

    pub fn state(&self, id: InstructionId) -> Option<InstructionState> {
        self.entries.get(&id).map(|e| e.state)
    }

    pub fn holders(&self, id: InstructionId) -> Option<u32> {
        self.entries.get(&id).map(|e| e.holders)
    }

    /// Number of instructions still held by someone.
    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    fn was_issued(&self, id: InstructionId) -> bool {
        id.as_u64() < self.next_id
    }

    fn entry_mut(&mut self, id: InstructionId) -> SchedulerResult<&mut ArenaEntry> {
        self.entries
            .get_mut(&id)
            .ok_or(SchedulerError::InstructionNotFound(id))
    }

    pub fn retain(&mut self, id: InstructionId) -> SchedulerResult<u32> {
        let entry = self.entry_mut(id)?;
        entry.holders += 1;
        Ok(entry.holders)
    }

    /// Drop one hold; the entry is freed when none remain.
    pub fn release(&mut self, id: InstructionId) -> SchedulerResult<u32> {
        let entry = self.entry_mut(id)?;
        entry.holders = entry.holders.saturating_sub(1);
        let remaining = entry.holders;
        if remaining == 0 {
            self.entries.remove(&id);
            trace!(instruction = %id, "instruction freed");
        }
        Ok(remaining)
    }

    /// Transition a queued instruction to running and take the execution
    /// context's hold on it.
    ///
    /// Any instruction that has already started (or was freed after running)
    /// is a `DoubleRun`.
    pub fn begin_run(&mut self, id: InstructionId) -> SchedulerResult<()> {
        if !self.was_issued(id) {
            return Err(SchedulerError::InstructionNotFound(id));
        }
        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(SchedulerError::DoubleRun(id));
        };
        if entry.state != InstructionState::Queued {
            return Err(SchedulerError::DoubleRun(id));
        }
        entry.state = InstructionState::Running;
        entry.holders += 1;
        Ok(())
    }

    /// Record the outcome of a run. The execution hold is released
    /// separately via `release`.
    pub fn finish(&mut self, id: InstructionId, succeeded: bool) -> SchedulerResult<()> {
        let entry = self.entry_mut(id)?;
        entry.state = if succeeded {
            InstructionState::Completed
        } else {
            InstructionState::Failed
        };
        Ok(())
    }

    pub fn mark_dropped(&mut self, id: InstructionId) -> SchedulerResult<()> {
        self.entry_mut(id)?.state = InstructionState::Dropped;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{ComputeOp, VmInstructionMsg};

    fn msg() -> VmInstructionMsg {
        VmInstructionMsg::compute(ComputeOp::new("noop", |_| Ok(())), Vec::new())
    }

    const S: StreamId = StreamId::new(0);

    #[test]
    fn ids_are_sequential_and_start_queued() {
        let mut arena = InstructionArena::new();
        let a = arena.insert(S, msg());
        let b = arena.insert(S, msg());
        assert!(a < b);
        assert_eq!(arena.state(a), Some(InstructionState::Queued));
        assert_eq!(arena.holders(a), Some(1));
        assert_eq!(arena.stream_of(b), Some(S));
    }

    #[test]
    fn entry_freed_when_last_holder_releases() {
        let mut arena = InstructionArena::new();
        let id = arena.insert(S, msg());
        arena.begin_run(id).unwrap();
        assert_eq!(arena.holders(id), Some(2));

        assert_eq!(arena.release(id).unwrap(), 1);
        arena.finish(id, true).unwrap();
        assert_eq!(arena.release(id).unwrap(), 0);
        assert!(arena.get(id).is_none());
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn caller_hold_outlives_execution() {
        let mut arena = InstructionArena::new();
        let id = arena.insert(S, msg());
        arena.retain(id).unwrap();
        arena.begin_run(id).unwrap();
        arena.finish(id, false).unwrap();
        arena.release(id).unwrap();
        arena.release(id).unwrap();

        assert_eq!(arena.state(id), Some(InstructionState::Failed));
        assert_eq!(arena.release(id).unwrap(), 0);
    }

    #[test]
    fn second_begin_run_is_double_run() {
        let mut arena = InstructionArena::new();
        let id = arena.insert(S, msg());
        arena.begin_run(id).unwrap();
        assert_eq!(arena.begin_run(id), Err(SchedulerError::DoubleRun(id)));
    }

    #[test]
    fn begin_run_after_free_is_double_run() {
        let mut arena = InstructionArena::new();
        let id = arena.insert(S, msg());
        arena.begin_run(id).unwrap();
        arena.finish(id, true).unwrap();
        arena.release(id).unwrap();
        arena.release(id).unwrap();
        assert_eq!(arena.begin_run(id), Err(SchedulerError::DoubleRun(id)));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mut arena = InstructionArena::new();
        let id = InstructionId::new(99);
        assert_eq!(arena.begin_run(id), Err(SchedulerError::InstructionNotFound(id)));
        assert!(arena.retain(id).is_err());
    }
}
