//! Stream — an ordered instruction queue bound to one stream type.
//!
//! A stream runs its instructions one at a time in admission order. Only the
//! scheduler mutates a stream; everyone else gets `&Stream`.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::debug;

use svm_core::{InstructionId, StreamId, StreamTypeId};

use crate::error::SchedulerError;

/// Why a stream stopped dispatching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamFault {
    pub instruction: InstructionId,
    #[serde(serialize_with = "serialize_error")]
    pub error: SchedulerError,
    /// The faulting instruction already left the queue (it ran and
    /// failed). Otherwise it is still the head.
    pub consumed: bool,
}

fn serialize_error<S: serde::Serializer>(error: &SchedulerError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

#[derive(Debug)]
pub struct Stream {
    /// Position in registration order.
    id: StreamId,
    /// Unique name used by topologies and scripts.
    name: String,
    stream_type: StreamTypeId,
    /// Admitted instructions in FIFO order; the front is the head.
    queue: VecDeque<InstructionId>,
    /// Most recent instruction dispatched from this stream.
    last_completed: Option<InstructionId>,
    /// Instructions dispatched from this stream; skipped ones do not count.
    completed: u64,
    /// Set while the stream is halted and waiting for the caller.
    fault: Option<StreamFault>,
}

impl Stream {
    pub(crate) fn new(id: StreamId, name: String, stream_type: StreamTypeId) -> Self {
        Self {
            id,
            name,
            stream_type,
            queue: VecDeque::new(),
            last_completed: None,
            completed: 0,
            fault: None,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_type(&self) -> StreamTypeId {
        self.stream_type
    }

    pub fn head(&self) -> Option<InstructionId> {
        self.queue.front().copied()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued instruction ids, head first.
    pub fn queued(&self) -> impl Iterator<Item = InstructionId> + '_ {
        self.queue.iter().copied()
    }

    /// Most recent instruction dispatched from this stream.after running.
    pub fn last_completed(&self) -> Option<InstructionId> {
        self.last_completed
    }

    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    pub fn fault(&self) -> Option<&StreamFault> {
        self.fault.as_ref()
    }

    pub fn is_halted(&self) -> bool {
        self.fault.is_some()
    }

    pub(crate) fn push(&mut self, id: InstructionId) {
        self.queue.push_back(id);
    }

    /// Remove the head, which must be `id`.
    pub(crate) fn pop_head(&mut self, id: InstructionId) -> bool {
        if self.head() == Some(id) {
            self.queue.pop_front();
            true
        } else {
            false
        }
    }

    /// Advance the completion marker. Ids only ever grow within one stream
    /// because the queue is FIFO and ids are issued in admission order.
    pub(crate) fn mark_completed(&mut self, id: InstructionId) {
        debug_assert!(self.last_completed.is_none_or(|last| last < id));
        self.last_completed = Some(id);
        self.completed += 1;
        debug!(stream = %self.id, instruction = %id, completed = self.completed, "stream advanced");
    }

    pub(crate) fn set_fault(&mut self, fault: StreamFault) {
        self.fault = Some(fault);
    }

    pub(crate) fn take_fault(&mut self) -> Option<StreamFault> {
        self.fault.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream::new(StreamId::new(0), "gpu0".to_string(), StreamTypeId::new(1))
    }

    #[test]
    fn queue_is_fifo() {
        let mut s = stream();
        s.push(InstructionId::new(1));
        s.push(InstructionId::new(2));
        assert_eq!(s.head(), Some(InstructionId::new(1)));
        assert!(s.pop_head(InstructionId::new(1)));
        assert_eq!(s.head(), Some(InstructionId::new(2)));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn pop_head_rejects_non_head() {
        let mut s = stream();
        s.push(InstructionId::new(1));
        s.push(InstructionId::new(2));
        assert!(!s.pop_head(InstructionId::new(2)));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn completion_marker_advances() {
        let mut s = stream();
        assert_eq!(s.last_completed(), None);
        s.mark_completed(InstructionId::new(3));
        s.mark_completed(InstructionId::new(8));
        assert_eq!(s.last_completed(), Some(InstructionId::new(8)));
        assert_eq!(s.completed_count(), 2);
    }

    #[test]
    fn fault_halts_until_taken() {
        let mut s = stream();
        s.set_fault(StreamFault {
            instruction: InstructionId::new(1),
            error: SchedulerError::DoubleRun(InstructionId::new(1)),
            consumed: true,
        });
        assert!(s.is_halted());
        assert!(s.take_fault().is_some());
        assert!(!s.is_halted());
    }

    #[test]
    fn fault_serializes_error_as_message() {
        let fault = StreamFault {
            instruction: InstructionId::new(4),
            error: SchedulerError::DoubleRun(InstructionId::new(4)),
            consumed: false,
        };
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json["error"], "instr#4 was run twice");
        assert_eq!(json["instruction"], 4);
    }
}
