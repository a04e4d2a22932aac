//! Scheduler error types.

use thiserror::Error;

use svm_core::{InstructionId, LogicalObjectId, StreamId, StreamTypeId};

use crate::instruction::Opcode;
use crate::report::DrainReport;

/// Errors that can occur while admitting, dispatching, or running
/// instructions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("{logical_object_id} is already bound on {stream}")]
    DuplicateSymbolBinding {
        logical_object_id: LogicalObjectId,
        stream: StreamId,
    },

    #[error("{instruction} on {stream} references unbound symbol {logical_object_id}")]
    UnboundSymbolReference {
        instruction: InstructionId,
        stream: StreamId,
        logical_object_id: LogicalObjectId,
    },

    #[error("{0} was run twice")]
    DoubleRun(InstructionId),

    #[error("cannot allocate {logical_object_id} with parallel_num 0")]
    InvalidParallelNum { logical_object_id: LogicalObjectId },

    #[error("{logical_object_id} has a deletion pending and can no longer be referenced")]
    SymbolPendingDeletion { logical_object_id: LogicalObjectId },

    #[error("{opcode} is not accepted by {stream} ({stream_type})")]
    UnsupportedOpcode {
        opcode: Opcode,
        stream: StreamId,
        stream_type: StreamTypeId,
    },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream name not found: {0}")]
    StreamNameNotFound(String),

    #[error("stream name already registered: {0}")]
    DuplicateStreamName(String),

    #[error("stream type not found: {0}")]
    StreamTypeNotFound(StreamTypeId),

    #[error("instruction not found: {0}")]
    InstructionNotFound(InstructionId),

    #[error("{0} has no fault to resolve")]
    NotFaulted(StreamId),

    #[error("fault on {0} was raised by an instruction that already ran; acknowledge it instead")]
    NotRetryable(StreamId),

    /// Parked streams wait on each other in a cycle. `report` holds what
    /// the drain did before it stalled.
    #[error("no stream can make progress; parked: {streams:?}")]
    Deadlock {
        streams: Vec<StreamId>,
        report: Box<DrainReport>,
    },

    #[error("logical object id space exhausted")]
    LogicalIdsExhausted,

    #[error("drain exceeded {0} scheduling passes")]
    PassLimitExceeded(u64),

    #[error("cannot shut down with queued instructions on {streams:?}")]
    ShutdownWithPendingWork { streams: Vec<StreamId> },

    #[error("scheduler has been shut down")]
    ShutDown,

    #[error("scheduler is poisoned after an invariant violation")]
    Poisoned,

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl SchedulerError {
    /// Errors that indicate a scheduler bug rather than a caller mistake.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SchedulerError::DoubleRun(_))
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
