//! svm-scheduler — the streamvm instruction scheduling runtime.
//!
//! Dispatches control and compute instructions onto independent streams
//! while tracking which distributed objects are bound where. An instruction
//! never runs before the objects it references are bound, and a deletion
//! never runs while anything queued still references its object.
//!
//! # Architecture
//!
//! ```text
//! VpuScheduler
//!   ├── StreamTypeTable (StreamTypeId → Control | Compute capability table)
//!   ├── Vec<Stream> (FIFO queues, registration order = tie-break order)
//!   ├── InstructionArena (admitted messages + holder counts)
//!   ├── PendingIndex (queued references/creations/deletions, parked streams)
//!   └── SymbolRegistry ((LogicalObjectId, StreamId) → replica slots)
//! ```
//!
//! `VmService` wraps a scheduler for async callers.

pub mod arena;
pub mod compute;
pub mod control;
pub mod error;
pub mod instruction;
pub mod pending;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod stream;
pub mod stream_type;

pub use arena::InstructionState;
pub use compute::{ComputeStreamType, KernelContext, ResolvedOperand};
pub use control::{ControlEffect, ControlStreamType};
pub use error::{SchedulerError, SchedulerResult};
pub use instruction::{Access, ComputeOp, InstructionBody, Opcode, Operand, OperandRef, VmInstructionMsg};
pub use pending::HoldReason;
pub use registry::{
    BindingSnapshot, MirroredObjectSymbol, RegistrySnapshot, ReplicaSlot, SlotBuffer, SlotSnapshot, SymbolRegistry,
};
pub use report::{Completion, DrainReport, HaltedStream, Outcome, PassSummary};
pub use scheduler::VpuScheduler;
pub use service::VmService;
pub use stream::{Stream, StreamFault};
pub use stream_type::{StreamType, StreamTypeTable};
