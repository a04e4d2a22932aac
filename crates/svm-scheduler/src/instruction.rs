//! VmInstructionMsg — the unit of work admitted to a stream.
//!
//! An instruction is an opcode, an ordered operand list, and a body. Control
//! bodies describe a symbol lifecycle change; compute bodies carry an opaque
//! kernel the scheduler never inspects. Messages are immutable once built.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use svm_core::{LogicalObjectId, StreamId};

use crate::compute::KernelContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    NewMirroredObjectSymbol,
    DeleteMirroredObjectSymbol,
    Compute,
}

impl Opcode {
    /// Whether this opcode mutates the symbol registry.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::NewMirroredObjectSymbol | Opcode::DeleteMirroredObjectSymbol
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::NewMirroredObjectSymbol => "NewMirroredObjectSymbol",
            Opcode::DeleteMirroredObjectSymbol => "DeleteMirroredObjectSymbol",
            Opcode::Compute => "Compute",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a kernel may use an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

/// What an operand points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandRef {
    /// Any binding of the logical object, preferring the instruction's own
    /// stream.
    Logical(LogicalObjectId),
    /// The binding on one specific stream.
    Symbol {
        stream: StreamId,
        logical_object_id: LogicalObjectId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operand {
    pub target: OperandRef,
    pub access: Access,
}

impl Operand {
    pub fn read(logical_object_id: LogicalObjectId) -> Self {
        Self {
            target: OperandRef::Logical(logical_object_id),
            access: Access::Read,
        }
    }

    pub fn write(logical_object_id: LogicalObjectId) -> Self {
        Self {
            target: OperandRef::Logical(logical_object_id),
            access: Access::Write,
        }
    }

    pub fn read_symbol(stream: StreamId, logical_object_id: LogicalObjectId) -> Self {
        Self {
            target: OperandRef::Symbol {
                stream,
                logical_object_id,
            },
            access: Access::Read,
        }
    }

    pub fn write_symbol(stream: StreamId, logical_object_id: LogicalObjectId) -> Self {
        Self {
            target: OperandRef::Symbol {
                stream,
                logical_object_id,
            },
            access: Access::Write,
        }
    }

    pub fn logical_object_id(&self) -> LogicalObjectId {
        match self.target {
            OperandRef::Logical(id) => id,
            OperandRef::Symbol {
                logical_object_id, ..
            } => logical_object_id,
        }
    }

    /// The stream an operand is pinned to, if any.
    pub fn pinned_stream(&self) -> Option<StreamId> {
        match self.target {
            OperandRef::Logical(_) => None,
            OperandRef::Symbol { stream, .. } => Some(stream),
        }
    }
}

/// Opaque device work supplied by the kernel layer.
pub type KernelFn = dyn Fn(&mut KernelContext<'_>) -> anyhow::Result<()> + Send + Sync;

/// A named compute payload.
#[derive(Clone)]
pub struct ComputeOp {
    name: String,
    kernel: Arc<KernelFn>,
}

impl ComputeOp {
    pub fn new<F>(name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&mut KernelContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kernel: Arc::new(kernel),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: &mut KernelContext<'_>) -> anyhow::Result<()> {
        (self.kernel)(ctx)
    }
}

impl fmt::Debug for ComputeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeOp").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum InstructionBody {
    NewMirroredObjectSymbol {
        logical_object_id: LogicalObjectId,
        is_remote: bool,
        parallel_num: u32,
    },
    DeleteMirroredObjectSymbol {
        logical_object_id: LogicalObjectId,
    },
    Compute(ComputeOp),
}

/// An immutable instruction message.
#[derive(Debug, Clone)]
pub struct VmInstructionMsg {
    operands: Vec<Operand>,
    body: InstructionBody,
}

impl VmInstructionMsg {
    pub(crate) fn control(body: InstructionBody) -> Self {
        let operands = match &body {
            InstructionBody::DeleteMirroredObjectSymbol { logical_object_id } => {
                vec![Operand::write(*logical_object_id)]
            }
            _ => Vec::new(),
        };
        Self { operands, body }
    }

    /// Build a compute instruction over the given operands.
    pub fn compute(op: ComputeOp, operands: Vec<Operand>) -> Self {
        Self {
            operands,
            body: InstructionBody::Compute(op),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self.body {
            InstructionBody::NewMirroredObjectSymbol { .. } => Opcode::NewMirroredObjectSymbol,
            InstructionBody::DeleteMirroredObjectSymbol { .. } => {
                Opcode::DeleteMirroredObjectSymbol
            }
            InstructionBody::Compute(_) => Opcode::Compute,
        }
    }

    pub fn operands(&self) -> &[Operand] {
        &self.operands
    }

    pub fn body(&self) -> &InstructionBody {
        &self.body
    }

    /// Logical object this instruction creates a binding for.
    pub fn creates(&self) -> Option<LogicalObjectId> {
        match self.body {
            InstructionBody::NewMirroredObjectSymbol {
                logical_object_id, ..
            } => Some(logical_object_id),
            _ => None,
        }
    }

    /// Logical object this instruction deletes a binding for.
    pub fn deletes(&self) -> Option<LogicalObjectId> {
        match self.body {
            InstructionBody::DeleteMirroredObjectSymbol { logical_object_id } => {
                Some(logical_object_id)
            }
            _ => None,
        }
    }

    /// Operands that must be live when this instruction dispatches.
    ///
    /// A deletion's own target is excluded: it waits for the object to
    /// become unreferenced instead.
    pub fn references(&self) -> impl Iterator<Item = &Operand> {
        let counted = self.deletes().is_none();
        self.operands.iter().filter(move |_| counted)
    }
}
