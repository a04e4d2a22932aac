//! Compute stream type — runs opaque device work over resolved operands.
//!
//! By the time a compute instruction reaches `run`, the scheduler has
//! already resolved every operand to a live binding. `run` never touches
//! the registry itself; it only sees cloned handles to replica slots.

use std::panic::{AssertUnwindSafe, catch_unwind};

use anyhow::{anyhow, bail};
use tracing::{debug, warn};

use svm_core::{InstructionId, LogicalObjectId, StreamId};

use crate::instruction::{Access, ComputeOp, Opcode, Operand, OperandRef};
use crate::registry::{MirroredObjectSymbol, ReplicaSlot, SymbolRegistry};

/// An operand bound to concrete replica slots.
#[derive(Debug, Clone)]
pub struct ResolvedOperand {
    logical_object_id: LogicalObjectId,
    owner: StreamId,
    access: Access,
    slots: Vec<ReplicaSlot>,
}

impl ResolvedOperand {
    fn new(symbol: &MirroredObjectSymbol, access: Access) -> Self {
        Self {
            logical_object_id: symbol.logical_object_id(),
            owner: symbol.stream(),
            access,
            slots: symbol.slots().to_vec(),
        }
    }

    pub fn logical_object_id(&self) -> LogicalObjectId {
        self.logical_object_id
    }

    /// Stream that owns the binding this operand resolved to.
    pub fn owner(&self) -> StreamId {
        self.owner
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn parallel_num(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slots(&self) -> &[ReplicaSlot] {
        &self.slots
    }
}

/// What a kernel sees while it runs.
pub struct KernelContext<'a> {
    instruction: InstructionId,
    stream: StreamId,
    device: &'a str,
    operands: &'a [ResolvedOperand],
}

impl<'a> KernelContext<'a> {
    pub fn instruction(&self) -> InstructionId {
        self.instruction
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn device(&self) -> &str {
        self.device
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn operand(&self, index: usize) -> anyhow::Result<&'a ResolvedOperand> {
        self.operands
            .get(index)
            .ok_or_else(|| anyhow!("operand {index} out of range ({} operands)", self.operands.len()))
    }

    fn slot(&self, index: usize, parallel_id: u32) -> anyhow::Result<&'a ReplicaSlot> {
        let operand = self.operand(index)?;
        operand.slots.get(parallel_id as usize).ok_or_else(|| {
            anyhow!(
                "{} has no replica {parallel_id} (parallel_num {})",
                operand.logical_object_id,
                operand.parallel_num()
            )
        })
    }

    /// Copy out the contents of one local replica.
    pub fn read(&self, index: usize, parallel_id: u32) -> anyhow::Result<Vec<f32>> {
        let slot = self.slot(index, parallel_id)?;
        let Some(buffer) = slot.buffer() else {
            bail!("replica {parallel_id} of operand {index} is remote");
        };
        let data = buffer
            .lock()
            .map_err(|_| anyhow!("replica {parallel_id} of operand {index} is poisoned"))?;
        Ok(data.clone())
    }

    /// Mutate one local replica of an operand declared `Write`.
    pub fn write<R>(
        &mut self,
        index: usize,
        parallel_id: u32,
        f: impl FnOnce(&mut Vec<f32>) -> R,
    ) -> anyhow::Result<R> {
        let operand = self.operand(index)?;
        if operand.access != Access::Write {
            bail!("operand {index} ({}) is read-only", operand.logical_object_id);
        }
        let slot = self.slot(index, parallel_id)?;
        let Some(buffer) = slot.buffer() else {
            bail!("replica {parallel_id} of operand {index} is remote");
        };
        let mut data = buffer
            .lock()
            .map_err(|_| anyhow!("replica {parallel_id} of operand {index} is poisoned"))?;
        Ok(f(&mut data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeStreamType {
    device: String,
}

impl ComputeStreamType {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn accepts(&self, opcode: Opcode) -> bool {
        opcode == Opcode::Compute
    }

    /// Resolve one operand as seen from `stream`. `None` means the operand
    /// has no completed binding.
    pub(crate) fn resolve(
        registry: &SymbolRegistry,
        stream: StreamId,
        operand: &Operand,
    ) -> Option<ResolvedOperand> {
        let symbol = match operand.target {
            OperandRef::Logical(id) => registry.resolve(id, stream),
            OperandRef::Symbol {
                stream: owner,
                logical_object_id,
            } => registry.get(logical_object_id, owner),
        }?;
        Some(ResolvedOperand::new(symbol, operand.access))
    }

    /// Run one compute instruction. Kernel errors and panics are reported as
    /// a message; they never take the stream down.
    pub fn run(&self, job: &ComputeJob) -> Result<(), String> {
        let mut ctx = KernelContext {
            instruction: job.instruction,
            stream: job.stream,
            device: &self.device,
            operands: &job.operands,
        };
        let result = catch_unwind(AssertUnwindSafe(|| job.op.invoke(&mut ctx)));
        match result {
            Ok(Ok(())) => {
                debug!(instruction = %job.instruction, op = job.op.name(), device = %self.device, "kernel finished");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(instruction = %job.instruction, op = job.op.name(), error = %e, "kernel failed");
                Err(format!("{}: {e:#}", job.op.name()))
            }
            Err(_) => {
                warn!(instruction = %job.instruction, op = job.op.name(), "kernel panicked");
                Err(format!("{}: kernel panicked", job.op.name()))
            }
        }
    }
}

/// A compute instruction ready to execute, detached from the scheduler so it
/// can run on a worker thread.
#[derive(Debug, Clone)]
pub struct ComputeJob {
    pub(crate) instruction: InstructionId,
    pub(crate) stream: StreamId,
    pub(crate) stream_type: ComputeStreamType,
    pub(crate) op: ComputeOp,
    pub(crate) operands: Vec<ResolvedOperand>,
}

impl ComputeJob {
    pub fn execute(&self) -> Result<(), String> {
        self.stream_type.run(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: StreamId = StreamId::new(0);

    fn registry_with(id: u64, is_remote: bool, parallel_num: u32) -> SymbolRegistry {
        let mut registry = SymbolRegistry::new();
        let symbol = MirroredObjectSymbol::allocate(
            LogicalObjectId::new(id),
            A,
            is_remote,
            parallel_num,
            InstructionId::new(0),
        )
        .unwrap();
        registry.bind(symbol).unwrap();
        registry
    }

    fn job(op: ComputeOp, operands: Vec<ResolvedOperand>) -> ComputeJob {
        ComputeJob {
            instruction: InstructionId::new(1),
            stream: StreamId::new(1),
            stream_type: ComputeStreamType::new("cpu"),
            op,
            operands,
        }
    }

    #[test]
    fn only_compute_opcodes_are_accepted() {
        let cpu = ComputeStreamType::new("cpu");
        assert!(cpu.accepts(Opcode::Compute));
        assert!(!cpu.accepts(Opcode::NewMirroredObjectSymbol));
        assert!(!cpu.accepts(Opcode::DeleteMirroredObjectSymbol));
    }

    #[test]
    fn resolve_unbound_operand_is_none() {
        let registry = SymbolRegistry::new();
        let operand = Operand::read(LogicalObjectId::new(5));
        assert!(ComputeStreamType::resolve(&registry, A, &operand).is_none());
    }

    #[test]
    fn resolve_pinned_operand_requires_that_stream() {
        let registry = registry_with(5, false, 1);
        let id = LogicalObjectId::new(5);
        assert!(ComputeStreamType::resolve(&registry, A, &Operand::read_symbol(A, id)).is_some());
        let other = StreamId::new(4);
        assert!(ComputeStreamType::resolve(&registry, A, &Operand::read_symbol(other, id)).is_none());
    }

    #[test]
    fn kernel_writes_are_visible_through_the_registry() {
        let registry = registry_with(5, false, 2);
        let id = LogicalObjectId::new(5);
        let operand = ComputeStreamType::resolve(&registry, A, &Operand::write(id)).unwrap();
        let op = ComputeOp::new("fill", |ctx| {
            for p in 0..ctx.operand(0)?.parallel_num() {
                ctx.write(0, p, |buf| *buf = vec![p as f32; 2])?;
            }
            Ok(())
        });

        job(op, vec![operand]).execute().unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap.bindings[0].slots[1].data, Some(vec![1.0, 1.0]));
    }

    #[test]
    fn writing_a_read_operand_fails() {
        let registry = registry_with(5, false, 1);
        let operand =
            ComputeStreamType::resolve(&registry, A, &Operand::read(LogicalObjectId::new(5))).unwrap();
        let op = ComputeOp::new("bad", |ctx| ctx.write(0, 0, |buf| buf.push(1.0)));

        let err = job(op, vec![operand]).execute().unwrap_err();
        assert!(err.contains("read-only"));
    }

    #[test]
    fn remote_replicas_cannot_be_read() {
        let registry = registry_with(5, true, 1);
        let operand =
            ComputeStreamType::resolve(&registry, A, &Operand::read(LogicalObjectId::new(5))).unwrap();
        let op = ComputeOp::new("peek", |ctx| ctx.read(0, 0).map(|_| ()));

        let err = job(op, vec![operand]).execute().unwrap_err();
        assert!(err.contains("remote"));
    }

    #[test]
    fn kernel_panic_is_reported_not_propagated() {
        let op = ComputeOp::new("boom", |_| panic!("kernel bug"));
        let err = job(op, Vec::new()).execute().unwrap_err();
        assert_eq!(err, "boom: kernel panicked");
    }

    #[test]
    fn out_of_range_replica_is_an_error() {
        let registry = registry_with(5, false, 1);
        let operand =
            ComputeStreamType::resolve(&registry, A, &Operand::read(LogicalObjectId::new(5))).unwrap();
        let op = ComputeOp::new("peek", |ctx| ctx.read(0, 3).map(|_| ()));
        let err = job(op, vec![operand]).execute().unwrap_err();
        assert!(err.contains("no replica 3"));
    }
}
