//! Control stream type — the only place symbols are created or deleted.

use tracing::{debug, warn};

use svm_core::{CONTROL_STREAM_TYPE_ID, InstructionId, LogicalObjectId};

use crate::error::{SchedulerError, SchedulerResult};
use crate::instruction::{InstructionBody, Opcode, VmInstructionMsg};
use crate::registry::MirroredObjectSymbol;
use crate::scheduler::VpuScheduler;

/// Registry change produced by a successful control instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEffect {
    Bound(LogicalObjectId),
    Unbound(LogicalObjectId),
}

impl ControlEffect {
    pub fn logical_object_id(self) -> LogicalObjectId {
        match self {
            ControlEffect::Bound(id) | ControlEffect::Unbound(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStreamType;

impl ControlStreamType {
    pub fn accepts(&self, opcode: Opcode) -> bool {
        opcode.is_control()
    }

    /// Build an instruction that binds `logical_object_id` on the stream it
    /// is submitted to, with `parallel_num` replica slots.
    pub fn new_mirrored_object_symbol(
        &self,
        logical_object_id: LogicalObjectId,
        is_remote: bool,
        parallel_num: u32,
    ) -> VmInstructionMsg {
        VmInstructionMsg::control(InstructionBody::NewMirroredObjectSymbol {
            logical_object_id,
            is_remote,
            parallel_num,
        })
    }

    /// Build an instruction that removes the binding of `logical_object_id`
    /// on the stream it is submitted to.
    pub fn delete_mirrored_object_symbol(&self, logical_object_id: LogicalObjectId) -> VmInstructionMsg {
        VmInstructionMsg::control(InstructionBody::DeleteMirroredObjectSymbol { logical_object_id })
    }

    /// Execute one control instruction against the scheduler's registry.
    ///
    /// Running an instruction that already ran fails with `DoubleRun` before
    /// anything is touched. On any other failure the registry is left as it
    /// was.
    pub(crate) fn run(
        &self,
        scheduler: &mut VpuScheduler,
        instruction: InstructionId,
    ) -> SchedulerResult<ControlEffect> {
        scheduler.arena.begin_run(instruction)?;
        let (stream, body) = match (
            scheduler.arena.stream_of(instruction),
            scheduler.arena.get(instruction),
        ) {
            (Some(stream), Some(msg)) => (stream, msg.body().clone()),
            _ => return Err(SchedulerError::InstructionNotFound(instruction)),
        };

        let result = match body {
            InstructionBody::NewMirroredObjectSymbol {
                logical_object_id,
                is_remote,
                parallel_num,
            } => MirroredObjectSymbol::allocate(
                logical_object_id,
                stream,
                is_remote,
                parallel_num,
                instruction,
            )
            .and_then(|symbol| scheduler.registry.bind(symbol))
            .map(|()| ControlEffect::Bound(logical_object_id)),
            InstructionBody::DeleteMirroredObjectSymbol { logical_object_id } => scheduler
                .registry
                .unbind(logical_object_id, stream)
                .map(|_| ControlEffect::Unbound(logical_object_id))
                .ok_or(SchedulerError::UnboundSymbolReference {
                    instruction,
                    stream,
                    logical_object_id,
                }),
            InstructionBody::Compute(_) => Err(SchedulerError::UnsupportedOpcode {
                opcode: Opcode::Compute,
                stream,
                stream_type: CONTROL_STREAM_TYPE_ID,
            }),
        };

        scheduler.arena.finish(instruction, result.is_ok())?;
        match &result {
            Ok(effect) => debug!(%instruction, %stream, ?effect, "control instruction ran"),
            Err(e) => warn!(%instruction, %stream, error = %e, "control instruction failed"),
        }
        result
    }
}
