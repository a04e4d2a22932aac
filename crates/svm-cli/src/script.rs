//! JSON instruction scripts for `svmctl run`.
//!
//! Steps are submitted in file order. Streams are referenced by name.
//!
//! ```json
//! { "steps": [
//!   { "op": "new_symbol", "stream": "control", "id": 42, "parallel_num": 2 },
//!   { "op": "compute", "stream": "cpu0", "kernel": "fill", "args": [1.0, 4],
//!     "operands": [{ "id": 42, "access": "write" }] },
//!   { "op": "delete_symbol", "stream": "control", "id": 42 }
//! ] }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use svm_core::{LogicalObjectId, StreamId};
use svm_scheduler::{Access, ControlStreamType, Operand, VmInstructionMsg, VpuScheduler};

use crate::kernels;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    NewSymbol {
        stream: String,
        id: LogicalObjectId,
        parallel_num: u32,
        #[serde(default)]
        is_remote: bool,
    },
    DeleteSymbol {
        stream: String,
        id: LogicalObjectId,
    },
    Compute {
        stream: String,
        kernel: String,
        #[serde(default)]
        args: Vec<f32>,
        #[serde(default)]
        operands: Vec<ScriptOperand>,
    },
}

impl Step {
    pub fn stream(&self) -> &str {
        match self {
            Step::NewSymbol { stream, .. }
            | Step::DeleteSymbol { stream, .. }
            | Step::Compute { stream, .. } => stream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptOperand {
    pub id: LogicalObjectId,
    pub access: Access,
    /// Pin the operand to the binding owned by this stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Script {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("failed to parse instruction script")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve stream names and kernels against `scheduler`, producing the
    /// batch to submit.
    pub fn instructions(&self, scheduler: &VpuScheduler) -> anyhow::Result<Vec<(StreamId, VmInstructionMsg)>> {
        let lookup = |name: &str| {
            scheduler
                .stream_id(name)
                .with_context(|| format!("unknown stream {name:?}"))
        };

        self.steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let stream = lookup(step.stream()).with_context(|| format!("step {index}"))?;
                let msg = match step {
                    Step::NewSymbol {
                        id,
                        parallel_num,
                        is_remote,
                        ..
                    } => ControlStreamType.new_mirrored_object_symbol(*id, *is_remote, *parallel_num),
                    Step::DeleteSymbol { id, .. } => ControlStreamType.delete_mirrored_object_symbol(*id),
                    Step::Compute {
                        kernel,
                        args,
                        operands,
                        ..
                    } => {
                        let op = kernels::build(kernel, args).with_context(|| format!("step {index}"))?;
                        let operands = operands
                            .iter()
                            .map(|operand| resolve_operand(operand, &lookup))
                            .collect::<anyhow::Result<Vec<_>>>()
                            .with_context(|| format!("step {index}"))?;
                        VmInstructionMsg::compute(op, operands)
                    }
                };
                Ok::<_, anyhow::Error>((stream, msg))
            })
            .collect()
    }
}

fn resolve_operand(
    operand: &ScriptOperand,
    lookup: &impl Fn(&str) -> anyhow::Result<StreamId>,
) -> anyhow::Result<Operand> {
    Ok(match (&operand.owner, operand.access) {
        (None, Access::Read) => Operand::read(operand.id),
        (None, Access::Write) => Operand::write(operand.id),
        (Some(owner), Access::Read) => Operand::read_symbol(lookup(owner)?, operand.id),
        (Some(owner), Access::Write) => Operand::write_symbol(lookup(owner)?, operand.id),
    })
}
