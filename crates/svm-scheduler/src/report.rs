//! Completion records and drain reports.

use serde::{Deserialize, Serialize};

use svm_core::{InstructionId, StreamId};

use crate::instruction::Opcode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed { error: String },
    /// Removed from its queue by the caller without running.
    Skipped,
}

/// Signal emitted for every instruction that leaves a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub instruction: InstructionId,
    pub stream: StreamId,
    pub opcode: Opcode,
    pub outcome: Outcome,
}

impl Completion {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltedStream {
    pub stream: StreamId,
    pub instruction: InstructionId,
    pub error: String,
}

/// What one `drain_all` call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub passes: u64,
    /// Instructions in the order they were dispatched.
    pub dispatched: Vec<InstructionId>,
    pub completions: Vec<Completion>,
    /// Streams left halted on a fault that needs caller action.
    pub halted: Vec<HaltedStream>,
}

impl DrainReport {
    pub fn failures(&self) -> impl Iterator<Item = &Completion> {
        self.completions.iter().filter(|c| c.is_failure())
    }

    /// No compute failures and no halted streams.
    pub fn is_clean(&self) -> bool {
        self.halted.is_empty() && self.failures().next().is_none()
    }
}

/// Result of a single scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub dispatched: Vec<InstructionId>,
    pub completions: Vec<Completion>,
    /// Streams that became parked during this pass.
    pub parked: Vec<StreamId>,
    /// Streams that halted during this pass.
    pub halted: Vec<StreamId>,
}

impl PassSummary {
    pub fn made_progress(&self) -> bool {
        !self.dispatched.is_empty()
    }
}
