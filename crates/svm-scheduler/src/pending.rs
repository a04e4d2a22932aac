//! Pending index — what admitted-but-not-run instructions are waiting on.
//!
//! Tracks, per logical object, how many queued instructions still reference
//! it, create it, or delete it. Streams whose head cannot dispatch are
//! parked under the dependency they wait for and woken only when an event
//! touches that dependency.
//!
//! Counts are kept per logical object, not per binding: a `Logical`
//! operand only resolves to a binding at dispatch, so admission cannot know
//! which stream's binding it will use. A deletion of X therefore waits for
//! every queued reference to X, including operands pinned to another
//! stream's binding, and an unpinned reference to X is rejected while any
//! stream has a deletion of X pending.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::trace;

use svm_core::{LogicalObjectId, StreamId};

use crate::error::{SchedulerError, SchedulerResult};
use crate::instruction::VmInstructionMsg;

/// The unmet dependency that keeps a stream's head from dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "logical_object_id", rename_all = "snake_case")]
pub enum HoldReason {
    /// An operand has no completed binding yet, but a creation is queued.
    AwaitingBinding(LogicalObjectId),
    /// A deletion whose object is still referenced by queued instructions.
    PrematureDeletion(LogicalObjectId),
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldReason::AwaitingBinding(id) => write!(f, "awaiting binding of {id}"),
            HoldReason::PrematureDeletion(id) => write!(f, "deletion of {id} still referenced"),
        }
    }
}

type PerStreamCount = BTreeMap<StreamId, usize>;

#[derive(Debug, Default)]
pub(crate) struct PendingIndex {
    /// Queued instructions referencing each object, by submitting stream.
    references: BTreeMap<LogicalObjectId, PerStreamCount>,
    /// Queued creations of each object, by the stream that will own it.
    creations: BTreeMap<LogicalObjectId, PerStreamCount>,
    /// Queued deletions of each object, by the stream that owns it.
    deletions: BTreeMap<LogicalObjectId, PerStreamCount>,
    /// Parked streams keyed by the event that wakes them.
    waiters: BTreeMap<HoldReason, BTreeSet<StreamId>>,
    /// Reverse of `waiters`.
    parked: BTreeMap<StreamId, HoldReason>,
}

fn increment(map: &mut BTreeMap<LogicalObjectId, PerStreamCount>, id: LogicalObjectId, stream: StreamId) {
    *map.entry(id).or_default().entry(stream).or_default() += 1;
}

fn decrement(map: &mut BTreeMap<LogicalObjectId, PerStreamCount>, id: LogicalObjectId, stream: StreamId) {
    if let Some(per_stream) = map.get_mut(&id) {
        if let Some(count) = per_stream.get_mut(&stream) {
            *count -= 1;
            if *count == 0 {
                per_stream.remove(&stream);
            }
        }
        if per_stream.is_empty() {
            map.remove(&id);
        }
    }
}

fn pending_on(
    map: &BTreeMap<LogicalObjectId, PerStreamCount>,
    id: LogicalObjectId,
    stream: Option<StreamId>,
) -> bool {
    match (map.get(&id), stream) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(per_stream), Some(stream)) => per_stream.contains_key(&stream),
    }
}

impl PendingIndex {
    /// Reject references to objects whose deletion has already been issued.
    ///
    /// An unpinned operand is rejected if any stream has a deletion of its
    /// object pending; a pinned one only if its own stream does.
    pub fn check_admission(&self, msg: &VmInstructionMsg) -> SchedulerResult<()> {
        for operand in msg.references() {
            let id = operand.logical_object_id();
            if pending_on(&self.deletions, id, operand.pinned_stream()) {
                return Err(SchedulerError::SymbolPendingDeletion {
                    logical_object_id: id,
                });
            }
        }
        Ok(())
    }

    pub fn admit(&mut self, stream: StreamId, msg: &VmInstructionMsg) {
        for operand in msg.references() {
            increment(&mut self.references, operand.logical_object_id(), stream);
        }
        if let Some(id) = msg.creates() {
            increment(&mut self.creations, id, stream);
        }
        if let Some(id) = msg.deletes() {
            increment(&mut self.deletions, id, stream);
        }
    }

    /// Forget an instruction that ran or was dropped. Returns the
    /// dependencies whose waiters should be re-evaluated.
    pub fn retire(&mut self, stream: StreamId, msg: &VmInstructionMsg) -> Vec<HoldReason> {
        let mut events = Vec::new();
        for operand in msg.references() {
            let id = operand.logical_object_id();
            decrement(&mut self.references, id, stream);
            if !self.references.contains_key(&id) && !events.contains(&HoldReason::PrematureDeletion(id)) {
                events.push(HoldReason::PrematureDeletion(id));
            }
        }
        if let Some(id) = msg.creates() {
            decrement(&mut self.creations, id, stream);
            events.push(HoldReason::AwaitingBinding(id));
        }
        if let Some(id) = msg.deletes() {
            decrement(&mut self.deletions, id, stream);
        }
        events
    }

    /// Queued operand references to `id`, on any stream.
    pub fn references(&self, id: LogicalObjectId) -> usize {
        self.references
            .get(&id)
            .map_or(0, |per_stream| per_stream.values().sum())
    }

    /// Streams holding the queued instructions that must retire before
    /// `reason` can fire: creators of an awaited binding, or referencers of
    /// an object whose deletion is held.
    pub fn blockers(&self, reason: HoldReason) -> BTreeSet<StreamId> {
        let (map, id) = match reason {
            HoldReason::AwaitingBinding(id) => (&self.creations, id),
            HoldReason::PrematureDeletion(id) => (&self.references, id),
        };
        map.get(&id)
            .map(|per_stream| per_stream.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a creation of `id` is queued, on `stream` or anywhere.
    pub fn has_pending_creation(&self, id: LogicalObjectId, stream: Option<StreamId>) -> bool {
        pending_on(&self.creations, id, stream)
    }

    pub fn park(&mut self, stream: StreamId, reason: HoldReason) {
        trace!(%stream, %reason, "stream parked");
        self.waiters.entry(reason).or_default().insert(stream);
        self.parked.insert(stream, reason);
    }

    /// Unpark every stream waiting on `reason`.
    pub fn wake(&mut self, reason: HoldReason) -> BTreeSet<StreamId> {
        let woken = self.waiters.remove(&reason).unwrap_or_default();
        for stream in &woken {
            self.parked.remove(stream);
            trace!(%stream, %reason, "stream woken");
        }
        woken
    }

    pub fn hold_reason(&self, stream: StreamId) -> Option<HoldReason> {
        self.parked.get(&stream).copied()
    }

    pub fn is_parked(&self, stream: StreamId) -> bool {
        self.parked.contains_key(&stream)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
