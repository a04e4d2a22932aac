//! SymbolRegistry — bindings from logical objects to replica slots.
//!
//! A binding is keyed by `(LogicalObjectId, StreamId)`: the same logical
//! object may be mirrored on several streams, but at most once per stream.
//! The registry is only mutated from control-instruction runs, which the
//! scheduler never executes concurrently with each other.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use svm_core::{InstructionId, LogicalObjectId, StreamId};

use crate::error::{SchedulerError, SchedulerResult};

/// Storage behind a local replica slot.
pub type SlotBuffer = Arc<Mutex<Vec<f32>>>;

/// One replica of a mirrored object.
///
/// Remote replicas are hosted elsewhere and carry no local buffer.
#[derive(Debug, Clone)]
pub struct ReplicaSlot {
    parallel_id: u32,
    is_remote: bool,
    buffer: Option<SlotBuffer>,
}

impl ReplicaSlot {
    fn allocate(parallel_id: u32, is_remote: bool) -> Self {
        let buffer = (!is_remote).then(|| Arc::new(Mutex::new(Vec::new())));
        Self {
            parallel_id,
            is_remote,
            buffer,
        }
    }

    pub fn parallel_id(&self) -> u32 {
        self.parallel_id
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    /// Local storage, `None` for remote replicas.
    pub fn buffer(&self) -> Option<&SlotBuffer> {
        self.buffer.as_ref()
    }

    fn snapshot(&self) -> SlotSnapshot {
        let data = self.buffer.as_ref().map(|buffer| {
            buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        });
        SlotSnapshot {
            parallel_id: self.parallel_id,
            is_remote: self.is_remote,
            data,
        }
    }
}

/// A completed binding of a logical object on one stream.
#[derive(Debug, Clone)]
pub struct MirroredObjectSymbol {
    logical_object_id: LogicalObjectId,
    stream: StreamId,
    is_remote: bool,
    created_by: InstructionId,
    slots: Vec<ReplicaSlot>,
}

impl MirroredObjectSymbol {
    /// Allocate `parallel_num` replica slots for a new binding.
    pub(crate) fn allocate(
        logical_object_id: LogicalObjectId,
        stream: StreamId,
        is_remote: bool,
        parallel_num: u32,
        created_by: InstructionId,
    ) -> SchedulerResult<Self> {
        if parallel_num == 0 {
            return Err(SchedulerError::InvalidParallelNum { logical_object_id });
        }
        let slots = (0..parallel_num)
            .map(|parallel_id| ReplicaSlot::allocate(parallel_id, is_remote))
            .collect();
        Ok(Self {
            logical_object_id,
            stream,
            is_remote,
            created_by,
            slots,
        })
    }

    pub fn logical_object_id(&self) -> LogicalObjectId {
        self.logical_object_id
    }

    /// Stream the binding was created on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn parallel_num(&self) -> u32 {
        self.slots.len() as u32
    }

    /// The control instruction that created this binding.
    pub fn created_by(&self) -> InstructionId {
        self.created_by
    }

    pub fn slots(&self) -> &[ReplicaSlot] {
        &self.slots
    }
}

/// Live bindings for every logical object.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    bindings: BTreeMap<LogicalObjectId, BTreeMap<StreamId, MirroredObjectSymbol>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Rejects a second binding for the same
    /// `(logical object, stream)` pair without touching the registry.
    pub(crate) fn bind(&mut self, symbol: MirroredObjectSymbol) -> SchedulerResult<()> {
        if self.get(symbol.logical_object_id, symbol.stream).is_some() {
            return Err(SchedulerError::DuplicateSymbolBinding {
                logical_object_id: symbol.logical_object_id,
                stream: symbol.stream,
            });
        }
        debug!(
            logical_object_id = %symbol.logical_object_id,
            stream = %symbol.stream,
            parallel_num = symbol.slots.len(),
            is_remote = symbol.is_remote,
            "symbol bound"
        );
        self.bindings
            .entry(symbol.logical_object_id)
            .or_default()
            .insert(symbol.stream, symbol);
        Ok(())
    }

    /// Remove the binding of `logical_object_id` on `stream`, releasing its
    /// replica slots.
    pub(crate) fn unbind(
        &mut self,
        logical_object_id: LogicalObjectId,
        stream: StreamId,
    ) -> Option<MirroredObjectSymbol> {
        let per_stream = self.bindings.get_mut(&logical_object_id)?;
        let removed = per_stream.remove(&stream);
        if per_stream.is_empty() {
            self.bindings.remove(&logical_object_id);
        }
        if removed.is_some() {
            debug!(%logical_object_id, %stream, "symbol unbound");
        }
        removed
    }

    /// The binding of `logical_object_id` on exactly `stream`.
    pub fn get(
        &self,
        logical_object_id: LogicalObjectId,
        stream: StreamId,
    ) -> Option<&MirroredObjectSymbol> {
        self.bindings.get(&logical_object_id)?.get(&stream)
    }

    /// Resolve a logical id from the point of view of `stream`: its own
    /// binding if there is one, otherwise the binding on the
    /// earliest-registered stream.
    pub fn resolve(
        &self,
        logical_object_id: LogicalObjectId,
        stream: StreamId,
    ) -> Option<&MirroredObjectSymbol> {
        let per_stream = self.bindings.get(&logical_object_id)?;
        per_stream
            .get(&stream)
            .or_else(|| per_stream.values().next())
    }

    pub fn is_bound(&self, logical_object_id: LogicalObjectId) -> bool {
        self.bindings.contains_key(&logical_object_id)
    }

    /// Total number of `(logical object, stream)` bindings.
    pub fn len(&self) -> usize {
        self.bindings.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// All bindings, ordered by logical id then stream.
    pub fn iter(&self) -> impl Iterator<Item = &MirroredObjectSymbol> {
        self.bindings.values().flat_map(BTreeMap::values)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            bindings: self
                .iter()
                .map(|symbol| BindingSnapshot {
                    logical_object_id: symbol.logical_object_id,
                    stream: symbol.stream,
                    is_remote: symbol.is_remote,
                    parallel_num: symbol.parallel_num(),
                    slots: symbol.slots.iter().map(ReplicaSlot::snapshot).collect(),
                })
                .collect(),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.bindings.clear();
    }
}

/// Serializable view of the registry, sorted by logical id then stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub bindings: Vec<BindingSnapshot>,
}

impl RegistrySnapshot {
    pub fn find(
        &self,
        logical_object_id: LogicalObjectId,
        stream: StreamId,
    ) -> Option<&BindingSnapshot> {
        self.bindings
            .iter()
            .find(|b| b.logical_object_id == logical_object_id && b.stream == stream)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingSnapshot {
    pub logical_object_id: LogicalObjectId,
    pub stream: StreamId,
    pub is_remote: bool,
    pub parallel_num: u32,
    pub slots: Vec<SlotSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub parallel_id: u32,
    pub is_remote: bool,
    /// Contents of the local buffer; absent for remote replicas.
    pub data: Option<Vec<f32>>,
}
