//! Stream types and the registration table keyed by `StreamTypeId`.
//!
//! A stream type is a capability table: which opcodes a stream of that type
//! accepts and how it runs them. The control type is always registered under
//! `CONTROL_STREAM_TYPE_ID`; compute types are added per device tag.

use std::collections::BTreeMap;

use tracing::info;

use svm_core::{CONTROL_STREAM_TYPE_ID, StreamTypeId};

use crate::compute::ComputeStreamType;
use crate::control::ControlStreamType;
use crate::instruction::Opcode;

/// Name under which the control stream type is registered.
pub const CONTROL_STREAM_TYPE_NAME: &str = svm_core::config::CONTROL_STREAM_TYPE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamType {
    Control(ControlStreamType),
    Compute(ComputeStreamType),
}

impl StreamType {
    pub fn accepts(&self, opcode: Opcode) -> bool {
        match self {
            StreamType::Control(control) => control.accepts(opcode),
            StreamType::Compute(compute) => compute.accepts(opcode),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, StreamType::Control(_))
    }

    /// `"control"` or the compute device tag.
    pub fn name(&self) -> &str {
        match self {
            StreamType::Control(_) => CONTROL_STREAM_TYPE_NAME,
            StreamType::Compute(compute) => compute.device(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamTypeTable {
    types: BTreeMap<StreamTypeId, StreamType>,
    next_id: u32,
}

impl StreamTypeTable {
    /// A table holding only the control stream type.
    pub fn new() -> Self {
        let mut types = BTreeMap::new();
        types.insert(CONTROL_STREAM_TYPE_ID, StreamType::Control(ControlStreamType));
        Self {
            types,
            next_id: CONTROL_STREAM_TYPE_ID.as_u32() + 1,
        }
    }

    /// Register a compute stream type for `device`, or return the id it is
    /// already registered under.
    pub fn register_compute(&mut self, device: &str) -> StreamTypeId {
        if let Some(id) = self.find(device) {
            return id;
        }
        self.register(StreamType::Compute(ComputeStreamType::new(device)))
    }

    /// Register a stream type under a fresh id.
    pub fn register(&mut self, stream_type: StreamType) -> StreamTypeId {
        let id = StreamTypeId::new(self.next_id);
        self.next_id += 1;
        info!(stream_type = %id, name = stream_type.name(), "stream type registered");
        self.types.insert(id, stream_type);
        id
    }

    pub fn get(&self, id: StreamTypeId) -> Option<&StreamType> {
        self.types.get(&id)
    }

    /// First registered type with the given name.
    pub fn find(&self, name: &str) -> Option<StreamTypeId> {
        self.types
            .iter()
            .find(|(_, t)| t.name() == name)
            .map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StreamTypeId, &StreamType)> {
        self.types.iter().map(|(id, t)| (*id, t))
    }
}

impl Default for StreamTypeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_type_is_preregistered_at_zero() {
        let table = StreamTypeTable::new();
        assert_eq!(table.len(), 1);
        assert!(table.get(CONTROL_STREAM_TYPE_ID).unwrap().is_control());
        assert_eq!(table.find("control"), Some(CONTROL_STREAM_TYPE_ID));
    }

    #[test]
    fn compute_types_get_fresh_ids() {
        let mut table = StreamTypeTable::new();
        let cpu = table.register_compute("cpu");
        let cuda = table.register_compute("cuda");
        assert_ne!(cpu, cuda);
        assert_ne!(cpu, CONTROL_STREAM_TYPE_ID);
        assert_eq!(table.get(cuda).unwrap().name(), "cuda");
    }

    #[test]
    fn registering_same_device_twice_reuses_id() {
        let mut table = StreamTypeTable::new();
        let first = table.register_compute("cpu");
        let second = table.register_compute("cpu");
        assert_eq!(first, second);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn capability_table_routes_opcodes() {
        let mut table = StreamTypeTable::new();
        let cpu = table.register_compute("cpu");
        let control = table.get(CONTROL_STREAM_TYPE_ID).unwrap();
        let compute = table.get(cpu).unwrap();

        assert!(control.accepts(Opcode::NewMirroredObjectSymbol));
        assert!(control.accepts(Opcode::DeleteMirroredObjectSymbol));
        assert!(!control.accepts(Opcode::Compute));
        assert!(compute.accepts(Opcode::Compute));
        assert!(!compute.accepts(Opcode::DeleteMirroredObjectSymbol));
    }
}
