//! Identifiers shared across streamvm crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-wide identity of one distributed object, independent of where
/// its replicas live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalObjectId(u64);

impl LogicalObjectId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogicalObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl From<u64> for LogicalObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Index of a stream, assigned in registration order.
///
/// Ordering on `StreamId` is registration order, which the scheduler uses
/// as its tie-break when several streams are ready in the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u32);

impl StreamId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Key into the stream-type registration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamTypeId(u32);

impl StreamTypeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-type#{}", self.0)
    }
}

/// The control stream type is always registered under id 0.
pub const CONTROL_STREAM_TYPE_ID: StreamTypeId = StreamTypeId(0);

/// Stable handle of an admitted instruction.
///
/// Ids are handed out in submission order and never reused, so a larger id
/// was always admitted later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstructionId(u64);

impl InstructionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instr#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_kind_prefix() {
        assert_eq!(LogicalObjectId::new(42).to_string(), "obj#42");
        assert_eq!(StreamId::new(1).to_string(), "stream#1");
        assert_eq!(InstructionId::new(7).to_string(), "instr#7");
        assert_eq!(CONTROL_STREAM_TYPE_ID.to_string(), "stream-type#0");
    }

    #[test]
    fn stream_ids_order_by_registration_index() {
        let mut ids = vec![StreamId::new(2), StreamId::new(0), StreamId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![StreamId::new(0), StreamId::new(1), StreamId::new(2)]);
    }

    #[test]
    fn logical_ids_serialize_as_plain_integers() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            id: LogicalObjectId,
        }
        let text = toml::to_string(&Wrapper { id: LogicalObjectId::new(9) }).unwrap();
        assert_eq!(text.trim(), "id = 9");
        let back: Wrapper = toml::from_str(&text).unwrap();
        assert_eq!(back.id, LogicalObjectId::new(9));
    }
}
