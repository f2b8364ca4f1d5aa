//! Typed configuration tags travelling inside packets.
//!
//! Tags configure downstream units mid-stream (format changes, channel
//! layouts). A tag id carries the id of the unit type it addresses in its
//! upper bits, which is what output connectors advertise for filtering.

use strom_primitives::{StreamTime, TickDuration};

/// Identifier of a tag. The upper 24 bits name the unit type namespace the
/// tag belongs to; the low byte selects the property within it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TagId(pub u32);

impl TagId {
    pub const UNIT_MASK: u32 = 0xffff_ff00;

    /// The unit type namespace of this tag.
    pub const fn unit_id(self) -> u32 {
        self.0 & Self::UNIT_MASK
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum TagValue {
    None,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Time(StreamTime),
    Duration(TickDuration),
}

impl Default for TagValue {
    fn default() -> Self {
        TagValue::None
    }
}

/// One configuration item.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Tag {
    pub id: TagId,
    pub value: TagValue,
}

impl Tag {
    pub fn new(id: TagId, value: TagValue) -> Self {
        Self { id, value }
    }

    /// True if this tag addresses one of the given unit type namespaces.
    /// An empty set is pass-through.
    pub fn matches_units(&self, unit_ids: &[TagId]) -> bool {
        unit_ids.is_empty() || unit_ids.iter().any(|u| u.unit_id() == self.id.unit_id())
    }
}

#[cfg(test)]
mod tests {
    use super::{Tag, TagId, TagValue};

    #[test]
    fn unit_filter() {
        let audio = TagId(0x2000_0100);
        let video = TagId(0x4000_0100);
        let tag = Tag::new(TagId(0x2000_0103), TagValue::Int(48000));
        assert!(tag.matches_units(&[]));
        assert!(tag.matches_units(&[video, audio]));
        assert!(!tag.matches_units(&[video]));
    }
}
