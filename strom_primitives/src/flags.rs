//! The packet flag word: marker bits describing the packet content and
//! command bits requesting upstream notifications.

use bitflags::bitflags;

bitflags! {
    /// Flags carried by every streaming packet.
    ///
    /// Marker bits state facts about the packet (boundaries, validity of the
    /// timing fields). Command bits request behaviour from downstream units
    /// (skipping, cutting, boundary notifications). The numeric assignment
    /// is stable across all crates of one build.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde_derive", derive(serde::Serialize, serde::Deserialize))]
    pub struct PacketFlags: u32 {
        /// Request skip, `skip_duration` field valid
        const SKIP_UNTIL = 1 << 0;
        /// Request cut, `cut_duration` field valid
        const CUT_AFTER = 1 << 1;

        /// Notification on segment start requested (segment start + segment start time)
        const SEGMENT_START_NOTIFICATION = 1 << 7;
        /// Notification on segment end requested
        const SEGMENT_END_NOTIFICATION = 1 << 8;
        /// Notification on group start requested
        const GROUP_START_NOTIFICATION = 1 << 9;
        /// Notification on group end requested
        const GROUP_END_NOTIFICATION = 1 << 10;

        /// Segment starts here, `segment_number` field valid
        const SEGMENT_START = 1 << 15;
        /// Segment ends here, `segment_number` field valid
        const SEGMENT_END = 1 << 16;
        /// Group starts here, `group_number` field valid
        const GROUP_START = 1 << 17;
        /// Group ends here, `group_number` field valid
        const GROUP_END = 1 << 18;

        /// The group contains a single unit of presentation
        const SINGLE_UNIT_GROUP = 1 << 19;

        /// Data is not contiguous with the previous packet
        const DATA_DISCONTINUITY = 1 << 20;
        /// Presentation time is not contiguous with the previous packet
        const TIME_DISCONTINUITY = 1 << 21;

        /// End of the whole stream
        const END_OF_STREAM = 1 << 22;

        /// `start_time` field valid
        const START_TIME_VALID = 1 << 23;
        /// `end_time` field valid
        const END_TIME_VALID = 1 << 24;

        /// At least one tag present, `num_tags` field valid
        const TAGS_VALID = 1 << 25;
    }
}

impl PacketFlags {
    /// True if `marker` is set together with its matching notification
    /// request bit. Boundary processing only reports upstream when the
    /// producer asked for it.
    pub fn notifies(self, marker: PacketFlags, request: PacketFlags) -> bool {
        self.contains(marker | request)
    }
}

#[cfg(test)]
mod tests {
    use super::PacketFlags;

    #[test]
    fn notifies_requires_both_bits() {
        let f = PacketFlags::SEGMENT_START | PacketFlags::SEGMENT_START_NOTIFICATION;
        assert!(f.notifies(
            PacketFlags::SEGMENT_START,
            PacketFlags::SEGMENT_START_NOTIFICATION
        ));
        assert!(!PacketFlags::SEGMENT_START.notifies(
            PacketFlags::SEGMENT_START,
            PacketFlags::SEGMENT_START_NOTIFICATION
        ));
    }
}
