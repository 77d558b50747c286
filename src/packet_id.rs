use std::fmt::{Display, Formatter};

/// The sequence number of a DATA packet in one direction of a channel.
///
/// Id 0 marks the start of a stream: it is the id of the first DATA packet after a channel was
///  created or reset, and it is never produced by [`PacketId::next`]. All other ids live in the
///  wrapping range `1..=u32::MAX`, i.e. `u32::MAX` is followed by 1.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct PacketId(u32);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    pub const STREAM_START: PacketId = PacketId(0);

    /// number of ids in the wrapping range, i.e. excluding the stream start
    const MODULUS: u64 = u32::MAX as u64;

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn is_stream_start(&self) -> bool {
        self.0 == 0
    }

    pub fn next(&self) -> PacketId {
        if self.0 == u32::MAX {
            PacketId(1)
        }
        else {
            PacketId(self.0 + 1)
        }
    }

    /// The signed minimal distance from `self` to `other` over the wrapping id range: positive if
    ///  `other` is newer than `self`, negative if it is older.
    ///
    /// NB: This is meaningful for ids in the wrapping range only - the stream start is ordered
    ///      like id 1 here, callers handle it before comparing
    pub fn distance_to(&self, other: PacketId) -> i64 {
        let from = self.position();
        let to = other.position();

        let forward = (to + Self::MODULUS - from) % Self::MODULUS;
        if forward > Self::MODULUS / 2 {
            forward as i64 - Self::MODULUS as i64
        }
        else {
            forward as i64
        }
    }

    pub fn is_newer_than(&self, other: PacketId) -> bool {
        other.distance_to(*self) > 0
    }

    fn position(&self) -> u64 {
        (self.0 as u64).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::stream_start(0, 1)]
    #[case::regular(1, 2)]
    #[case::regular_2(12345, 12346)]
    #[case::before_wrap(u32::MAX - 1, u32::MAX)]
    #[case::wrap_skips_zero(u32::MAX, 1)]
    fn test_next(#[case] id: u32, #[case] expected: u32) {
        assert_eq!(PacketId::from_raw(id).next(), PacketId::from_raw(expected));
    }

    #[rstest]
    #[case::same(5, 5, 0)]
    #[case::newer(5, 9, 4)]
    #[case::older(9, 5, -4)]
    #[case::across_wrap(u32::MAX - 1, 1, 2)]
    #[case::across_wrap_backwards(1, u32::MAX - 1, -2)]
    #[case::max_to_one(u32::MAX, 1, 1)]
    #[case::half_range(1, 1 + (u32::MAX / 2), (u32::MAX / 2) as i64)]
    fn test_distance(#[case] from: u32, #[case] to: u32, #[case] expected: i64) {
        assert_eq!(PacketId::from_raw(from).distance_to(PacketId::from_raw(to)), expected);
    }

    #[test]
    fn test_is_newer_than_near_wrap() {
        let before_wrap = PacketId::from_raw(u32::MAX - 1);
        let after_wrap = PacketId::from_raw(1);

        assert!(after_wrap.is_newer_than(before_wrap));
        assert!(!before_wrap.is_newer_than(after_wrap));
        assert!(!after_wrap.is_newer_than(after_wrap));
    }

    #[test]
    fn test_next_sequence_is_consecutive_across_wrap() {
        let mut id = PacketId::from_raw(u32::MAX - 3);
        for _ in 0..10 {
            let next = id.next();
            assert_eq!(id.distance_to(next), 1);
            assert!(!next.is_stream_start());
            id = next;
        }
    }
}
