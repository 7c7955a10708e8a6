//! Frame and fence counters.
//!
//! Both counters are monotonic 64-bit values. Reclamation compares frame stamps
//! through a 16-bit wrapping difference so that a counter crossing any 2^16
//! boundary (or the 2^64 one) still yields the right age.

/// Identifies one logical frame submission.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameCounter(u64);

impl FrameCounter {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following frame. Wraps at `u64::MAX`.
    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Frame slot this counter maps to in a ring of `slots` entries.
    #[inline]
    pub fn slot(self, slots: usize) -> usize {
        debug_assert!(slots > 0);
        (self.0 % slots as u64) as usize
    }

    /// Number of frames elapsed since `stamped`, modulo 2^16.
    #[inline]
    pub const fn age_since(self, stamped: FrameCounter) -> u16 {
        (self.0 as u16).wrapping_sub(stamped.0 as u16)
    }

    /// Whether an object stamped at `stamped` is at least `threshold` frames old.
    #[inline]
    pub const fn has_aged(self, stamped: FrameCounter, threshold: u16) -> bool {
        self.age_since(stamped) >= threshold
    }
}

/// A value signaled by a GPU queue once a submission completes.
///
/// Zero is never signaled; it is "complete" from the start.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    pub const ZERO: FenceValue = FenceValue(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── slots ─────────────────────────────────────────────────────────────

    #[test]
    fn slot_is_round_robin() {
        let slots: Vec<usize> = (0..6).map(|i| FrameCounter::new(i).slot(3)).collect();
        assert_eq!(slots, [0, 1, 2, 0, 1, 2]);
    }

    // ── age ───────────────────────────────────────────────────────────────

    #[test]
    fn age_counts_frames() {
        let stamped = FrameCounter::new(10);
        assert_eq!(FrameCounter::new(12).age_since(stamped), 2);
        assert!(FrameCounter::new(12).has_aged(stamped, 2));
        assert!(!FrameCounter::new(11).has_aged(stamped, 2));
    }

    #[test]
    fn age_across_16_bit_boundary() {
        let stamped = FrameCounter::new(0xFFFF);
        let now = FrameCounter::new(0x1_0001);
        assert_eq!(now.age_since(stamped), 2);
        assert!(now.has_aged(stamped, 2));
        assert!(!FrameCounter::new(0x1_0000).has_aged(stamped, 2));
    }

    #[test]
    fn age_across_64_bit_wrap() {
        let stamped = FrameCounter::new(u64::MAX);
        let now = stamped.next().next();
        assert_eq!(now.get(), 1);
        assert_eq!(now.age_since(stamped), 2);
    }

    #[test]
    fn same_frame_has_age_zero() {
        let f = FrameCounter::new(0xABCD_1234);
        assert_eq!(f.age_since(f), 0);
        assert!(!f.has_aged(f, 1));
    }
}
