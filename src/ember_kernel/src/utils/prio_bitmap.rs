//! Run-queue occupancy bitmap
use core::fmt;

use super::Init;

/// One bit per priority level, set while the run-queue of that level is
/// non-empty.
///
/// Bit 0 stands for priority 0, the most urgent level, so the lowest set bit
/// names the level the scheduler serves next. All methods panic on levels
/// beyond [`CAPACITY`](Self::CAPACITY).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap(u128);

impl PrioBitmap {
    /// The number of priority levels a bitmap can track.
    pub const CAPACITY: usize = u128::BITS as usize;

    #[inline]
    fn mask(level: usize) -> u128 {
        assert!(level < Self::CAPACITY, "priority {level} is out of range");
        1 << level
    }

    #[inline]
    pub fn get(&self, level: usize) -> bool {
        self.0 & Self::mask(level) != 0
    }

    #[inline]
    pub fn set(&mut self, level: usize) {
        self.0 |= Self::mask(level);
    }

    #[inline]
    pub fn clear(&mut self, level: usize) {
        self.0 &= !Self::mask(level);
    }

    /// Get the most urgent level whose bit is set.
    #[inline]
    pub fn find_set(&self) -> Option<usize> {
        (self.0 != 0).then(|| self.0.trailing_zeros() as usize)
    }
}

impl Init for PrioBitmap {
    const INIT: Self = Self(0);
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries((0..Self::CAPACITY).filter(|&level| self.get(level)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// Toggle random levels and compare against an ordered set.
    #[quickcheck]
    fn agrees_with_btreeset(levels: Vec<u8>) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut bitmap = PrioBitmap::INIT;
        let mut model = BTreeSet::new();

        for level in levels {
            let level = usize::from(level) % PrioBitmap::CAPACITY;
            if model.insert(level) {
                bitmap.set(level);
            } else {
                model.remove(&level);
                bitmap.clear(level);
            }
            log::trace!("toggled {level}: {bitmap:?}");

            assert_eq!(bitmap.find_set(), model.first().copied());
        }

        let set: Vec<_> = (0..PrioBitmap::CAPACITY).filter(|&l| bitmap.get(l)).collect();
        assert!(set.iter().eq(model.iter()));
    }

    #[test]
    fn lowest_level_wins() {
        let mut bitmap = PrioBitmap::INIT;
        assert_eq!(bitmap.find_set(), None);
        bitmap.set(127);
        bitmap.set(9);
        bitmap.set(4);
        assert_eq!(bitmap.find_set(), Some(4));
        bitmap.clear(4);
        assert_eq!(bitmap.find_set(), Some(9));
        assert_eq!(format!("{bitmap:?}"), "{9, 127}");
    }

    #[test]
    #[should_panic(expected = "priority 128 is out of range")]
    fn level_out_of_range() {
        let mut bitmap = PrioBitmap::INIT;
        bitmap.set(128);
    }
}
