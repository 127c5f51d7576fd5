//! Damage accumulation and buffer-age resolution.
//!
//! The [`DamageRing`] keeps one damage region per recent frame. The slot at
//! the head collects damage for the frame currently being built; older
//! frames sit at increasing offsets from the head. When the backend reports
//! that its back buffer still holds the contents of `age` frames ago, only the
//! damage accumulated since then has to be repainted.

use crate::region::Region;

/// Fixed-capacity ring of per-frame damage regions.
#[derive(Debug, Clone)]
pub struct DamageRing {
    ring: Vec<Region>,
    head: usize,
}

impl DamageRing {
    /// Creates a ring with `capacity` slots. A capacity of zero is bumped to
    /// one so the head slot always exists.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![Region::new(); capacity.max(1)],
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Adds damage to the frame currently being accumulated.
    pub fn add(&mut self, damage: &Region) {
        let head = &mut self.ring[self.head];
        *head = head.union(damage);
    }

    /// The damage collected for the current frame only.
    pub fn current(&self) -> &Region {
        &self.ring[self.head]
    }

    /// Damage recorded `offset` frames before the current one.
    pub fn at(&self, offset: usize) -> &Region {
        &self.ring[(self.head + offset) % self.ring.len()]
    }

    /// Computes the region that must be repainted into a buffer of the given
    /// age.
    ///
    /// Ages in `1..capacity` union the current frame with the `age` frames
    /// before it, clamped to `screen`. A forced repaint, a missing age, an age
    /// of zero (contents undefined) or an age the ring cannot cover yield the
    /// whole screen.
    pub fn repaint_region(&self, force_full: bool, buffer_age: Option<u32>, screen: &Region) -> Region {
        let age = match buffer_age {
            Some(age) if !force_full && age > 0 && (age as usize) < self.ring.len() => age as usize,
            _ => {
                log::trace!("full repaint (force: {force_full}, age: {buffer_age:?})");
                return screen.clone();
            }
        };

        let mut region = Region::new();
        for offset in 0..=age {
            log::trace!("damage offset {offset}: {:?}", self.at(offset));
            region = region.union(self.at(offset));
        }
        region.intersect(screen)
    }

    /// Finishes the current frame: the head moves one slot back and the slot
    /// it lands on is cleared to collect the next frame's damage.
    pub fn advance(&mut self) {
        self.head = (self.head + self.ring.len() - 1) % self.ring.len();
        self.ring[self.head].clear();
    }

    /// Drops all recorded damage, e.g. after the backend was recreated.
    pub fn reset(&mut self, capacity: usize) {
        *self = DamageRing::new(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Rect;

    fn screen() -> Region {
        Region::from_rect(Rect::new(0, 0, 100, 100))
    }

    fn unit(x: i32) -> Region {
        Region::from_rect(Rect::new(x, x, 1, 1))
    }

    /// Three frames of disjoint unit damage, newest at the head.
    fn ring_with_three_frames() -> DamageRing {
        let mut ring = DamageRing::new(3);
        ring.add(&unit(10));
        ring.advance();
        ring.add(&unit(20));
        ring.advance();
        ring.add(&unit(30));
        ring
    }

    #[test]
    fn age_two_unions_three_frames() {
        let ring = ring_with_three_frames();
        let region = ring.repaint_region(false, Some(2), &screen());
        let expected = unit(10).union(&unit(20)).union(&unit(30));
        assert_eq!(region, expected);
    }

    #[test]
    fn age_one_covers_current_and_previous_frame() {
        let ring = ring_with_three_frames();
        let region = ring.repaint_region(false, Some(1), &screen());
        assert_eq!(region, unit(20).union(&unit(30)));
    }

    #[test]
    fn invalid_ages_repaint_everything() {
        let ring = ring_with_three_frames();
        for age in [None, Some(0), Some(3), Some(42)] {
            assert_eq!(ring.repaint_region(false, age, &screen()), screen(), "age {age:?}");
        }
        assert_eq!(ring.repaint_region(true, Some(1), &screen()), screen());
    }

    #[test]
    fn repaint_region_is_clamped_to_screen() {
        let mut ring = DamageRing::new(2);
        ring.add(&Region::from_rect(Rect::new(90, 90, 50, 50)));
        let region = ring.repaint_region(false, Some(1), &screen());
        assert_eq!(region, Region::from_rect(Rect::new(90, 90, 10, 10)));
    }

    #[test]
    fn repaint_region_is_idempotent() {
        let ring = ring_with_three_frames();
        let a = ring.repaint_region(false, Some(2), &screen());
        let b = ring.repaint_region(false, Some(2), &screen());
        assert_eq!(a, b);
        assert_eq!(ring.current(), &unit(30));
    }

    #[test]
    fn advance_clears_the_reused_slot() {
        let mut ring = ring_with_three_frames();
        // The next advance wraps onto the slot holding the oldest frame.
        ring.advance();
        assert!(ring.current().is_empty());
        assert_eq!(ring.at(1), &unit(30));
        assert_eq!(ring.at(2), &unit(20));
    }
}
