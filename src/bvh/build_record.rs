use crate::geometry::WorldBox;
use crate::sync::WorkSize;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BuildState {
    Uninitialized,
    Internal,
    Leaf,
}

/// Range of sorted primitives waiting to be turned into a subtree.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildRecord {
    pub begin: usize,
    pub end: usize,
    /// Bounds of the primitives in the range, when known
    pub bounds: WorldBox,
    /// Child slot that receives the subtree
    pub parent_id: usize,
    pub depth: usize,
    pub area: f32,
    pub state: BuildState,
}

impl BuildRecord {
    pub fn new(begin: usize, end: usize, parent_id: usize, depth: usize) -> Self {
        debug_assert!(begin <= end);
        BuildRecord {
            begin,
            end,
            bounds: WorldBox::empty(),
            parent_id,
            depth,
            area: 0.0,
            state: BuildState::Uninitialized,
        }
    }

    pub fn items(&self) -> usize {
        self.end - self.begin
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.begin..self.end
    }

    pub fn set_bounds(&mut self, bounds: WorldBox) {
        self.area = bounds.half_area();
        self.bounds = bounds;
    }

    pub fn surface_area(&self) -> f32 {
        self.area
    }

    pub fn is_leaf(&self) -> bool {
        self.state == BuildState::Leaf
    }

    pub fn set_state(&mut self, state: BuildState) {
        self.state = state;
    }

    /// Splits the range at `mid`, both halves go one level deeper.
    pub fn split_at(&self, mid: usize) -> (BuildRecord, BuildRecord) {
        debug_assert!(self.begin < mid && mid < self.end);
        (
            BuildRecord::new(self.begin, mid, self.parent_id, self.depth + 1),
            BuildRecord::new(mid, self.end, self.parent_id, self.depth + 1),
        )
    }
}

impl WorkSize for BuildRecord {
    fn work_size(&self) -> usize {
        self.items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::WorldPoint;
    use assert2::assert;

    #[test]
    fn split_keeps_range() {
        let record = BuildRecord::new(10, 20, 3, 2);
        let (left, right) = record.split_at(13);
        assert!(left.range() == (10..13));
        assert!(right.range() == (13..20));
        assert!(left.depth == 3);
        assert!(left.items() + right.items() == record.items());
        assert!(record.work_size() == 10);
    }

    #[test]
    fn bounds_update_area() {
        let mut record = BuildRecord::new(0, 1, 0, 1);
        record.set_bounds(WorldBox::new(
            WorldPoint::new(0.0, 0.0, 0.0),
            WorldPoint::new(1.0, 2.0, 3.0),
        ));
        assert!(record.surface_area() == 11.0);
        record.set_state(BuildState::Leaf);
        assert!(record.is_leaf());
    }
}
