use super::Field;
use crate::error::FieldError;
use crate::hcs::{Coord, Level, CENTER};
use crate::value::FieldValue;

/// Which subset of a field an [`Iter`] walks.
#[derive(Clone, Copy, Debug)]
enum Mode {
    /// Every existing coordinate, ascending, levels 1 and deeper.
    All,
    /// Leaves only, threaded through the tree array's leaf links.
    TopOnly,
    /// Existing coordinates of a single level, ascending.
    OneLevel(Level),
}

/// Forward iterator over a field's coordinates, yielding `(coord, &value)`.
///
/// Holds a shared borrow of the field, so structural mutation during
/// iteration does not compile.
pub struct Iter<'a, T, const D: usize> {
    field: &'a Field<T, D>,
    next: Option<Coord>,
    mode: Mode,
}

impl<T: FieldValue, const D: usize> Field<T, D> {
    /// The first existing coordinate at or after `from` in linear order.
    ///
    /// Absent slots carry enough structure to skip in bulk: a pointer to the
    /// covering leaf spans a whole sibling block, and a zero slot marks the
    /// non-canonical gap before the next level's range.
    pub(crate) fn next_existing(&self, mut from: Coord) -> Option<Coord> {
        let len = self.tree.len() as Coord;
        loop {
            if from >= len {
                return None;
            }
            let link = self.tree[from as usize];
            if link == 0 {
                // A zero slot is the gap before the next level's range; in
                // one dimension there is no gap and the slot is an uncovered
                // level start, so there is nothing further to find.
                let hop = self.hcs.min_level_coord(self.hcs.level(from - 1) + 1);
                if hop <= from {
                    return None;
                }
                from = hop;
            } else if link < from {
                let depth = self.hcs.level(from) - self.hcs.level(link);
                from += (self.hcs.parts as Coord).pow(depth as u32);
            } else {
                return Some(from);
            }
        }
    }

    fn leaf_link(&self, slot: Coord) -> Option<Coord> {
        self.tree
            .get(slot as usize)
            .copied()
            .filter(|&link| link != 0)
    }

    /// The leaf after `current` in thread order. The root can only be the
    /// thread's first leaf, so an advance that lands on it is the end (it
    /// happens when everything below the root was coarsened away).
    pub(super) fn next_leaf(&self, current: Coord) -> Option<Coord> {
        self.leaf_link(current + 1).filter(|&link| link != CENTER)
    }

    /// Iterates every existing coordinate (levels 1 and deeper) in ascending
    /// order.
    pub fn iter(&self) -> Iter<'_, T, D> {
        Iter {
            field: self,
            next: self.next_existing(self.hcs.min_level_coord(1)),
            mode: Mode::All,
        }
    }

    /// Iterates the leaves in leaf-thread order. Visits the root when the
    /// field is a singleton.
    pub fn iter_top(&self) -> Iter<'_, T, D> {
        Iter {
            field: self,
            next: self.leaf_link(CENTER),
            mode: Mode::TopOnly,
        }
    }

    /// Iterates the existing coordinates of one level in ascending order.
    pub fn iter_level(&self, level: Level) -> Iter<'_, T, D> {
        let first = self
            .next_existing(self.hcs.min_level_coord(level))
            .filter(|&c| self.hcs.level(c) == level);
        Iter {
            field: self,
            next: first,
            mode: Mode::OneLevel(level),
        }
    }

    /// Lockstep iteration over two fields of equal structure, yielding
    /// `(coord, &left, &right)`.
    ///
    /// The structure check happens here, once; both fields stay borrowed for
    /// the iterator's lifetime, so they cannot diverge mid-iteration.
    pub fn zip<'a, U: FieldValue>(
        &'a self,
        other: &'a Field<U, D>,
    ) -> Result<Zip<'a, T, U, D>, FieldError> {
        if !self.same_structure(other) {
            return Err(FieldError::InconsistentIteration);
        }
        Ok(Zip {
            left: self,
            right: other,
            next: self.next_existing(self.hcs.min_level_coord(1)),
        })
    }
}

impl<'a, T: FieldValue, const D: usize> Iterator for Iter<'a, T, D> {
    type Item = (Coord, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = match self.mode {
            Mode::All => self.field.next_existing(current + 1),
            Mode::TopOnly => self.field.next_leaf(current),
            Mode::OneLevel(level) => self
                .field
                .next_existing(current + 1)
                .filter(|&c| self.field.hcs.level(c) == level),
        };
        Some((current, &self.field.data[current as usize]))
    }
}

/// Lockstep iterator over two same-structure fields.
pub struct Zip<'a, T, U, const D: usize> {
    left: &'a Field<T, D>,
    right: &'a Field<U, D>,
    next: Option<Coord>,
}

impl<'a, T: FieldValue, U: FieldValue, const D: usize> Iterator for Zip<'a, T, U, D> {
    type Item = (Coord, &'a T, &'a U);

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        debug_assert!(self.right.exists(current));
        self.next = self.left.next_existing(current + 1);
        Some((
            current,
            &self.left.data[current as usize],
            &self.right.data[current as usize],
        ))
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use crate::hcs::{Coord, CENTER};
    use crate::{FieldError, ScalarField2};

    use approx::assert_relative_eq;

    #[test]
    fn fresh_field_iteration() {
        let field = ScalarField2::default();
        assert_eq!(field.iter().count(), 0);
        let tops: Vec<Coord> = field.iter_top().map(|(c, _)| c).collect();
        assert_eq!(tops, vec![CENTER]);
    }

    #[test]
    fn linear_iteration_is_ascending_and_complete() {
        let mut field = ScalarField2::default();
        field.create_entire_level(2).unwrap();
        let coords: Vec<Coord> = field.iter().map(|(c, _)| c).collect();
        assert_eq!(coords.len(), 20);
        assert!(coords.windows(2).all(|w| w[0] < w[1]));
        assert!(coords.iter().all(|&c| field.exists(c)));

        // Per-level counts add up to the linear count.
        let by_level: usize = (1..=field.highest_level())
            .map(|l| field.iter_level(l).count())
            .sum();
        assert_eq!(by_level, coords.len());
    }

    #[test]
    fn leaf_thread_visits_every_leaf_once() {
        let mut field = ScalarField2::default();
        field.create_entire_level(1).unwrap();
        let refined = field.hcs.coord_from_subs(&[1]);
        field.refine_from(refined).unwrap();

        // The thread detours through the refined block, then resumes with the
        // untouched siblings.
        let tops: Vec<Coord> = field.iter_top().map(|(c, _)| c).collect();
        assert_eq!(tops, vec![4, 20, 21, 22, 23, 6, 7]);

        // Same set as a full scan for leaves.
        let mut scanned: Vec<Coord> = field
            .iter()
            .filter(|&(c, _)| field.is_top(c))
            .map(|(c, _)| c)
            .collect();
        let mut threaded = tops.clone();
        scanned.sort_unstable();
        threaded.sort_unstable();
        assert_eq!(threaded, scanned);
    }

    #[test]
    fn iteration_skips_coarsened_blocks() {
        let mut field = ScalarField2::default();
        field.create_entire_level(3).unwrap();
        field.coarse(field.hcs.coord_from_subs(&[1, 1])).unwrap();

        assert_eq!(field.iter_level(3).count(), 64 - 4);
        assert_eq!(field.n_elements(), 4 + 16 + 64 - 4);
        // The surviving level-3 leaves plus the coarsened cell itself.
        assert_eq!(field.n_elements_top(), 64 - 4 + 1);
    }

    #[test]
    fn single_level_iteration_stays_on_its_level() {
        let mut field = ScalarField2::default();
        field.create_entire_level(2).unwrap();
        for (c, _) in field.iter_level(1) {
            assert_eq!(field.hcs.level(c), 1);
        }
        assert_eq!(field.iter_level(1).count(), 4);
        assert_eq!(field.iter_level(2).count(), 16);
        assert_eq!(field.iter_level(3).count(), 0);
    }

    #[test]
    fn values_come_along() {
        let mut field = ScalarField2::default();
        field.create_entire_level(1).unwrap();
        field.for_each_mut(|c, v| *v = c as f64);
        for (c, v) in field.iter() {
            assert_relative_eq!(*v, c as f64);
        }
    }

    #[test]
    fn zip_walks_two_fields_in_lockstep() {
        let mut a = ScalarField2::default();
        a.create_entire_level(2).unwrap();
        a.fill(2.0);
        let mut b = a.clone();
        b.fill(5.0);

        let mut dot = 0.0;
        for (_, x, y) in a.zip(&b).unwrap() {
            dot += x * y;
        }
        assert_relative_eq!(dot, 20.0 * 10.0);
    }

    #[test]
    fn zip_rejects_different_structures() {
        let mut a = ScalarField2::default();
        a.create_entire_level(2).unwrap();
        let mut b = ScalarField2::default();
        b.create_entire_level(1).unwrap();
        assert!(matches!(a.zip(&b), Err(FieldError::InconsistentIteration)));
    }

    #[test]
    fn one_dimensional_iteration_terminates() {
        let mut field = crate::ScalarField1::default();
        field.create_entire_level(2).unwrap();
        assert_eq!(field.n_elements(), 2 + 4);
        assert_eq!(field.n_elements_top(), 4);
    }

    #[test]
    fn leaf_thread_ends_after_a_coarsened_root() {
        // One dimension has no gaps between level ranges, so the slots behind
        // a coarsened root still point at it; the thread must not cycle.
        let mut field = crate::ScalarField1::default();
        field.create_entire_level(2).unwrap();
        field.coarse(CENTER).unwrap();
        let tops: Vec<Coord> = field.iter_top().map(|(c, _)| c).collect();
        assert_eq!(tops, vec![CENTER]);
        assert_eq!(field.n_elements(), 0);
    }

    #[test]
    fn one_dimensional_coarse_rethreads_the_leaves() {
        let mut field = crate::ScalarField1::default();
        field.create_entire_level(2).unwrap();
        let low_half = field.hcs.coord_from_subs(&[0]);
        field.coarse(low_half).unwrap();
        let tops: Vec<Coord> = field.iter_top().map(|(c, _)| c).collect();
        assert_eq!(tops, vec![2, 6, 7]);
        assert_eq!(field.n_elements(), 2 + 2);
    }

    #[test]
    fn iteration_after_refine_to() {
        let mut field = ScalarField2::default();
        field.refine_to(field.hcs.coord_from_subs(&[3, 2])).unwrap();
        // Levels 1 and 2 each hold one complete sibling set.
        assert_eq!(field.iter_level(1).count(), 4);
        assert_eq!(field.iter_level(2).count(), 4);
        assert_eq!(field.n_elements(), 8);
        assert_eq!(field.n_elements_top(), 3 + 4);
    }
}
