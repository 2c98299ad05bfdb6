mod interp;
mod iter;

pub use interp::CoeffMap;
pub use iter::{Iter, Zip};

use crate::error::FieldError;
use crate::hcs::{Coord, Hcs, Level, CENTER, MAX_FACES};
use crate::value::{FieldValue, Real};

use log::debug;
use smallvec::SmallVec;
use std::array;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use std::sync::Arc;

/// Supplies the value of a boundary face. Receives the field and the tagged
/// boundary coordinate; [`Hcs::remove_boundary`] recovers the interior
/// coordinate that hit the face.
pub type BoundaryFn<T, const D: usize> = Arc<dyn Fn(&Field<T, D>, Coord) -> T + Send + Sync>;

/// What [`Field::entry`] does for a coordinate that does not exist.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AccessPolicy {
    /// Fail with [`FieldError::OutOfDomain`].
    Strict,
    /// Refine the field until the coordinate exists, then hand out its slot.
    /// Possibly expensive.
    Refine,
    /// Interpolate into the intermediate slot and hand that out; writes stay
    /// in the intermediate.
    #[default]
    Interpolate,
    /// Hand out the intermediate slot untouched. Fastest; pre-set the
    /// intermediate to a sentinel to detect misses.
    Nothing,
}

/// Sparse storage over the H coordinate system.
///
/// Every existing coordinate owns a slot in `data`, addressed directly by its
/// coordinate value. The parallel `tree` array encodes existence and the
/// refinement structure per slot:
///
/// - `tree[c] == c`: `c` exists and is top-level (a leaf).
/// - `tree[c] > c`: `c` exists with descendants; the value is its left-most
///   leaf descendant, which is what lets iteration jump between leaves.
/// - `tree[c] < c`: `c` does not exist; the value is its covering leaf
///   ancestor, or 0 in the non-canonical gaps between level ranges.
///
/// Only complete sets of `2^D` siblings ever exist, leaves tile the domain,
/// and the root always exists.
pub struct Field<T, const D: usize> {
    pub hcs: Hcs<D>,
    label: Option<String>,
    data: Vec<T>,
    tree: Vec<Coord>,
    boundaries: [Option<BoundaryFn<T, D>>; MAX_FACES],
    boundary_propagate: [bool; MAX_FACES],
    policy: AccessPolicy,
    intermediate: T,
}

impl<T: FieldValue, const D: usize> Default for Field<T, D> {
    fn default() -> Self {
        Self::new(Hcs::default())
    }
}

impl<T: FieldValue, const D: usize> Field<T, D> {
    pub fn new(hcs: Hcs<D>) -> Self {
        Self {
            hcs,
            label: None,
            data: vec![T::zero(); 2],
            tree: vec![0, CENTER],
            boundaries: array::from_fn(|_| None),
            boundary_propagate: [true; MAX_FACES],
            policy: AccessPolicy::default(),
            intermediate: T::zero(),
        }
    }

    pub fn with_label(hcs: Hcs<D>, label: impl Into<String>) -> Self {
        let mut field = Self::new(hcs);
        field.label = Some(label.into());
        field
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    // Existence --------------------------------------------------------------

    /// Does the field hold a value for `coord`? Boundary coordinates and the
    /// gaps between level ranges never exist.
    #[inline]
    pub fn exists(&self, coord: Coord) -> bool {
        coord >= CENTER
            && !self.hcs.is_boundary(coord)
            && (coord as usize) < self.tree.len()
            && self.tree[coord as usize] >= coord
    }

    /// Is `coord` a leaf, i.e. no finer coordinates present below it?
    ///
    /// Panics when `coord` does not exist; asking is a bug, not an input
    /// error.
    #[inline]
    pub fn is_top(&self, coord: Coord) -> bool {
        assert!(
            self.exists(coord),
            "is_top on non-existent coord {}",
            self.hcs.format_coord(coord)
        );
        self.tree[coord as usize] == coord
    }

    /// Borrow the stored value at an existing coordinate.
    pub fn get_direct(&self, coord: Coord) -> Result<&T, FieldError> {
        if self.exists(coord) {
            Ok(&self.data[coord as usize])
        } else {
            Err(FieldError::OutOfDomain(coord))
        }
    }

    pub fn get_direct_mut(&mut self, coord: Coord) -> Result<&mut T, FieldError> {
        if self.exists(coord) {
            Ok(&mut self.data[coord as usize])
        } else {
            Err(FieldError::OutOfDomain(coord))
        }
    }

    /// Coordinate access under the field's [`AccessPolicy`].
    ///
    /// Existing coordinates hand out their slot. Under `Refine` the returned
    /// reference points into storage but names a slot only until the next
    /// structural mutation; do not cache the coordinate's address across
    /// refinements. Under `Interpolate` and `Nothing` the reference is the
    /// intermediate slot and writes do not touch the field proper.
    pub fn entry(&mut self, coord: Coord) -> Result<&mut T, FieldError> {
        if self.exists(coord) {
            return Ok(&mut self.data[coord as usize]);
        }
        match self.policy {
            AccessPolicy::Strict => Err(FieldError::OutOfDomain(coord)),
            AccessPolicy::Refine => {
                self.refine_to(coord)?;
                Ok(&mut self.data[coord as usize])
            }
            AccessPolicy::Interpolate => {
                self.intermediate = self.get(coord);
                Ok(&mut self.intermediate)
            }
            AccessPolicy::Nothing => Ok(&mut self.intermediate),
        }
    }

    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AccessPolicy) {
        self.policy = policy;
    }

    pub fn intermediate(&self) -> &T {
        &self.intermediate
    }

    pub fn set_intermediate(&mut self, value: T) {
        self.intermediate = value;
    }

    // Boundary faces ---------------------------------------------------------

    /// Registers the value source for one boundary face
    /// (`face = 2 * axis + sign`, even positive). Faces without a callback
    /// contribute zero.
    pub fn set_boundary(
        &mut self,
        face: usize,
        f: impl Fn(&Field<T, D>, Coord) -> T + Send + Sync + 'static,
    ) {
        assert!(face < 2 * D, "face {} out of range for {} dimensions", face, D);
        self.boundaries[face] = Some(Arc::new(f));
    }

    pub fn clear_boundary(&mut self, face: usize) {
        assert!(face < 2 * D, "face {} out of range for {} dimensions", face, D);
        self.boundaries[face] = None;
    }

    /// Whether copying this field carries the face's callback along.
    pub fn set_boundary_propagate(&mut self, face: usize, propagate: bool) {
        assert!(face < 2 * D, "face {} out of range for {} dimensions", face, D);
        self.boundary_propagate[face] = propagate;
    }

    fn boundary_value(&self, boundary_coord: Coord) -> T {
        let face = self.hcs.boundary_direction(boundary_coord) as usize;
        match &self.boundaries[face] {
            Some(f) => f(self, boundary_coord),
            None => T::zero(),
        }
    }

    // Structure --------------------------------------------------------------

    /// Deepest level the storage currently covers.
    pub fn highest_level(&self) -> Level {
        if self.tree.len() <= 2 {
            0
        } else {
            self.hcs.level(self.tree.len() as Coord - 2)
        }
    }

    /// Number of existing coordinates at levels 1 and deeper.
    pub fn n_elements(&self) -> usize {
        self.iter().count()
    }

    /// Number of leaves.
    pub fn n_elements_top(&self) -> usize {
        self.iter_top().count()
    }

    fn is_empty_structure(&self) -> bool {
        self.tree[CENTER as usize] == CENTER
    }

    /// Densely populates levels 1 through `level`; `level` becomes the leaf
    /// layer. Only allowed on an empty field (fresh, cleared, or coarsened to
    /// the root); values start at zero.
    pub fn create_entire_level(&mut self, level: Level) -> Result<(), FieldError> {
        if !self.is_empty_structure() {
            return Err(FieldError::FailsPrecondition(
                "create_entire_level requires an empty field",
            ));
        }
        if level > self.hcs.max_level {
            return Err(FieldError::FailsPrecondition(
                "level exceeds the coordinate system's max_level",
            ));
        }
        if level == 0 {
            return Ok(());
        }

        let len = (self.hcs.max_level_coord(level) + 2) as usize;
        debug!("creating entire level {level}, {len} slots");
        self.tree = vec![0; len];
        self.data = vec![T::zero(); len];

        for c in self.hcs.min_level_coord(level)..=self.hcs.max_level_coord(level) {
            self.tree[c as usize] = c;
        }
        for l in (1..level).rev() {
            for c in self.hcs.min_level_coord(l)..=self.hcs.max_level_coord(l) {
                self.tree[c as usize] = self.tree[(c << D) as usize];
            }
        }
        self.tree[CENTER as usize] = self.tree[self.hcs.min_level_coord(1) as usize];
        Ok(())
    }

    /// Splits the leaf `coord` into its `2^D` children, which become leaves
    /// pre-populated with interpolated values.
    pub fn refine_from(&mut self, coord: Coord) -> Result<(), FieldError> {
        if !self.exists(coord) {
            return Err(FieldError::FailsPrecondition(
                "refine_from requires an existing coord",
            ));
        }
        if self.tree[coord as usize] != coord {
            return Err(FieldError::FailsPrecondition(
                "refine_from requires a top-level coord",
            ));
        }
        let child_level = self.hcs.level(coord) + 1;
        if child_level > self.hcs.max_level {
            return Err(FieldError::FailsPrecondition(
                "refinement beyond the coordinate system's max_level",
            ));
        }

        self.grow_to_level(child_level);
        let lo = self.hcs.increase_level(coord, 0);
        let parts = self.hcs.parts as Coord;

        // Interpolate while `coord` still covers the children.
        let mut values: SmallVec<[T; 8]> = SmallVec::with_capacity(parts as usize);
        for k in 0..parts {
            values.push(self.get(lo + k));
        }

        for k in 0..parts {
            let child = lo + k;
            self.tree[child as usize] = child;
            self.treefill_up(child, child);
            self.data[child as usize] = values[k as usize];
        }
        self.treefill_down(lo, lo);
        Ok(())
    }

    /// Brings `coord` into existence as a leaf, refining every ancestor along
    /// its sub-coordinate path. No-op when it already exists.
    pub fn refine_to(&mut self, coord: Coord) -> Result<(), FieldError> {
        if coord < CENTER || self.hcs.is_boundary(coord) {
            return Err(FieldError::OutOfDomain(coord));
        }
        if self.hcs.level(coord) > self.hcs.max_level {
            return Err(FieldError::FailsPrecondition(
                "coord lies beyond the coordinate system's max_level",
            ));
        }
        let mut ancestor = coord;
        let mut steps: u32 = 0;
        while !self.exists(ancestor) {
            ancestor = self.hcs.reduce_level(ancestor);
            steps += 1;
        }
        for k in (0..steps).rev() {
            if self.is_top(ancestor) {
                self.refine_from(ancestor)?;
            }
            ancestor = self
                .hcs
                .increase_level(ancestor, self.hcs.extract(coord, k as Level));
        }
        Ok(())
    }

    /// Makes `coord` a leaf again, deleting everything below it. No-op when
    /// it already is one.
    pub fn coarse(&mut self, coord: Coord) -> Result<(), FieldError> {
        if !self.exists(coord) {
            return Err(FieldError::OutOfDomain(coord));
        }
        if self.tree[coord as usize] == coord {
            return Ok(());
        }
        debug!("coarsening {}", self.hcs.format_coord(coord));
        self.tree[coord as usize] = coord;
        self.treefill_up(coord, coord);
        self.treefill_down(coord, coord);
        Ok(())
    }

    /// Resets the field to the singleton root.
    pub fn clear(&mut self) {
        self.data = vec![T::zero(); 2];
        self.tree = vec![0, CENTER];
    }

    // Tree threading ---------------------------------------------------------

    /// Grows both arrays to cover `level`, marking every newly covered
    /// canonical coordinate absent with a pointer to its covering leaf.
    fn grow_to_level(&mut self, level: Level) {
        let len = (self.hcs.max_level_coord(level) + 2) as usize;
        if len <= self.tree.len() {
            return;
        }
        let old_top = self.highest_level();
        self.tree.resize(len, 0);
        self.data.resize(len, T::zero());
        for l in (old_top + 1)..=level {
            for c in self.hcs.min_level_coord(l)..=self.hcs.max_level_coord(l) {
                let parent = self.hcs.reduce_level(c);
                let link = self.tree[parent as usize];
                self.tree[c as usize] = if link == parent { parent } else { link };
            }
        }
    }

    /// Points every stored descendant of `start` at `value`. The spare slot
    /// past the covered range stays zero; it terminates the leaf thread.
    fn treefill_up(&mut self, start: Coord, value: Coord) {
        let covered = self.tree.len() as Coord - 1;
        let mut lo = start << D;
        let mut count = self.hcs.parts as Coord;
        while lo < covered {
            let hi = (lo + count).min(covered);
            for slot in &mut self.tree[lo as usize..hi as usize] {
                *slot = value;
            }
            lo <<= D;
            count <<= D;
        }
    }

    /// Rethreads ancestors' left-most-leaf pointers to `value`, ascending
    /// while `start` is the first child of its parent.
    fn treefill_down(&mut self, start: Coord, value: Coord) {
        let mut c = start;
        while c > CENTER && self.hcs.extract(c, 0) == 0 {
            let parent = self.hcs.reduce_level(c);
            self.tree[parent as usize] = value;
            c = parent;
        }
    }

    // Bulk data --------------------------------------------------------------

    /// Writes `value` to every existing coordinate (levels 1 and deeper).
    pub fn fill(&mut self, value: T) {
        self.for_each_mut(|_, v| *v = value);
    }

    /// Copies values (and propagated boundary callbacks) from a field of
    /// equal structure.
    pub fn assign_from(&mut self, other: &Field<T, D>) -> Result<(), FieldError> {
        if self.data.len() != other.data.len() {
            return Err(FieldError::StructureMismatch {
                expected: self.data.len(),
                got: other.data.len(),
            });
        }
        self.data.copy_from_slice(&other.data);
        for (face, callback) in other.boundaries.iter().enumerate() {
            if other.boundary_propagate[face] {
                self.boundaries[face] = callback.clone();
            }
        }
        Ok(())
    }

    /// Adopts `other`'s refinement structure; retained slots keep their
    /// values, newly covered slots start at zero.
    pub fn take_structure<U: FieldValue>(&mut self, other: &Field<U, D>) {
        self.tree = other.tree.clone();
        self.data.resize(self.tree.len(), T::zero());
    }

    pub fn same_structure<U: FieldValue>(&self, other: &Field<U, D>) -> bool {
        self.tree == other.tree
    }

    /// Rewrites every leaf from a field of another element type.
    pub fn convert<U: FieldValue>(
        &mut self,
        source: &Field<U, D>,
        mut convert_fn: impl FnMut(Coord, &Field<U, D>) -> T,
    ) {
        self.for_each_top_mut(|c, v| *v = convert_fn(c, source));
    }

    /// Rewrites every leaf from two source fields, interpolating each source
    /// at the leaf's coordinate.
    pub fn merge<U: FieldValue>(
        &mut self,
        source1: &Field<U, D>,
        source2: &Field<U, D>,
        mut merge_fn: impl FnMut(Coord, U, U) -> T,
    ) {
        self.for_each_top_mut(|c, v| *v = merge_fn(c, source1.get(c), source2.get(c)));
    }

    /// Averages leaf values down into every interior coordinate, deepest
    /// levels first, so each level is built from the freshly updated one
    /// above.
    pub fn propagate(&mut self) {
        let top = self.highest_level();
        if top == 0 {
            return;
        }
        let share = 1.0 / self.hcs.parts as Real;
        for level in (0..top).rev() {
            let mut cursor = if level == 0 {
                Some(CENTER)
            } else {
                self.next_existing(self.hcs.min_level_coord(level))
            };
            while let Some(c) = cursor {
                if self.hcs.level(c) != level {
                    break;
                }
                if self.tree[c as usize] != c {
                    let lo = self.hcs.increase_level(c, 0);
                    let mut sum = T::zero();
                    for k in 0..self.hcs.parts as Coord {
                        sum += self.data[(lo + k) as usize];
                    }
                    self.data[c as usize] = sum * share;
                }
                cursor = if c == CENTER {
                    None
                } else {
                    self.next_existing(c + 1)
                };
            }
        }
    }

    // Interior mutation ------------------------------------------------------

    /// Visits every existing coordinate (levels 1 and deeper) mutably, in
    /// ascending coordinate order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(Coord, &mut T)) {
        let mut cursor = self.next_existing(self.hcs.min_level_coord(1));
        while let Some(c) = cursor {
            f(c, &mut self.data[c as usize]);
            cursor = self.next_existing(c + 1);
        }
    }

    /// Visits every leaf mutably, in leaf-thread order.
    pub fn for_each_top_mut(&mut self, mut f: impl FnMut(Coord, &mut T)) {
        let mut cursor = Some(self.tree[CENTER as usize]);
        while let Some(c) = cursor {
            f(c, &mut self.data[c as usize]);
            cursor = self.next_leaf(c);
        }
    }
}

impl<T: FieldValue, const D: usize> Clone for Field<T, D> {
    fn clone(&self) -> Self {
        let mut boundaries: [Option<BoundaryFn<T, D>>; MAX_FACES] = array::from_fn(|_| None);
        for (face, callback) in self.boundaries.iter().enumerate() {
            if self.boundary_propagate[face] {
                boundaries[face] = callback.clone();
            }
        }
        Self {
            hcs: self.hcs.clone(),
            label: self.label.clone(),
            data: self.data.clone(),
            tree: self.tree.clone(),
            boundaries,
            boundary_propagate: self.boundary_propagate,
            policy: self.policy,
            intermediate: self.intermediate,
        }
    }
}

// Arithmetic. Field-field operators keep the left side's structure and read
// the right side through `get`, interpolating where the right side is
// coarser or refined differently.

macro_rules! impl_field_compound_ops {
    ($(($trait:ident, $method:ident, $op:tt)),* $(,)?) => {$(
        impl<T: FieldValue, const D: usize> $trait<&Field<T, D>> for Field<T, D> {
            fn $method(&mut self, rhs: &Field<T, D>) {
                self.for_each_mut(|c, v| *v $op rhs.get(c));
            }
        }

        impl<T: FieldValue, const D: usize> $trait<T> for Field<T, D> {
            fn $method(&mut self, rhs: T) {
                self.for_each_mut(|_, v| *v $op rhs);
            }
        }
    )*};
}

impl_field_compound_ops!(
    (AddAssign, add_assign, +=),
    (SubAssign, sub_assign, -=),
    (MulAssign, mul_assign, *=),
    (DivAssign, div_assign, /=),
);

macro_rules! impl_field_binary_ops {
    ($(($trait:ident, $method:ident, $assign:tt)),* $(,)?) => {$(
        impl<T: FieldValue, const D: usize> $trait<&Field<T, D>> for &Field<T, D> {
            type Output = Field<T, D>;

            fn $method(self, rhs: &Field<T, D>) -> Field<T, D> {
                let mut result = self.clone();
                result $assign rhs;
                result
            }
        }

        impl<T: FieldValue, const D: usize> $trait<T> for &Field<T, D> {
            type Output = Field<T, D>;

            fn $method(self, rhs: T) -> Field<T, D> {
                let mut result = self.clone();
                result $assign rhs;
                result
            }
        }
    )*};
}

impl_field_binary_ops!(
    (Add, add, +=),
    (Sub, sub, -=),
    (Mul, mul, *=),
    (Div, div, /=),
);

impl<T: FieldValue, const D: usize> Neg for &Field<T, D> {
    type Output = Field<T, D>;

    fn neg(self) -> Field<T, D> {
        let mut result = self.clone();
        result.for_each_mut(|_, v| *v = -*v);
        result
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
