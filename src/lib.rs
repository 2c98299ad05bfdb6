//! Sparse, hierarchically refined fields on the H coordinate system.
//!
//! # Coordinates
//!
//! An H coordinate ([`Coord`]) packs a whole refinement path into one machine
//! word. The body is a sequence of D-bit groups (one bit per dimension, Morton
//! order), the least significant group naming the *deepest* refinement. A
//! single marker bit above the body identifies the level, which keeps the
//! coordinates of every level in one linear address range so a `Coord` can be
//! used directly as an array index:
//!
//! ```text
//!                 L1  L2
//!  0b0000 .. 001 011 110      level-2 coordinate, 3 dimensions
//!                ZYX ZYX
//!              ^ level marker bit
//! ```
//!
//! The most significant bit tags a *boundary* coordinate: a neighbor step that
//! left the domain. The next D bits name the face that was hit and the low
//! bits still hold the interior coordinate that requested the step. All of
//! the coordinate algebra lives in [`Hcs`].
//!
//! # Fields
//!
//! A [`Field`] stores one value per existing coordinate in a dense `data`
//! array, with a parallel `tree` array encoding existence and refinement in a
//! single word per slot: `tree[c] == c` marks a top-level coordinate (a leaf,
//! TLC), `tree[c] > c` points an interior coordinate at its left-most leaf
//! descendant, and `tree[c] < c` marks absence. Leaves tile the domain at all
//! times; refinement ([`Field::refine_from`], [`Field::refine_to`]) and
//! coarsening ([`Field::coarse`]) re-thread the tree array in place.
//!
//! # Interpolation
//!
//! Reading a coordinate that does not exist reconstructs it from the
//! hypercubic neighborhood one level up, recursively, with exact partition-of-
//! unity weights (0.75 near / 0.25 far per axis, 0.5/0.5 against a boundary
//! face). [`Field::get`] folds the weights into a value;
//! [`Field::get_coeffs`] returns the sparse weight map over existing
//! coordinates instead, which is what stencil and matrix assembly code wants.
//! Boundary faces contribute through user callbacks registered per face.
//!
//! A field is a single-threaded container: no operation blocks, reads do not
//! touch hidden caches, and structural mutation invalidates outstanding
//! iterators through the borrow checker.

mod error;
mod field;
mod hcs;
mod value;

pub use error::*;
pub use field::*;
pub use hcs::*;
pub use value::*;

use ahash::AHashMap;

pub type SmallKeyHashMap<K, V> = AHashMap<K, V>;

/// Scalar field over the unit interval.
pub type ScalarField1 = Field<Real, 1>;
/// Scalar field over the unit square.
pub type ScalarField2 = Field<Real, 2>;
/// Scalar field over the unit cube.
pub type ScalarField3 = Field<Real, 3>;
