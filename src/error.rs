use crate::hcs::Coord;

use thiserror::Error;

/// Validation errors surfaced to callers.
///
/// Invariant violations (a corrupt refinement tree, `is_top` on an absent
/// coordinate) indicate bugs rather than bad input and panic instead.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FieldError {
    /// Direct access to a coordinate the field does not hold.
    #[error("coordinate {0:#x} does not exist in the field")]
    OutOfDomain(Coord),

    /// Assignment between fields whose refinement structures differ.
    #[error("field structures differ: {expected} slots vs {got}")]
    StructureMismatch { expected: usize, got: usize },

    /// An operation's entry requirement was not met.
    #[error("precondition failed: {0}")]
    FailsPrecondition(&'static str),

    /// Lockstep iteration over fields with different structure.
    #[error("cannot iterate fields of different structure in lockstep")]
    InconsistentIteration,
}
