use core::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use num_traits::Zero;

/// Precision of weights, positions and scales.
pub type Real = f64;

/// Capability bound for field element types.
///
/// A field stores values of any type with a zero, ring arithmetic against
/// itself and scaling by [`Real`] weights. Scalars are just `Real`; vector
/// and tensor elements from consumer crates qualify by implementing the same
/// operator set. Nothing else is required of an element.
pub trait FieldValue:
    Copy
    + Default
    + PartialEq
    + Zero
    + Neg<Output = Self>
    + Add<Output = Self>
    + AddAssign
    + Sub<Output = Self>
    + SubAssign
    + Mul<Output = Self>
    + MulAssign
    + Div<Output = Self>
    + DivAssign
    + Mul<Real, Output = Self>
    + Div<Real, Output = Self>
    + Send
    + Sync
    + 'static
{
}

impl<T> FieldValue for T where
    T: Copy
        + Default
        + PartialEq
        + Zero
        + Neg<Output = T>
        + Add<Output = T>
        + AddAssign
        + Sub<Output = T>
        + SubAssign
        + Mul<Output = T>
        + MulAssign
        + Div<Output = T>
        + DivAssign
        + Mul<Real, Output = T>
        + Div<Real, Output = T>
        + Send
        + Sync
        + 'static
{
}
