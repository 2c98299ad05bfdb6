use super::Field;
use crate::hcs::{ChildIndex, Coord, MAX_DIMS};
use crate::value::{FieldValue, Real};
use crate::SmallKeyHashMap;

use log::error;
use smallvec::SmallVec;

/// Sparse interpolation weights over existing (or boundary) coordinates.
/// The weights of one reconstruction sum to 1.
pub type CoeffMap = SmallKeyHashMap<Coord, Real>;

/// Boundary coordinates collected while probing one stencil corner. At most
/// one per axis.
type BoundaryHits = SmallVec<[Coord; MAX_DIMS]>;

impl<T: FieldValue, const D: usize> Field<T, D> {
    /// The value at `coord`, reconstructing it when the coordinate does not
    /// exist. Stored values are trusted even on interior (non-leaf)
    /// coordinates; call [`Field::propagate`] first if those are stale.
    pub fn get(&self, coord: Coord) -> T {
        self.reconstruct(coord, true)
    }

    /// Like [`Field::get`], but reconstructs interior coordinates from their
    /// leaf descendants instead of trusting stored interior values.
    pub fn get_top(&self, coord: Coord) -> T {
        self.reconstruct(coord, false)
    }

    /// The interpolation weights for `coord` over existing coordinates and
    /// boundary faces. A coordinate that exists maps to itself with weight 1.
    pub fn get_coeffs(&self, coord: Coord) -> CoeffMap {
        let mut coeffs = CoeffMap::default();
        self.accumulate_coeffs(coord, &mut coeffs, 1.0, true, 0);
        coeffs
    }

    /// Like [`Field::get_coeffs`], over leaf coordinates only.
    pub fn get_coeffs_top(&self, coord: Coord) -> CoeffMap {
        let mut coeffs = CoeffMap::default();
        self.accumulate_coeffs(coord, &mut coeffs, 1.0, false, 0);
        coeffs
    }

    fn reconstruct(&self, coord: Coord, use_non_top: bool) -> T {
        debug_assert!(coord != 0, "reconstruct on the SPECIAL coord");
        if self.hcs.is_boundary(coord) {
            return self.boundary_value(coord);
        }
        if self.exists(coord) {
            if use_non_top || self.is_top(coord) {
                return self.data[coord as usize];
            }
            // Interior value rebuilt as the mean of its octants.
            let mut sum = T::zero();
            for k in 0..self.hcs.parts {
                sum += self.reconstruct(self.hcs.increase_level(coord, k as ChildIndex), use_non_top);
            }
            return sum / self.hcs.parts as Real;
        }

        let high = self.hcs.extract(coord, 0);
        let origin = self.hcs.reduce_level(coord);
        let quench = self.boundary_quench(origin, high);

        let mut result = T::zero();
        for corner in 0..self.hcs.parts {
            let (current, weight, hits) = self.probe_corner(origin, high, corner, &quench);
            if !hits.is_empty() {
                let share = weight / hits.len() as Real;
                for &hit in &hits {
                    result += self.boundary_value(hit) * share;
                }
                continue;
            }
            if self.exists(current) && (use_non_top || self.is_top(current)) {
                result += self.data[current as usize] * weight;
            } else {
                result += self.reconstruct(current, use_non_top) * weight;
            }
        }
        result
    }

    fn accumulate_coeffs(
        &self,
        coord: Coord,
        coeffs: &mut CoeffMap,
        weight: Real,
        use_non_top: bool,
        depth: u32,
    ) {
        if self.hcs.is_boundary(coord) {
            *coeffs.entry(coord).or_insert(0.0) += weight;
            return;
        }
        if depth > self.hcs.max_level as u32 {
            error!(
                "coefficient recursion exceeded level {} at {}",
                self.hcs.max_level,
                self.hcs.format_coord(coord)
            );
            panic!("coefficient recursion exceeded max_level: the refinement tree is corrupt");
        }
        if self.exists(coord) {
            if self.is_top(coord) || use_non_top {
                *coeffs.entry(coord).or_insert(0.0) += weight;
                return;
            }
            let share = weight / self.hcs.parts as Real;
            for k in 0..self.hcs.parts {
                self.accumulate_coeffs(
                    self.hcs.increase_level(coord, k as ChildIndex),
                    coeffs,
                    share,
                    use_non_top,
                    depth + 1,
                );
            }
            return;
        }

        let high = self.hcs.extract(coord, 0);
        let origin = self.hcs.reduce_level(coord);
        let quench = self.boundary_quench(origin, high);

        for corner in 0..self.hcs.parts {
            let (current, corner_weight, hits) = self.probe_corner(origin, high, corner, &quench);
            let corner_weight = corner_weight * weight;
            if !hits.is_empty() {
                let share = corner_weight / hits.len() as Real;
                for &hit in &hits {
                    *coeffs.entry(hit).or_insert(0.0) += share;
                }
                continue;
            }
            if self.exists(current) && (use_non_top || self.is_top(current)) {
                *coeffs.entry(current).or_insert(0.0) += corner_weight;
            } else {
                self.accumulate_coeffs(current, coeffs, corner_weight, use_non_top, depth + 1);
            }
        }
    }

    /// Which axes of `origin`'s far side are boundary faces. A quenched axis
    /// splits its weight evenly instead of 0.75/0.25.
    fn boundary_quench(&self, origin: Coord, high: ChildIndex) -> [bool; MAX_DIMS] {
        let mut quench = [false; MAX_DIMS];
        for (axis, slot) in quench.iter_mut().enumerate().take(D) {
            let plus = (high >> axis) & 1 != 0;
            let direction = (2 * axis + usize::from(!plus)) as u8;
            *slot = self.hcs.is_boundary(self.hcs.neighbor(origin, direction));
        }
        quench
    }

    /// Walks from `origin` to the stencil corner selected by `corner`'s bits,
    /// one axis at a time. Steps that leave the domain are recorded and not
    /// taken. Returns the reached coordinate, the corner's weight, and the
    /// boundary coordinates hit on the way.
    fn probe_corner(
        &self,
        origin: Coord,
        high: ChildIndex,
        corner: u32,
        quench: &[bool; MAX_DIMS],
    ) -> (Coord, Real, BoundaryHits) {
        let mut current = origin;
        let mut weight = 1.0;
        let mut hits = BoundaryHits::new();
        for axis in 0..D {
            let far = (corner >> axis) & 1 != 0;
            weight *= if quench[axis] {
                0.5
            } else if far {
                0.25
            } else {
                0.75
            };
            if !far {
                continue;
            }
            let plus = (high >> axis) & 1 != 0;
            let direction = (2 * axis + usize::from(!plus)) as u8;
            let stepped = self.hcs.neighbor(current, direction);
            if self.hcs.is_boundary(stepped) {
                hits.push(stepped);
            } else {
                current = stepped;
            }
        }
        (current, weight, hits)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
