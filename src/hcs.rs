use crate::error::FieldError;
use crate::value::Real;

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// An H coordinate: level marker, Morton body, optional boundary tag.
pub type Coord = u64;

/// A refinement depth. Level 0 is the single root cell.
pub type Level = u8;

/// A D-bit sub-coordinate selecting one of the `2^D` octants of a parent cell.
pub type ChildIndex = u8;

pub const COORD_BITS: u32 = Coord::BITS;
const_assert_eq!(COORD_BITS, 64);

/// The most dimensions any [`Hcs`] supports; masks are sized for this.
pub const MAX_DIMS: usize = 8;
pub const MAX_FACES: usize = 2 * MAX_DIMS;

/// The root cell. It exists in every non-empty field.
pub const CENTER: Coord = 1;

/// Marks a coordinate that left the domain through some face.
const SPECIAL_BIT: Coord = 1 << (COORD_BITS - 1);

/// Domain geometry as plain data, the constructor-argument form of [`Hcs`].
///
/// `center[d] ± scales[d]` spans the domain along axis `d`; the default is
/// the unit box `[0, 1]^D`. Lengths must match the field's dimension count.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DomainConfig {
    pub center: Vec<Real>,
    pub scales: Vec<Real>,
}

impl DomainConfig {
    pub fn unit_box(dimensions: usize) -> Self {
        Self {
            center: vec![0.5; dimensions],
            scales: vec![0.5; dimensions],
        }
    }
}

/// The H coordinate system: pure value algebra over [`Coord`].
///
/// Holds the domain geometry and the precomputed masks for neighbor stepping
/// and Morton packing. It stores no field data.
#[derive(Clone, Debug)]
pub struct Hcs<const D: usize> {
    /// Cartesian center of the domain.
    pub center: [Real; D],
    /// Half-extent of the domain per axis.
    pub scales: [Real; D],
    /// Covers one D-bit level group.
    pub part_mask: Coord,
    /// Number of octants per cell, `2^D`.
    pub parts: u32,
    /// Deepest level the coordinate width can hold.
    pub max_level: Level,
    /// Per direction: the body bits that stay fixed (even, positive) or move
    /// (odd, negative) under successor arithmetic.
    successor_mask: [Coord; MAX_FACES],
    /// Per axis: that axis' bit in every level group, for Morton pack/unpack.
    axis_mask: [Coord; MAX_DIMS],
}

impl<const D: usize> Default for Hcs<D> {
    fn default() -> Self {
        Self::new([0.5; D], [0.5; D])
    }
}

impl<const D: usize> Hcs<D> {
    const DIMS_IN_RANGE: () = assert!(D >= 1 && D <= MAX_DIMS, "Hcs supports 1..=8 dimensions");

    pub fn new(center: [Real; D], scales: [Real; D]) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::DIMS_IN_RANGE;

        let part_mask = ((1 as Coord) << D) - 1;
        let parts = 1u32 << D;
        // One slot for the special bit, D for the direction field; the level
        // marker must stay below both.
        let max_level = ((COORD_BITS as usize - 2 - D) / D) as Level;
        let boundary_mask = !(0 as Coord) << (COORD_BITS as usize - D - 1);

        let mut successor_mask = [0; MAX_FACES];
        let mut axis_mask = [0; MAX_DIMS];
        for dim in 0..D {
            let single = !((1 as Coord) << dim) & part_mask;
            let mut fixed = single;
            for level in 1..max_level as usize {
                fixed |= single << (D * level);
            }
            successor_mask[2 * dim] = fixed;
            successor_mask[2 * dim + 1] = !fixed;
            axis_mask[dim] = !fixed & !boundary_mask;
        }

        Self {
            center,
            scales,
            part_mask,
            parts,
            max_level,
            successor_mask,
            axis_mask,
        }
    }

    pub fn from_config(config: &DomainConfig) -> Result<Self, FieldError> {
        if config.center.len() != D || config.scales.len() != D {
            return Err(FieldError::FailsPrecondition(
                "domain config dimensions do not match the coordinate system",
            ));
        }
        let mut center = [0.0; D];
        let mut scales = [0.0; D];
        center.copy_from_slice(&config.center);
        scales.copy_from_slice(&config.scales);
        Ok(Self::new(center, scales))
    }

    pub fn dimensions(&self) -> usize {
        D
    }

    // Level algebra ----------------------------------------------------------

    #[inline]
    pub fn is_boundary(&self, coord: Coord) -> bool {
        coord & SPECIAL_BIT != 0
    }

    /// The face a boundary coordinate hit: `2 * axis + sign`, even positive.
    #[inline]
    pub fn boundary_direction(&self, coord: Coord) -> u8 {
        ((coord << 1) >> (COORD_BITS as usize - D)) as u8
    }

    /// Strips the boundary tag, exposing the interior coordinate that hit it.
    #[inline]
    pub fn remove_boundary(&self, coord: Coord) -> Coord {
        (coord << (D + 1)) >> (D + 1)
    }

    #[inline]
    fn mark_boundary(&self, coord: Coord, direction: u8) -> Coord {
        coord | SPECIAL_BIT | ((direction as Coord) << (COORD_BITS as usize - 1 - D))
    }

    /// Refinement depth of `coord`. Not meaningful for boundary coordinates.
    #[inline]
    pub fn level(&self, coord: Coord) -> Level {
        if coord <= CENTER {
            0
        } else {
            (Self::level_bit_pos(coord) / D as u32) as Level
        }
    }

    #[inline]
    fn level_bit_pos(coord: Coord) -> u32 {
        COORD_BITS - 1 - coord.leading_zeros()
    }

    /// The closest coordinate one level down. Identity for boundary
    /// coordinates and for the root.
    #[inline]
    pub fn reduce_level(&self, coord: Coord) -> Coord {
        if self.is_boundary(coord) || coord <= CENTER {
            coord
        } else {
            coord >> D
        }
    }

    /// Descends one level into octant `sub`. Identity for boundary
    /// coordinates.
    #[inline]
    pub fn increase_level(&self, coord: Coord, sub: ChildIndex) -> Coord {
        if self.is_boundary(coord) {
            return coord;
        }
        debug_assert!((sub as Coord) <= self.part_mask);
        (coord << D) | sub as Coord
    }

    /// The sub-coordinate at level position `pos`; position 0 is the deepest.
    #[inline]
    pub fn extract(&self, coord: Coord, pos: Level) -> ChildIndex {
        ((coord >> (D as u32 * pos as u32)) & self.part_mask) as ChildIndex
    }

    /// Smallest coordinate of `level`, `2^(level * D)`.
    #[inline]
    pub fn min_level_coord(&self, level: Level) -> Coord {
        (1 as Coord) << (level as usize * D)
    }

    /// Largest coordinate of `level`, `2^(level * D + 1) - 1`.
    #[inline]
    pub fn max_level_coord(&self, level: Level) -> Coord {
        ((1 as Coord) << (level as usize * D + 1)) - 1
    }

    /// Builds a coordinate by descending through `subs` from the root.
    pub fn coord_from_subs(&self, subs: &[ChildIndex]) -> Coord {
        let mut coord = CENTER;
        for &sub in subs {
            coord = self.increase_level(coord, sub);
        }
        coord
    }

    // Neighbors --------------------------------------------------------------

    /// The same-level neighbor in `direction` (`0 = X+, 1 = X-, 2 = Y+, ...`),
    /// in O(1) via successor arithmetic on the interleaved body. Stepping out
    /// of the domain returns a boundary coordinate carrying `coord` and the
    /// direction; a boundary coordinate is its own neighbor.
    pub fn neighbor(&self, coord: Coord, direction: u8) -> Coord {
        debug_assert!((direction as usize) < 2 * D);
        if self.is_boundary(coord) {
            return coord;
        }
        let s_mask = self.successor_mask[direction as usize];
        let result = if direction & 1 != 0 {
            let r = (coord & s_mask).wrapping_sub(1) & s_mask;
            r | (!s_mask & coord)
        } else {
            let r = (coord | s_mask).wrapping_add(1) & !s_mask;
            r | (s_mask & coord)
        };
        // A carry past the level marker means the step left the domain.
        if coord.leading_zeros() == result.leading_zeros() {
            result
        } else {
            self.mark_boundary(coord, direction)
        }
    }

    /// Neighbor stepping through the unscaled Cartesian form. Result-identical
    /// to [`Hcs::neighbor`]; kept as its verification twin.
    pub fn neighbor_unscaled(&self, coord: Coord, direction: u8) -> Coord {
        debug_assert!((direction as usize) < 2 * D);
        if self.is_boundary(coord) {
            return coord;
        }
        let axis = (direction >> 1) as usize;
        let level = self.level(coord);
        let unscaled = self.single_unscaled(coord, axis);
        let stepped = if direction & 1 != 0 {
            unscaled.wrapping_sub(1)
        } else {
            unscaled + 1
        };
        if stepped >= 1u32 << level {
            self.mark_boundary(coord, direction)
        } else {
            self.with_single_unscaled(coord, level, axis, stepped)
        }
    }

    /// Unit vector pointing along `direction`.
    pub fn direction_normal(&self, direction: u8) -> [Real; D] {
        let mut normal = [0.0; D];
        normal[(direction >> 1) as usize] = if direction & 1 != 0 { -1.0 } else { 1.0 };
        normal
    }

    /// Cell spacing at `coord`'s level along `direction`'s axis.
    pub fn distance(&self, coord: Coord, direction: u8) -> Real {
        let axis = (direction >> 1) as usize;
        2.0 * self.scales[axis] / (1u64 << self.level(coord)) as Real
    }

    // Cartesian codec --------------------------------------------------------

    /// Per-axis cell index within the level grid, `[0, 2^level)` per axis.
    ///
    /// An unscaled coordinate is only meaningful together with its level: a
    /// level-8 value 200 and a level-9 value 200 name different locations.
    pub fn unscaled(&self, coord: Coord) -> [u32; D] {
        let mut result = [0; D];
        if self.is_boundary(coord) || coord <= CENTER {
            return result;
        }
        let body = coord & (((1 as Coord) << Self::level_bit_pos(coord)) - 1);
        for (dim, slot) in result.iter_mut().enumerate() {
            *slot = extract_bits(body, self.axis_mask[dim]) as u32;
        }
        result
    }

    /// Single axis of [`Hcs::unscaled`].
    pub fn single_unscaled(&self, coord: Coord, axis: usize) -> u32 {
        let body = coord & (((1 as Coord) << Self::level_bit_pos(coord)) - 1);
        extract_bits(body, self.axis_mask[axis]) as u32
    }

    /// Interleaves per-axis cell indices into a coordinate of `level`.
    pub fn coord_from_unscaled(&self, level: Level, unscaled: [u32; D]) -> Coord {
        let below_marker = ((1 as Coord) << (level as usize * D)) - 1;
        let mut result = 0;
        for dim in 0..D {
            result |= deposit_bits(unscaled[dim] as u64, self.axis_mask[dim] & below_marker);
        }
        result | self.min_level_coord(level)
    }

    fn with_single_unscaled(&self, coord: Coord, level: Level, axis: usize, unscaled: u32) -> Coord {
        let mask = self.axis_mask[axis] & (((1 as Coord) << (level as usize * D)) - 1);
        (coord & !mask) | deposit_bits(unscaled as u64, mask)
    }

    /// Cell-center position of `coord` in domain units. Boundary coordinates
    /// and the root map to the domain center.
    pub fn position(&self, coord: Coord) -> [Real; D] {
        let mut result = self.center;
        if self.is_boundary(coord) || coord <= CENTER {
            return result;
        }
        let unscaled = self.unscaled(coord);
        let cell = 1.0 / (1u64 << self.level(coord)) as Real;
        for dim in 0..D {
            result[dim] = self.center[dim] - self.scales[dim]
                + self.scales[dim] * (2.0 * unscaled[dim] as Real + 1.0) * cell;
        }
        result
    }

    /// The `level` coordinate whose cell contains `position`, clamped to the
    /// domain.
    pub fn coord_from_position(&self, level: Level, position: [Real; D]) -> Coord {
        let cells = (1u64 << level) as Real;
        let mut unscaled = [0u32; D];
        for dim in 0..D {
            let along =
                ((position[dim] - self.center[dim]) / (2.0 * self.scales[dim]) + 0.5) * cells;
            unscaled[dim] = (along.floor().max(0.0) as u64).min((1u64 << level) - 1) as u32;
        }
        self.coord_from_unscaled(level, unscaled)
    }

    // Diagnostics ------------------------------------------------------------

    /// Human-readable rendering: level, sub-coordinate path, position.
    pub fn format_coord(&self, coord: Coord) -> String {
        if coord == 0 {
            return "(SPECIAL)".to_owned();
        }
        if coord == CENTER {
            return "(CENTER)".to_owned();
        }
        if self.is_boundary(coord) {
            return format!(
                "(BOUNDARY: {} ORIGIN: {})",
                self.boundary_direction(coord),
                self.format_coord(self.remove_boundary(coord))
            );
        }
        let level = self.level(coord);
        let subs: Vec<String> = (1..=level)
            .map(|i| self.extract(coord, level - i).to_string())
            .collect();
        let position: Vec<String> = self
            .position(coord)
            .iter()
            .map(|x| format!("{x}"))
            .collect();
        format!("({}) [{}] ({})", level, subs.join(", "), position.join(", "))
    }
}

// Morton bit scatter/gather. With BMI2 these are single instructions; the
// portable loops walk the mask one set bit at a time and produce identical
// results.

#[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
#[inline]
fn deposit_bits(value: u64, mask: u64) -> u64 {
    unsafe { core::arch::x86_64::_pdep_u64(value, mask) }
}

#[cfg(all(target_arch = "x86_64", target_feature = "bmi2"))]
#[inline]
fn extract_bits(value: u64, mask: u64) -> u64 {
    unsafe { core::arch::x86_64::_pext_u64(value, mask) }
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
#[inline]
fn deposit_bits(value: u64, mask: u64) -> u64 {
    let mut remaining = mask;
    let mut from = 1u64;
    let mut result = 0;
    while remaining != 0 {
        let lowest = remaining & remaining.wrapping_neg();
        if value & from != 0 {
            result |= lowest;
        }
        remaining ^= lowest;
        from <<= 1;
    }
    result
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "bmi2")))]
#[inline]
fn extract_bits(value: u64, mask: u64) -> u64 {
    let mut remaining = mask;
    let mut to = 1u64;
    let mut result = 0;
    while remaining != 0 {
        let lowest = remaining & remaining.wrapping_neg();
        if value & lowest != 0 {
            result |= to;
        }
        remaining ^= lowest;
        to <<= 1;
    }
    result
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn masks_and_max_level() {
        let h2 = Hcs::<2>::default();
        assert_eq!(h2.part_mask, 0b11);
        assert_eq!(h2.parts, 4);
        assert_eq!(h2.max_level, 30);

        let h3 = Hcs::<3>::default();
        assert_eq!(h3.part_mask, 0b111);
        assert_eq!(h3.parts, 8);
        assert_eq!(h3.max_level, 19);
    }

    #[test]
    fn level_round_trip() {
        let h = Hcs::<3>::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let level = rng.gen_range(0..10u8);
            let unscaled = [
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
            ];
            let coord = h.coord_from_unscaled(level, unscaled);
            let sub = rng.gen_range(0..h.parts) as ChildIndex;
            assert_eq!(h.reduce_level(h.increase_level(coord, sub)), coord);
            assert_eq!(h.extract(h.increase_level(coord, sub), 0), sub);
        }
    }

    #[test]
    fn level_of_range_bounds() {
        let h = Hcs::<2>::default();
        for level in 0..8 {
            assert_eq!(h.level(h.min_level_coord(level)), level);
            assert_eq!(h.level(h.max_level_coord(level)), level);
        }
        assert_eq!(h.level(CENTER), 0);
        assert_eq!(h.level(0), 0);
    }

    #[test]
    fn neighbor_involution() {
        let h = Hcs::<2>::default();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let level = rng.gen_range(1..12u8);
            let unscaled = [
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
            ];
            let coord = h.coord_from_unscaled(level, unscaled);
            for axis in 0..2u8 {
                let forward = h.neighbor(coord, 2 * axis);
                if h.is_boundary(forward) {
                    continue;
                }
                assert_eq!(h.neighbor(forward, 2 * axis + 1), coord);
            }
        }
    }

    #[test]
    fn neighbor_matches_unscaled_form() {
        let h = Hcs::<3>::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let level = rng.gen_range(1..10u8);
            let unscaled = [
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
            ];
            let coord = h.coord_from_unscaled(level, unscaled);
            for direction in 0..6u8 {
                assert_eq!(
                    h.neighbor(coord, direction),
                    h.neighbor_unscaled(coord, direction),
                    "direction {direction} at {}",
                    h.format_coord(coord)
                );
            }
        }
    }

    #[test]
    fn neighbor_at_root_is_boundary() {
        let h = Hcs::<2>::default();
        for direction in 0..4u8 {
            let stepped = h.neighbor(CENTER, direction);
            assert!(h.is_boundary(stepped));
            assert_eq!(h.boundary_direction(stepped), direction);
            assert_eq!(h.remove_boundary(stepped), CENTER);
        }
    }

    #[test]
    fn boundary_coord_is_its_own_neighbor() {
        let h = Hcs::<2>::default();
        let boundary = h.neighbor(CENTER, 1);
        assert!(h.is_boundary(boundary));
        assert_eq!(h.neighbor(boundary, 0), boundary);
    }

    #[test]
    fn two_steps_off_the_low_corner() {
        // From the level-1 cell at the low corner, the second +X step leaves
        // the domain; the boundary coordinate remembers the cell that stepped.
        let h = Hcs::<3>::default();
        let corner = h.coord_from_subs(&[0]);
        let first = h.neighbor(corner, 0);
        assert!(!h.is_boundary(first));
        let second = h.neighbor(first, 0);
        assert!(h.is_boundary(second));
        assert_eq!(h.boundary_direction(second), 0);
        assert_eq!(h.remove_boundary(second), first);
    }

    #[test]
    fn deep_corner_walk_stays_interior() {
        // At level 3 the +X extent is 8 cells, so the same two steps from the
        // corner stay inside.
        let h = Hcs::<3>::default();
        let corner = h.coord_from_subs(&[0, 0, 0]);
        let first = h.neighbor(corner, 0);
        let second = h.neighbor(first, 0);
        assert!(!h.is_boundary(second));
        assert_eq!(h.unscaled(second)[0], 2);
    }

    #[test]
    fn unscaled_round_trip() {
        let h = Hcs::<3>::default();
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..300 {
            let level = rng.gen_range(0..=10u8);
            let unscaled = [
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
                rng.gen_range(0..1u32 << level),
            ];
            let coord = h.coord_from_unscaled(level, unscaled);
            assert_eq!(h.level(coord), level);
            assert_eq!(h.unscaled(coord), unscaled);
            for axis in 0..3 {
                assert_eq!(h.single_unscaled(coord, axis), unscaled[axis]);
            }
        }
    }

    #[test]
    fn position_round_trip_unit_box() {
        let h = Hcs::<2>::default();
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..300 {
            let level = rng.gen_range(1..=12u8);
            let coord = h.coord_from_unscaled(
                level,
                [
                    rng.gen_range(0..1u32 << level),
                    rng.gen_range(0..1u32 << level),
                ],
            );
            assert_eq!(h.coord_from_position(level, h.position(coord)), coord);
        }
    }

    #[test]
    fn position_round_trip_shifted_domain() {
        // Box [1, 3] x [-2, 0]: center and scales differ, which the cell
        // center formula has to survive.
        let h = Hcs::<2>::new([2.0, -1.0], [1.0, 1.0]);
        for level in 1..=6u8 {
            for x in [0, 1, (1u32 << level) - 1] {
                for y in [0, (1u32 << level) / 2] {
                    let coord = h.coord_from_unscaled(level, [x, y]);
                    assert_eq!(h.coord_from_position(level, h.position(coord)), coord);
                }
            }
        }
    }

    #[test]
    fn position_of_first_cell() {
        let h = Hcs::<1>::new([2.0], [1.0]);
        let coord = h.coord_from_unscaled(1, [0]);
        assert_relative_eq!(h.position(coord)[0], 1.5);
        let coord = h.coord_from_unscaled(1, [1]);
        assert_relative_eq!(h.position(coord)[0], 2.5);
    }

    #[test]
    fn coord_from_position_clamps_to_domain() {
        let h = Hcs::<2>::default();
        let inside = h.coord_from_position(3, [0.99, 0.01]);
        assert_eq!(h.unscaled(inside), [7, 0]);
        let outside = h.coord_from_position(3, [4.0, -4.0]);
        assert_eq!(h.unscaled(outside), [7, 0]);
    }

    #[test]
    fn config_round_trip() {
        let config = DomainConfig::unit_box(2);
        let h = Hcs::<2>::from_config(&config).unwrap();
        assert_relative_eq!(h.center[0], 0.5);
        assert!(Hcs::<3>::from_config(&config).is_err());
    }

    #[test]
    fn format_coord_names_special_cases() {
        let h = Hcs::<2>::default();
        assert_eq!(h.format_coord(0), "(SPECIAL)");
        assert_eq!(h.format_coord(CENTER), "(CENTER)");
        let boundary = h.neighbor(CENTER, 2);
        assert!(h.format_coord(boundary).starts_with("(BOUNDARY: 2"));
        assert!(h.format_coord(h.coord_from_subs(&[3, 1])).starts_with("(2) [3, 1]"));
    }

    #[test]
    fn scatter_gather_are_inverse() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..500 {
            let mask: u64 = rng.gen();
            let bits = mask.count_ones();
            let value = if bits == 64 {
                rng.gen()
            } else {
                rng.gen::<u64>() & ((1u64 << bits) - 1)
            };
            assert_eq!(extract_bits(deposit_bits(value, mask), mask), value);
        }
    }
}
