//! Decomposition (`IoDesc`, component C).
//!
//! Owns the bidirectional mapping between compute-rank elements and
//! I/O-rank elements for one logical array shape. Reference: spec.md §3, §4.C.

use crate::comm::DerivedType;
use crate::region::{build_regions, Region};
use crate::typetag::ElementType;

/// Which algorithm builds and executes the mapping for an `IoDesc`.
///
/// Reference: spec.md Glossary "Rearranger".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearrangerKind {
    Box,
    Subset,
}

/// A decomposition map: the bidirectional mapping from compute-side
/// elements to I/O-side elements for a fixed global array shape.
///
/// Reference: spec.md §3 "IoDesc".
pub struct IoDesc {
    pub ndims: usize,
    pub gdimlen: Vec<i64>,
    /// 1-based global linear indices on the owning compute rank; 0 marks a hole.
    pub map: Vec<i64>,
    pub element_type: ElementType,
    pub rearranger: RearrangerKind,

    // --- Derived, box: send_counts has one entry per I/O task; subset: one entry. ---
    pub send_counts: Vec<i32>,
    /// For each compute-side element, its position in the packed send buffer.
    pub send_index: Vec<i32>,

    /// I/O-rank only: ranks this I/O rank receives from.
    pub recv_from: Vec<i32>,
    pub recv_counts: Vec<i32>,
    /// I/O-rank only: for each received element, its position in the local
    /// packed (I/O-side) buffer.
    pub recv_index: Vec<i32>,
    /// Number of elements this I/O rank owns.
    pub local_len: usize,

    pub regions: Vec<Region>,

    pub send_type: Vec<Option<DerivedType>>,
    pub recv_type: Vec<Option<DerivedType>>,

    /// True iff the union of all maps does not cover the global array.
    pub needs_fill: bool,
    /// Subset rearranger only: regions covering the uncovered portion.
    pub fill_regions: Vec<Region>,
    pub hole_grid_size: i64,

    /// Largest region-element-count on any I/O rank.
    pub max_io_buflen: i64,
    /// Upper bound on bytes per variable per transfer.
    pub max_bytes: i64,
}

impl IoDesc {
    pub fn total_grid_size(gdimlen: &[i64]) -> i64 {
        gdimlen.iter().product()
    }

    /// `ndof` on this compute rank: entries in `map`, holes included.
    pub fn ndof(&self) -> usize {
        self.map.len()
    }

    /// Count of this rank's non-hole (live) elements.
    pub fn live_count(&self) -> i64 {
        self.map.iter().filter(|&&m| m != 0).count() as i64
    }

    /// Invariant check (spec.md §3 invariants, used in tests / debug builds):
    /// every map entry is 0 or within `[1, total_grid_size]`.
    pub fn map_entries_in_range(&self) -> bool {
        let total = Self::total_grid_size(&self.gdimlen);
        self.map.iter().all(|&m| m == 0 || (1..=total).contains(&m))
    }
}

/// Lazily-constructed datatype cache slot accounting, shared by both
/// rearranger variants when they call `define_datatypes` (§4.D).
///
/// `committed` mirrors the "commit-once-free-once per IoDesc per peer"
/// contract from spec.md §9 "Derived datatype lifetime".
pub struct DatatypeCache {
    pub committed: bool,
}

impl Default for DatatypeCache {
    fn default() -> Self {
        DatatypeCache { committed: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_iodesc(gdimlen: Vec<i64>, map: Vec<i64>) -> IoDesc {
        let regions = build_regions(&gdimlen, &map);
        IoDesc {
            ndims: gdimlen.len(),
            gdimlen,
            map,
            element_type: ElementType::Double,
            rearranger: RearrangerKind::Box,
            send_counts: vec![],
            send_index: vec![],
            recv_from: vec![],
            recv_counts: vec![],
            recv_index: vec![],
            local_len: 0,
            regions,
            send_type: vec![],
            recv_type: vec![],
            needs_fill: false,
            fill_regions: vec![],
            hole_grid_size: 0,
            max_io_buflen: 0,
            max_bytes: 0,
        }
    }

    #[test]
    fn test_live_count_ignores_holes() {
        let iodesc = empty_iodesc(vec![4], vec![1, 0, 3, 0]);
        assert_eq!(iodesc.live_count(), 2);
        assert_eq!(iodesc.ndof(), 4);
    }

    #[test]
    fn test_map_entries_in_range() {
        let good = empty_iodesc(vec![2, 2], vec![1, 2, 3, 4]);
        assert!(good.map_entries_in_range());

        let bad = empty_iodesc(vec![2, 2], vec![1, 2, 3, 5]);
        assert!(!bad.map_entries_in_range());
    }

    #[test]
    fn test_total_grid_size() {
        assert_eq!(IoDesc::total_grid_size(&[3, 4, 5]), 60);
    }
}
