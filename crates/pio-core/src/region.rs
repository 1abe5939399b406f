//! Region builder (component B).
//!
//! Converts a local compute/IO-rank map of global linear indices into the
//! minimal set of contiguous hyper-rectangular regions it covers.
//!
//! Reference: spec.md §4.B; grounded on `find_region`/`expand_region` in
//! `examples/original_source/src/clib/pio_rearrange.c`.

/// One hyper-rectangle of the global array, plus the offset into the
/// I/O-side packed buffer where its data begins.
///
/// Reference: spec.md §3 "Region".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: Vec<i64>,
    pub count: Vec<i64>,
    pub local_offset: i64,
}

impl Region {
    pub fn num_elements(&self) -> i64 {
        self.count.iter().product()
    }
}

/// Convert a 0-based linear index into an `ndims`-long coordinate,
/// most-significant dimension first.
///
/// Reference: `idx_to_dim_list` in `pio_rearrange.c`.
fn idx_to_coord(gdimlen: &[i64], idx: i64) -> Vec<i64> {
    let ndims = gdimlen.len();
    let mut coord = vec![0i64; ndims];
    let mut curr = idx;
    for d in (0..ndims).rev() {
        let next = curr / gdimlen[d];
        coord[d] = curr - next * gdimlen[d];
        curr = next;
    }
    coord
}

/// Find the first region in `map[0..]`: seed `start` from `map[0]`, then
/// grow `count` as far as possible.
///
/// Reference: `find_region` in `pio_rearrange.c`.
fn find_first_region(gdimlen: &[i64], map: &[i64]) -> (Vec<i64>, Vec<i64>) {
    let ndims = gdimlen.len();
    let start = idx_to_coord(gdimlen, map[0] - 1);
    let max_size: Vec<i64> = (0..ndims).map(|d| gdimlen[d] - start[d]).collect();
    let mut count = vec![0i64; ndims];
    expand_region(ndims - 1, gdimlen, map, 1, 1, &max_size, &mut count);
    (start, count)
}

/// Expand `count` outward starting from the innermost dimension (`dim`),
/// as far as the map stays a monotone arithmetic progression with stride
/// `region_stride`, recursing to the next outer dimension.
///
/// Reference: `expand_region` in `pio_rearrange.c`.
fn expand_region(
    dim: usize,
    gdimlen: &[i64],
    map: &[i64],
    region_size: i64,
    region_stride: i64,
    max_size: &[i64],
    count: &mut [i64],
) {
    let mut expanded = 1i64;
    for i in 1..=max_size[dim] {
        let mut ok = true;
        for j in 0..region_size {
            let test_idx = (j + i * region_size) as usize;
            if test_idx >= map.len() || map[test_idx] != map[j as usize] + i * region_stride {
                ok = false;
                break;
            }
        }
        if !ok {
            break;
        }
        expanded = i;
    }
    count[dim] = expanded;

    if dim > 0 {
        expand_region(
            dim - 1,
            gdimlen,
            map,
            region_size * expanded,
            region_stride * gdimlen[dim],
            max_size,
            count,
        );
    }
}

/// Build the minimal list of regions covering `map` (a sorted, 1-based,
/// zero-marks-hole map of length `maplen`), skipping holes.
///
/// Guarantees: regions are pairwise disjoint; their union equals
/// `{ map[0..maplen) \ {0} }`; each region is a true hyper-rectangle.
///
/// Reference: spec.md §4.B steps 1–5.
pub fn build_regions(gdimlen: &[i64], map: &[i64]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut nread = 0usize;
    let mut local_offset = 0i64;

    // Step 1: skip leading holes.
    while nread < map.len() && map[nread] == 0 {
        nread += 1;
    }

    while nread < map.len() {
        let remaining = &map[nread..];
        let (start, count) = find_first_region(gdimlen, remaining);
        let region_len: i64 = count.iter().product();

        regions.push(Region {
            start,
            count,
            local_offset,
        });

        local_offset += region_len;
        nread += region_len as usize;

        // Skip any holes between regions.
        while nread < map.len() && map[nread] == 0 {
            nread += 1;
        }
    }

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario 3 from spec.md §8: 2x3 grid, fully covered map.
    #[test]
    fn test_full_grid_single_region() {
        let gdimlen = vec![2, 3];
        let map = vec![1, 2, 3, 4, 5, 6];
        let regions = build_regions(&gdimlen, &map);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, vec![0, 0]);
        assert_eq!(regions[0].count, vec![2, 3]);
        assert_eq!(regions[0].local_offset, 0);
    }

    /// Scenario 4 from spec.md §8: 2x3 grid with a hole at global index 4.
    #[test]
    fn test_grid_with_hole() {
        let gdimlen = vec![2, 3];
        let map = vec![1, 2, 3, 5, 6];
        let regions = build_regions(&gdimlen, &map);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].start, vec![0, 0]);
        assert_eq!(regions[0].count, vec![1, 3]);
        assert_eq!(regions[1].start, vec![1, 1]);
        assert_eq!(regions[1].count, vec![1, 2]);
    }

    #[test]
    fn test_leading_hole_skipped() {
        let gdimlen = vec![4];
        let map = vec![0, 2, 3, 4];
        let regions = build_regions(&gdimlen, &map);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, vec![1]);
        assert_eq!(regions[0].count, vec![3]);
    }

    #[test]
    fn test_empty_map_yields_no_regions() {
        let gdimlen = vec![4];
        let map: Vec<i64> = vec![];
        assert!(build_regions(&gdimlen, &map).is_empty());
    }

    #[test]
    fn test_all_holes_yields_no_regions() {
        let gdimlen = vec![4];
        let map = vec![0, 0, 0, 0];
        assert!(build_regions(&gdimlen, &map).is_empty());
    }

    #[test]
    fn test_non_contiguous_singletons() {
        // 1-D array, map picks alternating elements -> one region each.
        let gdimlen = vec![6];
        let map = vec![1, 3, 5];
        let regions = build_regions(&gdimlen, &map);
        assert_eq!(regions.len(), 3);
        for (i, r) in regions.iter().enumerate() {
            assert_eq!(r.count, vec![1]);
            assert_eq!(r.start, vec![(2 * i) as i64]);
        }
    }

    #[test]
    fn test_regions_tile_with_no_overlap_or_gap() {
        // Randomized-ish but deterministic coverage check over a 3x4 grid.
        let gdimlen = vec![3, 4];
        let map: Vec<i64> = vec![1, 2, 4, 5, 6, 9, 10, 11, 12];
        let regions = build_regions(&gdimlen, &map);

        let mut covered = std::collections::HashSet::new();
        for r in &regions {
            let mut idx = vec![0i64; r.start.len()];
            let total: i64 = r.count.iter().product();
            for lin in 0..total {
                let mut rem = lin;
                for d in (0..r.start.len()).rev() {
                    idx[d] = r.start[d] + rem % r.count[d];
                    rem /= r.count[d];
                }
                let mut global = 0i64;
                for d in 0..idx.len() {
                    global = global * gdimlen[d] + idx[d];
                }
                assert!(covered.insert(global), "overlap detected at {global}");
            }
        }

        let expected: std::collections::HashSet<i64> = map.iter().map(|&g| g - 1).collect();
        assert_eq!(covered, expected);
    }
}
