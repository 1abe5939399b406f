//! Box rearranger: I/O ranks each own one contiguous block of the flattened
//! global array; compute ranks ship each local element to whichever I/O
//! rank's block contains it.
//!
//! Reference: spec.md §4.C "Box".

use crate::comm::GroupComm;
use crate::iodesc::{IoDesc, RearrangerKind};
use crate::rearrange::sort_with_recv_index;
use crate::region::build_regions;
use crate::typetag::ElementType;

/// Start offset and element count of the 0-based linear block owned by
/// I/O rank `io_index` of `num_iotasks`, splitting `total_grid_size` as
/// evenly as possible (first `total % num_iotasks` ranks get one extra).
pub fn block_bounds(io_index: i32, num_iotasks: i32, total_grid_size: i64) -> (i64, i64) {
    let n = num_iotasks as i64;
    let base = total_grid_size / n;
    let rem = total_grid_size % n;
    let idx = io_index as i64;
    if idx < rem {
        (idx * (base + 1), base + 1)
    } else {
        (rem * (base + 1) + (idx - rem) * base, base)
    }
}

/// Which I/O rank owns 0-based global linear index `global0`.
pub fn target_io_rank(global0: i64, num_iotasks: i32, total_grid_size: i64) -> i32 {
    for io_index in 0..num_iotasks {
        let (start, count) = block_bounds(io_index, num_iotasks, total_grid_size);
        if global0 >= start && global0 < start + count {
            return io_index;
        }
    }
    num_iotasks - 1
}

/// Pure computation of one compute rank's `send_counts`/`send_index`
/// (§4.C bullet 2): for each live `map` entry, which I/O rank it targets
/// and its position in the I/O-rank-major packed send buffer. Hole
/// entries (`map[i] == 0`) get `send_index[i] == -1`.
pub fn assign_send_counts(map: &[i64], num_iotasks: i32, total_grid_size: i64) -> (Vec<i32>, Vec<i32>) {
    let mut send_counts = vec![0i32; num_iotasks as usize];
    let mut targets = vec![-1i32; map.len()];

    for (i, &m) in map.iter().enumerate() {
        if m == 0 {
            continue;
        }
        let rank = target_io_rank(m - 1, num_iotasks, total_grid_size);
        targets[i] = rank;
        send_counts[rank as usize] += 1;
    }

    let mut offsets = vec![0i32; num_iotasks as usize];
    let mut running = 0i32;
    for (r, slot) in offsets.iter_mut().enumerate() {
        *slot = running;
        running += send_counts[r];
    }

    let mut send_index = vec![-1i32; map.len()];
    let mut cursor = offsets.clone();
    for (i, &rank) in targets.iter().enumerate() {
        if rank < 0 {
            continue;
        }
        send_index[i] = cursor[rank as usize];
        cursor[rank as usize] += 1;
    }

    (send_counts, send_index)
}

/// Build a Box-rearranger `IoDesc` on `comm`, a communicator spanning both
/// compute and I/O ranks (ranks `0..num_iotasks` serve as I/O ranks).
///
/// Reference: spec.md §4.C "Box" bullets 1-4.
pub fn build_box_iodesc<C: GroupComm>(
    comm: &C,
    gdimlen: Vec<i64>,
    map: Vec<i64>,
    element_type: ElementType,
    num_iotasks: i32,
) -> IoDesc {
    let total = IoDesc::total_grid_size(&gdimlen);
    let (send_counts, send_index) = assign_send_counts(&map, num_iotasks, total);

    // Every rank reports, per I/O rank, how many elements it's sending;
    // the transpose of that table tells each I/O rank how many it receives
    // from every other rank.
    let my_rank = comm.rank();
    let size = comm.size();
    // send_counts is indexed by io rank 0..num_iotasks; pad to full size.
    let mut full_send = vec![0i32; size as usize];
    for (r, &c) in send_counts.iter().enumerate() {
        full_send[r] = c;
    }
    let recv_from_all = comm.all_to_all_i32(&full_send);

    let is_io_rank = my_rank < num_iotasks;
    let (recv_from, recv_counts): (Vec<i32>, Vec<i32>) = if is_io_rank {
        recv_from_all
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c > 0)
            .map(|(r, &c)| (r as i32, c))
            .unzip()
    } else {
        (vec![], vec![])
    };

    // Ship the packed global indices (1-based) to their owning I/O rank so
    // it can compute its own regions; compute ranks pack `map` by target in
    // `send_index` order first.
    let mut packed = vec![0i64; map.iter().filter(|&&m| m != 0).count()];
    for (i, &m) in map.iter().enumerate() {
        if m != 0 {
            packed[send_index[i] as usize] = m;
        }
    }
    let send_counts_full = {
        let mut v = vec![0i32; size as usize];
        for (r, &c) in send_counts.iter().enumerate() {
            v[r] = c;
        }
        v
    };
    let recv_counts_full = {
        let mut v = vec![0i32; size as usize];
        for (&r, &c) in recv_from.iter().zip(recv_counts.iter()) {
            v[r as usize] = c;
        }
        v
    };
    let recv_global0: Vec<i64> = comm.all_to_all_v_i64(&packed, &send_counts_full, &recv_counts_full);

    let local_len = recv_global0.len();
    let (local_map, recv_index) = sort_with_recv_index(&recv_global0);
    let regions = if is_io_rank { build_regions(&gdimlen, &local_map) } else { vec![] };

    let max_io_buflen = comm.all_reduce_max_i64(local_len as i64);
    let live_total = comm.all_reduce_sum_i64(map.iter().filter(|&&m| m != 0).count() as i64);
    let needs_fill = live_total != total;

    IoDesc {
        ndims: gdimlen.len(),
        gdimlen,
        map,
        element_type,
        rearranger: RearrangerKind::Box,
        send_counts,
        send_index,
        recv_from,
        recv_counts,
        recv_index,
        local_len,
        regions,
        send_type: vec![],
        recv_type: vec![],
        needs_fill,
        fill_regions: vec![],
        hole_grid_size: if needs_fill { total - live_total } else { 0 },
        max_io_buflen,
        max_bytes: max_io_buflen * element_type.size_bytes() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_bounds_even_split() {
        assert_eq!(block_bounds(0, 2, 8), (0, 4));
        assert_eq!(block_bounds(1, 2, 8), (4, 4));
    }

    #[test]
    fn test_block_bounds_remainder_goes_to_low_ranks() {
        assert_eq!(block_bounds(0, 3, 10), (0, 4));
        assert_eq!(block_bounds(1, 3, 10), (4, 3));
        assert_eq!(block_bounds(2, 3, 10), (7, 3));
    }

    #[test]
    fn test_target_io_rank() {
        assert_eq!(target_io_rank(0, 2, 8), 0);
        assert_eq!(target_io_rank(3, 2, 8), 0);
        assert_eq!(target_io_rank(4, 2, 8), 1);
        assert_eq!(target_io_rank(7, 2, 8), 1);
    }

    #[test]
    fn test_assign_send_counts_skips_holes() {
        let map = vec![1, 0, 5, 8];
        let (counts, index) = assign_send_counts(&map, 2, 8);
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(index[1], -1);
        assert_eq!(index[0], 0);
        assert!(index[2] >= 1 && index[3] >= 1 && index[2] != index[3]);
    }

    #[test]
    fn test_assign_send_counts_empty_map() {
        let map: Vec<i64> = vec![];
        let (counts, index) = assign_send_counts(&map, 3, 9);
        assert_eq!(counts, vec![0, 0, 0]);
        assert!(index.is_empty());
    }
}
