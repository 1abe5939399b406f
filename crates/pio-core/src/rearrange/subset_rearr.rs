//! Subset rearranger: ranks are partitioned into `num_iotasks` contiguous
//! groups, each with exactly one I/O rank; every compute rank in a group
//! sends its whole local map to that one I/O rank.
//!
//! Reference: spec.md §4.C "Subset".

use crate::comm::GroupComm;
use crate::iodesc::{IoDesc, RearrangerKind};
use crate::rearrange::sort_with_recv_index;
use crate::region::build_regions;
use crate::typetag::ElementType;

/// Which I/O rank serves `rank`, partitioning `0..size` into `num_iotasks`
/// contiguous groups of near-equal size (low groups absorb the remainder).
/// The I/O rank of a group is its lowest member.
pub fn io_rank_for_rank(rank: i32, size: i32, num_iotasks: i32) -> i32 {
    let group = (rank as i64 * num_iotasks as i64 / size as i64) as i32;
    let n = num_iotasks as i64;
    let base = size as i64 / n;
    let rem = size as i64 % n;
    let group_start = if (group as i64) < rem {
        group as i64 * (base + 1)
    } else {
        rem * (base + 1) + (group as i64 - rem) * base
    };
    group_start as i32
}

/// Build a Subset-rearranger `IoDesc` on `comm`.
///
/// Reference: spec.md §4.C "Subset" bullets 1-3.
pub fn build_subset_iodesc<C: GroupComm>(
    comm: &C,
    gdimlen: Vec<i64>,
    map: Vec<i64>,
    element_type: ElementType,
    num_iotasks: i32,
) -> IoDesc {
    let size = comm.size();
    let my_rank = comm.rank();
    let my_io_rank = io_rank_for_rank(my_rank, size, num_iotasks);

    let live: Vec<i64> = map.iter().copied().filter(|&m| m != 0).collect();
    let send_index: Vec<i32> = {
        let mut cursor = 0i32;
        map.iter()
            .map(|&m| {
                if m == 0 {
                    -1
                } else {
                    let v = cursor;
                    cursor += 1;
                    v
                }
            })
            .collect()
    };

    let mut send_counts_full = vec![0i32; size as usize];
    send_counts_full[my_io_rank as usize] = live.len() as i32;
    let recv_from_all = comm.all_to_all_i32(&send_counts_full);

    // This rank is the I/O rank of its own group iff it's its group's
    // lowest member, i.e. `io_rank_for_rank` maps it to itself.
    let is_io_rank = my_io_rank == my_rank;

    let (recv_from, recv_counts): (Vec<i32>, Vec<i32>) = recv_from_all
        .iter()
        .enumerate()
        .filter(|&(_, &c)| c > 0)
        .map(|(r, &c)| (r as i32, c))
        .unzip();

    let recv_counts_full = {
        let mut v = vec![0i32; size as usize];
        for (&r, &c) in recv_from.iter().zip(recv_counts.iter()) {
            v[r as usize] = c;
        }
        v
    };
    let recv_global0: Vec<i64> = comm.all_to_all_v_i64(&live, &send_counts_full, &recv_counts_full);

    let local_len = recv_global0.len();
    let (local_map, recv_index) = sort_with_recv_index(&recv_global0);
    let regions = if is_io_rank { build_regions(&gdimlen, &local_map) } else { vec![] };

    let total = IoDesc::total_grid_size(&gdimlen);
    let max_io_buflen = comm.all_reduce_max_i64(local_len as i64);
    let live_total = comm.all_reduce_sum_i64(live.len() as i64);
    let needs_fill = live_total != total;

    IoDesc {
        ndims: gdimlen.len(),
        gdimlen,
        map,
        element_type,
        rearranger: RearrangerKind::Subset,
        send_counts: vec![live.len() as i32],
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
    fn test_io_rank_for_rank_even_groups() {
        // 8 ranks, 2 io tasks -> groups [0..4), [4..8), io ranks 0 and 4.
        for r in 0..4 {
            assert_eq!(io_rank_for_rank(r, 8, 2), 0);
        }
        for r in 4..8 {
            assert_eq!(io_rank_for_rank(r, 8, 2), 4);
        }
    }

    #[test]
    fn test_io_rank_for_rank_remainder_groups() {
        // 10 ranks, 3 io tasks -> groups of size 4,3,3 -> io ranks 0,4,7.
        for r in 0..4 {
            assert_eq!(io_rank_for_rank(r, 10, 3), 0);
        }
        for r in 4..7 {
            assert_eq!(io_rank_for_rank(r, 10, 3), 4);
        }
        for r in 7..10 {
            assert_eq!(io_rank_for_rank(r, 10, 3), 7);
        }
    }

    #[test]
    fn test_io_rank_one_iotask_is_rank_zero() {
        for r in 0..6 {
            assert_eq!(io_rank_for_rank(r, 6, 1), 0);
        }
    }
}
