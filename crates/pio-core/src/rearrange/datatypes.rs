//! Datatype definition and the compute↔I/O exchange entry points
//! (component D, second half): pack a compute-rank buffer into the
//! I/O-rank-major layout `send_index`/`send_counts` describe, hand it to
//! [`swapm::exchange`], and unpack the result.
//!
//! Reference: spec.md §4.D.

use mpi::topology::SimpleCommunicator;

use crate::comm::FlowControlOpts;
use crate::error::PioError;
use crate::iodesc::IoDesc;
use crate::swapm::{self, ExchangePlan};

fn as_bytes<T>(data: &[T]) -> &[u8] {
    // SAFETY: `T` is one of the fixed-width element types in `ElementType`;
    // the resulting byte slice never outlives `data`.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

fn as_bytes_mut<T>(data: &mut [T]) -> &mut [u8] {
    // SAFETY: same as `as_bytes`.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data)) }
}

fn counts_and_displs(counts: &[i32], elem_size: usize) -> (Vec<i32>, Vec<i32>) {
    let byte_counts: Vec<i32> = counts.iter().map(|&c| c * elem_size as i32).collect();
    let mut displs = Vec::with_capacity(byte_counts.len());
    let mut running = 0i32;
    for &c in &byte_counts {
        displs.push(running);
        running += c;
    }
    (byte_counts, displs)
}

/// Pack `local_data` (one entry per `iodesc.map` slot, holes included) per
/// `send_index`, ship it to the owning I/O rank(s), and return this rank's
/// I/O-side packed buffer (`iodesc.local_len` entries; empty on compute-only
/// ranks).
///
/// Reference: spec.md §4.D "compute_to_io".
pub fn compute_to_io<T: Copy + Default>(
    comm: &SimpleCommunicator,
    iodesc: &IoDesc,
    local_data: &[T],
    opts: FlowControlOpts,
) -> Result<Vec<T>, PioError> {
    let elem_size = std::mem::size_of::<T>();
    let packed_len = iodesc.send_index.iter().filter(|&&i| i >= 0).count();
    let mut packed = vec![T::default(); packed_len];
    for (slot, &dest_pos) in iodesc.send_index.iter().enumerate() {
        if dest_pos >= 0 {
            packed[dest_pos as usize] = local_data[slot];
        }
    }

    let size = mpi::traits::Communicator::size(comm);
    let mut send_counts_full = vec![0i32; size as usize];
    for (r, &c) in iodesc.send_counts.iter().enumerate() {
        send_counts_full[r] = c;
    }
    let (send_byte_counts, send_byte_displs) = counts_and_displs(&send_counts_full, elem_size);

    let mut recv_counts_full = vec![0i32; size as usize];
    for (&r, &c) in iodesc.recv_from.iter().zip(iodesc.recv_counts.iter()) {
        recv_counts_full[r as usize] = c;
    }
    let (recv_byte_counts, recv_byte_displs) = counts_and_displs(&recv_counts_full, elem_size);

    let mut recv_data = vec![T::default(); iodesc.local_len];
    let dests: Vec<i32> = (0..size).collect();
    let sources: Vec<i32> = (0..size).collect();

    let plan = ExchangePlan {
        send_buf: as_bytes(&packed),
        dests: &dests,
        send_counts: &send_byte_counts,
        send_displs: &send_byte_displs,
        recv_buf: as_bytes_mut(&mut recv_data),
        sources: &sources,
        recv_counts: &recv_byte_counts,
        recv_displs: &recv_byte_displs,
    };
    swapm::exchange(comm, plan, opts)?;

    // Scatter into region order via recv_index.
    let mut ordered = vec![T::default(); iodesc.local_len];
    for (i, &dst) in iodesc.recv_index.iter().enumerate() {
        ordered[dst as usize] = recv_data[i];
    }
    Ok(ordered)
}

/// Inverse of [`compute_to_io`]: ship an I/O-side packed buffer back to the
/// compute ranks that contributed it, in `iodesc.map` order.
///
/// Reference: spec.md §4.D "io_to_compute".
pub fn io_to_compute<T: Copy + Default>(
    comm: &SimpleCommunicator,
    iodesc: &IoDesc,
    io_data: &[T],
    opts: FlowControlOpts,
) -> Result<Vec<T>, PioError> {
    let elem_size = std::mem::size_of::<T>();
    let size = mpi::traits::Communicator::size(comm);

    // Re-pack io_data back into recv_index order for transmission (inverse
    // of the scatter compute_to_io performs on arrival).
    let mut packed = vec![T::default(); io_data.len()];
    for (i, &src) in iodesc.recv_index.iter().enumerate() {
        packed[i] = io_data[src as usize];
    }

    let mut send_counts_full = vec![0i32; size as usize];
    for (&r, &c) in iodesc.recv_from.iter().zip(iodesc.recv_counts.iter()) {
        send_counts_full[r as usize] = c;
    }
    let (send_byte_counts, send_byte_displs) = counts_and_displs(&send_counts_full, elem_size);

    let mut recv_counts_full = vec![0i32; size as usize];
    for (r, &c) in iodesc.send_counts.iter().enumerate() {
        recv_counts_full[r] = c;
    }
    let (recv_byte_counts, recv_byte_displs) = counts_and_displs(&recv_counts_full, elem_size);

    let recv_len = iodesc.send_index.len();
    let mut recv_data = vec![T::default(); recv_len.max(iodesc.map.len())];
    let dests: Vec<i32> = (0..size).collect();
    let sources: Vec<i32> = (0..size).collect();

    let plan = ExchangePlan {
        send_buf: as_bytes(&packed),
        dests: &dests,
        send_counts: &send_byte_counts,
        send_displs: &send_byte_displs,
        recv_buf: as_bytes_mut(&mut recv_data),
        sources: &sources,
        recv_counts: &recv_byte_counts,
        recv_displs: &recv_byte_displs,
    };
    swapm::exchange(comm, plan, opts)?;

    let mut local_data = vec![T::default(); iodesc.map.len()];
    for (slot, &src_pos) in iodesc.send_index.iter().enumerate() {
        if src_pos >= 0 {
            local_data[slot] = recv_data[src_pos as usize];
        }
    }
    Ok(local_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_bytes_round_trip_length() {
        let data = [1.0f64, 2.0, 3.0];
        let bytes = as_bytes(&data);
        assert_eq!(bytes.len(), 24);
    }
}
