//! Group-communication façade (component A).
//!
//! Thin adapters over the `mpi` crate (rsmpi). Any substrate call returning
//! a non-success code is converted to [`PioError`] at this boundary; no
//! substrate return code leaks above this layer. Reference: spec.md §4.A.

use mpi::collective::SystemOperation;
use mpi::datatype::UserDatatype;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use crate::error::PioError;

/// A derived datatype handle, committed once and freed once (§4.D, §9
/// "Derived datatype lifetime").
pub struct DerivedType {
    pub(crate) datatype: UserDatatype,
}

impl DerivedType {
    /// Indexed-block constructor: `n` blocks of fixed `blocklength`, at the
    /// given element displacements into a base type of `elem_size` bytes.
    ///
    /// Reference: spec.md §4.A "indexed-block constructor".
    pub fn indexed_block(blocklength: i32, displacements: &[i32]) -> Self {
        let datatype = UserDatatype::indexed_block(blocklength, displacements);
        DerivedType { datatype }
    }

    /// Strided-vector constructor: replicate a datatype `count` times at a
    /// fixed byte stride.
    ///
    /// Reference: spec.md §4.A "strided-vector constructor".
    pub fn vector(count: i32, blocklength: i32, stride: i32) -> Self {
        let datatype = UserDatatype::vector(count, blocklength, stride);
        DerivedType { datatype }
    }
}

/// Flow-control knobs for one direction of an exchange (§4.E).
#[derive(Debug, Clone, Copy)]
pub struct FlowControlOpts {
    /// Receiver pre-sends a zero-byte token before the sender transmits.
    pub handshake: bool,
    /// Use nonblocking sends (`isend`) instead of blocking sends.
    pub isend: bool,
    /// Max outstanding nonblocking sends per rank (0 = unlimited).
    pub max_pend_req: usize,
}

impl Default for FlowControlOpts {
    /// Matches `init_rearr_opts`'s default: disable handshake/isend,
    /// `max_pend_req = 0` (no throttling) — i.e. collective, no flow control.
    fn default() -> Self {
        FlowControlOpts {
            handshake: false,
            isend: false,
            max_pend_req: 0,
        }
    }
}

/// Façade over the collective/point-to-point/group operations the rest of
/// the library needs. A trait so unit tests can substitute a fake; the
/// `mpi`-backed impl lives on [`SimpleCommunicator`] directly via the free
/// functions below (rsmpi's `Communicator` trait already gives us most of
/// this, so the façade is mostly a namespace + error-mapping layer rather
/// than a from-scratch reimplementation).
pub trait GroupComm {
    fn rank(&self) -> i32;
    fn size(&self) -> i32;
    fn barrier(&self);
    fn broadcast_i32(&self, root: i32, value: &mut i32);
    fn all_reduce_sum_i64(&self, local: i64) -> i64;
    fn all_reduce_max_i64(&self, local: i64) -> i64;
    fn all_reduce_min_i64(&self, local: i64) -> i64;
    fn all_reduce_max_usize(&self, local: usize) -> usize;
    /// Equal-count all-to-all: rank `r` sends `send[r]` to rank `r` and
    /// receives the analogous entry from every other rank.
    fn all_to_all_i32(&self, send: &[i32]) -> Vec<i32>;
    /// Variable-count all-to-all-v of `i64` payloads, used to ship packed
    /// global indices between compute and I/O ranks (§4.D, §4.E).
    fn all_to_all_v_i64(&self, send: &[i64], send_counts: &[i32], recv_counts: &[i32]) -> Vec<i64>;
}

impl GroupComm for SimpleCommunicator {
    fn rank(&self) -> i32 {
        Communicator::rank(self)
    }

    fn size(&self) -> i32 {
        Communicator::size(self)
    }

    fn barrier(&self) {
        Communicator::barrier(self);
    }

    fn broadcast_i32(&self, root: i32, value: &mut i32) {
        self.process_at_rank(root).broadcast_into(value);
    }

    fn all_reduce_sum_i64(&self, local: i64) -> i64 {
        let mut global = 0i64;
        self.all_reduce_into(&local, &mut global, SystemOperation::sum());
        global
    }

    fn all_reduce_max_i64(&self, local: i64) -> i64 {
        let mut global = 0i64;
        self.all_reduce_into(&local, &mut global, SystemOperation::max());
        global
    }

    fn all_reduce_min_i64(&self, local: i64) -> i64 {
        let mut global = i64::MAX;
        self.all_reduce_into(&local, &mut global, SystemOperation::min());
        global
    }

    fn all_reduce_max_usize(&self, local: usize) -> usize {
        let local = local as i64;
        let mut global = 0i64;
        self.all_reduce_into(&local, &mut global, SystemOperation::max());
        global as usize
    }

    fn all_to_all_i32(&self, send: &[i32]) -> Vec<i32> {
        let mut recv = vec![0i32; send.len()];
        self.all_to_all_into(send, &mut recv);
        recv
    }

    fn all_to_all_v_i64(&self, send: &[i64], send_counts: &[i32], recv_counts: &[i32]) -> Vec<i64> {
        let send_displs = prefix_sums(send_counts);
        let recv_displs = prefix_sums(recv_counts);
        let total_recv: i32 = recv_counts.iter().sum();
        let mut recv = vec![0i64; total_recv as usize];

        let send_partition = mpi::datatype::Partition::new(send, send_counts, &send_displs[..]);
        let mut recv_partition =
            mpi::datatype::PartitionMut::new(&mut recv[..], recv_counts, &recv_displs[..]);
        self.all_to_all_varcount_into(&send_partition, &mut recv_partition);
        recv
    }
}

fn prefix_sums(counts: &[i32]) -> Vec<i32> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut running = 0i32;
    for &c in counts {
        displs.push(running);
        running += c;
    }
    displs
}

/// Build a sub-communicator from `parent` by coloring each rank, mirroring
/// the Subset rearranger's `(comp_rank mod ratio)`-keyed split (§4.C).
/// A rank passing `color = None` does not participate in the resulting
/// communicator.
pub fn split_by_color(parent: &SimpleCommunicator, color: Option<i32>) -> Option<SimpleCommunicator> {
    let mpi_color = match color {
        Some(c) => Color::with_value(c),
        None => Color::undefined(),
    };
    parent.split_by_color(mpi_color)
}

/// Map an MPI-level failure (represented here as a nonzero raw code,
/// since rsmpi surfaces most failures as panics/aborts rather than
/// recoverable `Result`s) to the generic I/O error, per spec.md §7
/// "Substrate ... mapped to EIO at the façade".
pub fn map_substrate_error(raw_code: i32) -> PioError {
    if raw_code == 0 {
        PioError::NoErr
    } else {
        PioError::Io(raw_code)
    }
}
