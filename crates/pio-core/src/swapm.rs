//! Flow-controlled many-to-many exchange (component E).
//!
//! Moves packed byte payloads between an arbitrary set of senders and
//! receivers under a [`FlowControlOpts`] policy: plain blocking
//! point-to-point by default (matching `init_rearr_opts`'s collective
//! default), or handshake/windowed-nonblocking when requested.
//!
//! Reference: spec.md §4.E; grounded on the flow-control handling in
//! `pio_rearrange.c` (`rearrange_comp2io`/`rearrange_io2comp` use the same
//! `max_pend_req`/handshake/isend knobs this module reads).

use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::comm::FlowControlOpts;
use crate::error::PioError;

/// One leg of the exchange: send `counts[i]` bytes to `dests[i]` starting
/// at `displs[i]` in `send_buf` (and symmetrically for the receive side).
pub struct ExchangePlan<'a> {
    pub send_buf: &'a [u8],
    pub dests: &'a [i32],
    pub send_counts: &'a [i32],
    pub send_displs: &'a [i32],

    pub recv_buf: &'a mut [u8],
    pub sources: &'a [i32],
    pub recv_counts: &'a [i32],
    pub recv_displs: &'a [i32],
}

/// Execute one exchange. With `opts.handshake`/`opts.isend` both false this
/// degenerates to a single collective all-to-all-v, which is the default
/// and the common case. Otherwise falls back to point-to-point sends under
/// an outstanding-request window of `opts.max_pend_req` (0 = unbounded).
///
/// Reference: spec.md §4.E steps 1-4, and the "at most `max_pend_req`
/// outstanding" invariant.
pub fn exchange(comm: &SimpleCommunicator, plan: ExchangePlan, opts: FlowControlOpts) -> Result<(), PioError> {
    if !opts.handshake && !opts.isend {
        return exchange_collective(comm, plan);
    }
    exchange_point_to_point(comm, plan, opts)
}

fn exchange_collective(comm: &SimpleCommunicator, plan: ExchangePlan) -> Result<(), PioError> {
    let send_partition = Partition::new(plan.send_buf, plan.send_counts, plan.send_displs);
    let mut recv_partition = PartitionMut::new(plan.recv_buf, plan.recv_counts, plan.recv_displs);
    comm.all_to_all_varcount_into(&send_partition, &mut recv_partition);
    let _ = (plan.dests, plan.sources);
    Ok(())
}

/// Point-to-point path used when handshake and/or windowed `isend` is
/// requested. Receives are posted first (optionally preceded by a
/// zero-byte handshake token back to the sender), then sends are issued in
/// windows of at most `max_pend_req` outstanding requests.
fn exchange_point_to_point(
    comm: &SimpleCommunicator,
    plan: ExchangePlan,
    opts: FlowControlOpts,
) -> Result<(), PioError> {
    mpi::request::scope(|scope| {
        let mut recv_reqs = Vec::with_capacity(plan.sources.len());
        let mut recv_slices: Vec<&mut [u8]> = Vec::new();
        let mut rest = &mut *plan.recv_buf;
        for &count in plan.recv_counts {
            let (head, tail) = rest.split_at_mut(count as usize);
            recv_slices.push(head);
            rest = tail;
        }

        for ((&src, &count), buf) in plan
            .sources
            .iter()
            .zip(plan.recv_counts.iter())
            .zip(recv_slices.iter_mut())
        {
            if opts.handshake {
                comm.process_at_rank(src).send(&[0u8; 0]);
            }
            let _ = count;
            let req = comm.process_at_rank(src).immediate_receive_into(scope, *buf);
            recv_reqs.push(req);
        }

        let window = if opts.max_pend_req == 0 {
            plan.dests.len().max(1)
        } else {
            opts.max_pend_req
        };
        let mut send_reqs = Vec::new();
        for (chunk_start, chunk) in plan.dests.chunks(window).enumerate() {
            for (i, &dest) in chunk.iter().enumerate() {
                let idx = chunk_start * window + i;
                let displ = plan.send_displs[idx] as usize;
                let count = plan.send_counts[idx] as usize;
                let slice = &plan.send_buf[displ..displ + count];
                if opts.handshake {
                    let mut ack = [0u8; 0];
                    comm.process_at_rank(dest).receive_into(&mut ack);
                }
                if opts.isend {
                    send_reqs.push(comm.process_at_rank(dest).immediate_send(scope, slice));
                } else {
                    comm.process_at_rank(dest).send(slice);
                }
            }
            for req in send_reqs.drain(..) {
                req.wait();
            }
        }

        for req in recv_reqs {
            req.wait();
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_opts_take_collective_path() {
        let opts = FlowControlOpts::default();
        assert!(!opts.handshake && !opts.isend);
    }
}
