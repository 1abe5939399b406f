//! Async I/O-rank message loop (component H).
//!
//! When an `IoSystem` is initialized in asynchronous mode, I/O ranks never
//! return from `init_async`: they sit in this loop, each iteration
//! receiving exactly one opcode broadcast from the compute side, running
//! the matching handler, and replying, until a compute rank sends `Exit`
//! for every still-open component.
//!
//! Reference: spec.md §4.H; opcode set grounded on the handler table in
//! `examples/original_source/src/clib/pio_msg.c` (`create_file_handler`,
//! `inq_type_handler`, `inq_format_handler`, ...).

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::comm::GroupComm;

/// Every message an async `IoSystem` can dispatch. Reference: spec.md §4.H,
/// `pio_msg.c`'s handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PioOpcode {
    CreateFile = 0,
    OpenFile = 1,
    CloseFile = 2,
    DeleteFile = 3,
    InqType = 4,
    InqFormat = 5,
    InqVar = 6,
    InqDim = 7,
    DefDim = 8,
    DefVar = 9,
    PutVar = 10,
    PutVara = 11,
    PutVars = 12,
    GetVar = 13,
    GetVars = 14,
    GetVara = 15,
    WriteDarray = 16,
    ReadDarray = 17,
    InitDecomp = 18,
    FreeDecomp = 19,
    SetFillValue = 20,
    Sync = 21,
    Exit = 22,
}

impl PioOpcode {
    pub fn from_i32(tag: i32) -> Option<Self> {
        use PioOpcode::*;
        let all = [
            CreateFile, OpenFile, CloseFile, DeleteFile, InqType, InqFormat, InqVar, InqDim, DefDim, DefVar, PutVar,
            PutVara, PutVars, GetVar, GetVars, GetVara, WriteDarray, ReadDarray, InitDecomp, FreeDecomp, SetFillValue,
            Sync, Exit,
        ];
        all.into_iter().find(|op| *op as i32 == tag)
    }
}

/// Where one I/O rank sits within an iteration of the message loop.
///
/// Reference: spec.md §4.H "Idle -> Waiting -> Dispatching -> Responding -> Idle".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Waiting,
    Dispatching,
    Responding,
}

/// Pure state transition for one message-loop step, given the opcode that
/// arrived while `Waiting` (or `None` before anything has arrived).
///
/// Reference: spec.md §4.H state diagram.
pub fn next_state(current: LoopState, opcode: Option<PioOpcode>) -> LoopState {
    match (current, opcode) {
        (LoopState::Idle, _) => LoopState::Waiting,
        (LoopState::Waiting, Some(_)) => LoopState::Dispatching,
        (LoopState::Waiting, None) => LoopState::Waiting,
        (LoopState::Dispatching, _) => LoopState::Responding,
        (LoopState::Responding, _) => LoopState::Idle,
    }
}

/// Drives the message loop on one I/O rank. `root` is the compute rank
/// that broadcasts opcodes; `handler` runs the side effects for a given
/// opcode and returns whether the enclosing `IoSystem` should keep running
/// (it returns `false` only after the last open component has sent `Exit`).
///
/// Reference: spec.md §4.H bullets 1-4; "one opcode per async call".
pub fn run_message_loop<C, F>(comm: &C, root: i32, mut handler: F)
where
    C: GroupComm,
    F: FnMut(PioOpcode) -> bool,
{
    let mut state = LoopState::Idle;
    loop {
        state = next_state(state, None);
        let mut tag = PioOpcode::Exit as i32;
        comm.broadcast_i32(root, &mut tag);
        let opcode = match PioOpcode::from_i32(tag) {
            Some(op) => op,
            None => break,
        };
        state = next_state(state, Some(opcode));
        let keep_running = handler(opcode);
        state = next_state(state, Some(opcode));
        state = next_state(state, Some(opcode));
        if !keep_running || opcode == PioOpcode::Exit {
            break;
        }
    }
}

/// Drives the message loop on one I/O rank when it services more than one
/// compute component group. Unlike [`run_message_loop`]'s single collective
/// broadcast, each component talks to the I/O ranks over its own
/// point-to-point channel (`component_roots[c]` is the rank on `io_comm`
/// that speaks for component `c`); one nonblocking receive is posted per
/// component and the loop dispatches whichever completes first, re-posting
/// that component's receive unless it just sent `Exit`. `handler` receives
/// the index of the component the opcode came from.
///
/// Reference: spec.md §4.H "servicing one or more compute component
/// groups" — "post one nonblocking receive per compute component... wait-
/// any across the posted receives... the returned index selects the
/// originating component".
pub fn run_message_loop_multi<F>(io_comm: &SimpleCommunicator, component_roots: &[i32], mut handler: F)
where
    F: FnMut(usize, PioOpcode) -> bool,
{
    let ncomponents = component_roots.len();
    let mut open = OpenComponents(ncomponents as u32);
    let mut tags = vec![0i32; ncomponents];

    mpi::request::scope(|scope| {
        let mut pending: Vec<_> = component_roots
            .iter()
            .zip(tags.iter_mut())
            .map(|(&root, tag)| {
                Some(io_comm.process_at_rank(root).immediate_receive_into(scope, std::slice::from_mut(tag)))
            })
            .collect();

        loop {
            // Wait-any: poll every still-pending component's receive until
            // exactly one of them has a message ready.
            let ready = loop {
                let mut found = None;
                for (i, slot) in pending.iter_mut().enumerate() {
                    if slot.is_none() {
                        continue;
                    }
                    let req = slot.take().unwrap();
                    match req.test() {
                        Ok(_status) => {
                            found = Some(i);
                            break;
                        }
                        Err(req) => *slot = Some(req),
                    }
                }
                if let Some(i) = found {
                    break i;
                }
                if pending.iter().all(Option::is_none) {
                    return;
                }
            };

            let opcode = match PioOpcode::from_i32(tags[ready]) {
                Some(op) => op,
                None => return,
            };
            let keep_running = handler(ready, opcode);

            if opcode == PioOpcode::Exit {
                if open.close_one() {
                    return;
                }
                // This component is done; its slot stays `None` forever.
            } else if keep_running {
                pending[ready] = Some(
                    io_comm
                        .process_at_rank(component_roots[ready])
                        .immediate_receive_into(scope, std::slice::from_mut(&mut tags[ready])),
                );
            } else {
                return;
            }
        }
    });
}

/// Tracks how many `IoSystem`/`File` components are still open on the I/O
/// side; the loop only truly exits once this reaches zero, since several
/// compute-side components can share one set of I/O ranks.
///
/// Reference: spec.md §4.H "open-components counter".
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenComponents(pub u32);

impl OpenComponents {
    pub fn open_one(&mut self) {
        self.0 += 1;
    }

    /// Returns true once every open component has sent `Exit` and the loop
    /// may terminate.
    pub fn close_one(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trips_through_i32() {
        for tag in 0..=22 {
            let op = PioOpcode::from_i32(tag).unwrap();
            assert_eq!(op as i32, tag);
        }
        assert!(PioOpcode::from_i32(99).is_none());
    }

    #[test]
    fn test_state_cycle() {
        let s = LoopState::Idle;
        let s = next_state(s, None);
        assert_eq!(s, LoopState::Waiting);
        let s = next_state(s, Some(PioOpcode::PutVar));
        assert_eq!(s, LoopState::Dispatching);
        let s = next_state(s, Some(PioOpcode::PutVar));
        assert_eq!(s, LoopState::Responding);
        let s = next_state(s, Some(PioOpcode::PutVar));
        assert_eq!(s, LoopState::Idle);
    }

    #[test]
    fn test_waiting_with_no_opcode_stays_waiting() {
        assert_eq!(next_state(LoopState::Waiting, None), LoopState::Waiting);
    }

    #[test]
    fn test_open_components_closes_at_zero() {
        let mut open = OpenComponents::default();
        open.open_one();
        open.open_one();
        assert!(!open.close_one());
        assert!(open.close_one());
    }
}
