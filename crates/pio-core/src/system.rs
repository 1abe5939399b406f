//! `IoSystem`/`File` state and the public caller-facing API (spec.md §6).
//!
//! Ties together the registry (component I), the rearranger (component D),
//! the write-request buffer (component F), the dispatcher (component G),
//! the async message loop (component H), and the error policy (component J)
//! into the entry points a caller actually uses. Every public entry point
//! threads its result through `error_policy` before returning (§4.J).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use mpi::topology::SimpleCommunicator;

use crate::async_loop::{self, PioOpcode};
use crate::comm::{split_by_color, GroupComm};
use crate::decomp_file::{self, DecompFile};
use crate::dispatch::{self, DispatchPath, RecordAxis, RegionPayload};
use crate::driver::{ArrayFileDriver, DriverToken, OpenMode, VarMeta};
use crate::error::{ErrorPolicy, PioError};
use crate::iodesc::{IoDesc, RearrangerKind};
use crate::rearrange::{self, RearrOpts};
use crate::registry::Registry;
use crate::typetag::ElementType;
use crate::write_buffer::WriteRequestBuffer;

/// One open file: its driver-assigned id, its driver, and the per-file
/// buffering/record-axis state the dispatcher needs.
///
/// Reference: spec.md §3 "File".
pub struct File {
    pub path: String,
    pub ncid: i32,
    pub driver: Arc<dyn ArrayFileDriver>,
    pub write_buffer: WriteRequestBuffer,
    pub record_axes: HashMap<i32, RecordAxis>,
}

impl File {
    fn record_axis_for(&mut self, varid: i32) -> &mut RecordAxis {
        self.record_axes.entry(varid).or_default()
    }
}

/// The top-level handle a caller holds: one communicator split, its
/// rearranger/flow-control/error-policy configuration, and every
/// `IoDesc`/`File` it currently owns.
///
/// Reference: spec.md §3 "IoSystem", §6 "init_intracomm"/"init_async".
pub struct IoSystem {
    pub comm: SimpleCommunicator,
    pub io_comm: Option<SimpleCommunicator>,
    pub num_iotasks: i32,
    /// The explicit set of ranks (within `comm`) serving as I/O ranks.
    /// `init_intracomm` and single-component `init_async` both populate
    /// this as `0..num_iotasks`; a caller wiring up several compute
    /// components may pass an arbitrary subset.
    pub io_rank_list: Vec<i32>,
    /// Async mode only: the rank (within `io_comm`) that represents each
    /// compute component the I/O ranks service. Empty outside async mode.
    pub component_roots: Vec<i32>,
    pub rearr_opts: RearrOpts,
    pub error_policy: ErrorPolicy,
    pub async_mode: bool,
    decomps: Registry<IoDesc>,
    files: Registry<File>,
}

impl IoSystem {
    /// `init_intracomm`: every rank in `comm` is both a compute and
    /// (potentially) an I/O rank; the first `num_iotasks` ranks serve I/O.
    ///
    /// Reference: spec.md §6 "init_intracomm".
    pub fn init_intracomm(comm: SimpleCommunicator, num_iotasks: i32) -> Self {
        use mpi::traits::Communicator;
        let my_rank = comm.rank();
        let io_comm = split_by_color(&comm, if my_rank < num_iotasks { Some(0) } else { None });
        IoSystem {
            comm,
            io_comm,
            num_iotasks,
            io_rank_list: (0..num_iotasks).collect(),
            component_roots: Vec::new(),
            rearr_opts: RearrOpts::default(),
            error_policy: ErrorPolicy::default(),
            async_mode: false,
            decomps: Registry::new(),
            files: Registry::new(),
        }
    }

    /// `init_async`: dedicate `io_rank_list` to I/O duty, duplicating a
    /// communicator spanning just those ranks so the message loop's
    /// point-to-point traffic never aliases with collective calls issued on
    /// `comm`. `component_roots` names, for each compute component this
    /// pool services, the rank on the duplicated I/O communicator that
    /// speaks for it; I/O ranks never return from [`Self::run_io_loop`]
    /// until every component has sent `Exit`.
    ///
    /// Reference: spec.md §6 "init_async", §4.H "servicing one or more
    /// compute component groups".
    pub fn init_async(comm: SimpleCommunicator, io_rank_list: Vec<i32>, component_roots: Vec<i32>) -> Self {
        use mpi::traits::Communicator;
        let my_rank = comm.rank();
        let is_io_rank = io_rank_list.contains(&my_rank);
        let io_comm = split_by_color(&comm, if is_io_rank { Some(0) } else { None });
        let num_iotasks = io_rank_list.len() as i32;
        IoSystem {
            comm,
            io_comm,
            num_iotasks,
            io_rank_list,
            component_roots,
            rearr_opts: RearrOpts::default(),
            error_policy: ErrorPolicy::default(),
            async_mode: true,
            decomps: Registry::new(),
            files: Registry::new(),
        }
    }

    /// Run the async I/O-rank message loop (component H). A no-op on
    /// compute-only ranks (`io_comm` is `None` there); on an I/O rank it
    /// never returns until every component in `component_roots` has sent
    /// `Exit`. `handler` receives the index into `component_roots` the
    /// opcode arrived from.
    ///
    /// Reference: spec.md §4.H.
    pub fn run_io_loop(&self, handler: impl FnMut(usize, PioOpcode) -> bool) {
        if let Some(io_comm) = &self.io_comm {
            async_loop::run_message_loop_multi(io_comm, &self.component_roots, handler);
        }
    }

    /// `finalize`: release every remaining decomposition and file. Callers
    /// are expected to have already closed files; any still open are closed
    /// here defensively.
    ///
    /// Reference: spec.md §6 "finalize".
    pub fn finalize(&mut self) -> Result<(), PioError> {
        let result = (|| {
            for file_id in self.files.ids() {
                self.close_inner(file_id)?;
            }
            for decomp_id in self.decomps.ids() {
                self.decomps.remove(decomp_id)?;
            }
            Ok(())
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `init_decomp`: build an `IoDesc` for one logical array shape under
    /// this rank's local `map`, using `rearranger`.
    ///
    /// Reference: spec.md §6 "init_decomp", §4.C.
    pub fn init_decomp(
        &mut self,
        gdimlen: Vec<i64>,
        map: Vec<i64>,
        element_type: ElementType,
        rearranger: RearrangerKind,
    ) -> Result<i32, PioError> {
        let result = Ok(match rearranger {
            RearrangerKind::Box => {
                rearrange::build_box_iodesc(&self.comm, gdimlen, map, element_type, self.num_iotasks)
            }
            RearrangerKind::Subset => {
                rearrange::build_subset_iodesc(&self.comm, gdimlen, map, element_type, self.num_iotasks)
            }
        })
        .map(|iodesc| self.decomps.insert(iodesc));
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `free_decomp`: release a decomposition. Reference: spec.md §6.
    pub fn free_decomp(&mut self, decomp_id: i32) -> Result<(), PioError> {
        let result = self.decomps.remove(decomp_id).map(|_| ());
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `write_decomp`: persist a decomposition's global shape and every
    /// task's map to an ASCII file. Reference: spec.md §6.
    pub fn write_decomp(&self, path: &Path, decomp_id: i32, all_task_maps: &[Vec<i64>]) -> Result<(), PioError> {
        let result = (|| {
            let iodesc = self.decomps.get(decomp_id)?;
            decomp_file::write_decomp_file(path, &iodesc.gdimlen, all_task_maps).map_err(|_| PioError::Io(-1))
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `read_decomp`: reconstruct an `IoDesc` from a previously written
    /// decomposition file, using this rank's slot in the stored map table
    /// (or an empty map, per spec.md §9, if this run has more ranks than
    /// the file has stored maps).
    ///
    /// Reference: spec.md §6 "read_decomp".
    pub fn read_decomp(
        &mut self,
        path: &Path,
        element_type: ElementType,
        rearranger: RearrangerKind,
    ) -> Result<i32, PioError> {
        use mpi::traits::Communicator;
        let result = (|| {
            let file: DecompFile = decomp_file::read_decomp_file(path).map_err(|_| PioError::Io(-1))?;
            let my_rank = self.comm.rank();
            let num_ranks_now = self.comm.size();
            let map = decomp_file::map_for_rank(&file, my_rank, num_ranks_now);
            let iodesc = match rearranger {
                RearrangerKind::Box => {
                    rearrange::build_box_iodesc(&self.comm, file.gdimlen, map, element_type, self.num_iotasks)
                }
                RearrangerKind::Subset => {
                    rearrange::build_subset_iodesc(&self.comm, file.gdimlen, map, element_type, self.num_iotasks)
                }
            };
            Ok(self.decomps.insert(iodesc))
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `create`: collectively create a new file through `driver`, register
    /// it, and return its caller-visible id.
    ///
    /// Reference: spec.md §6 "create".
    pub fn create(&mut self, driver: Arc<dyn ArrayFileDriver>, path: &str, mode: OpenMode) -> Result<i32, PioError> {
        let result = (|| {
            let ncid = driver.create(path, mode)?;
            Ok(self.files.insert(File {
                path: path.to_string(),
                ncid,
                driver,
                write_buffer: WriteRequestBuffer::new(ncid, 0),
                record_axes: HashMap::new(),
            }))
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `open`: collectively open an existing file. Reference: spec.md §6.
    pub fn open(&mut self, driver: Arc<dyn ArrayFileDriver>, path: &str, mode: OpenMode) -> Result<i32, PioError> {
        let result = (|| {
            let ncid = driver.open(path, mode)?;
            Ok(self.files.insert(File {
                path: path.to_string(),
                ncid,
                driver,
                write_buffer: WriteRequestBuffer::new(ncid, 0),
                record_axes: HashMap::new(),
            }))
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `close`: flush any buffered writes, then close and deregister.
    /// Reference: spec.md §6 "close".
    pub fn close(&mut self, file_id: i32) -> Result<(), PioError> {
        let result = self.close_inner(file_id);
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    fn close_inner(&mut self, file_id: i32) -> Result<(), PioError> {
        {
            let file = self.files.get_mut(file_id)?;
            file.write_buffer.flush(file.driver.as_ref(), true)?;
            file.driver.close(file.ncid)?;
        }
        self.files.remove(file_id).map(|_| ())
    }

    /// `delete`: remove a file from the backing store (must not be open).
    /// Reference: spec.md §6 "delete".
    pub fn delete(&self, driver: &dyn ArrayFileDriver, path: &str) -> Result<(), PioError> {
        let result = driver.delete(path);
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// One-shot, non-decomposed strided put. Reference: spec.md §6
    /// "put_var"/"put_vara"/"put_vars".
    pub fn put_vars(
        &self,
        file_id: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        elem_type: ElementType,
        buf: &[u8],
    ) -> Result<(), PioError> {
        let result = (|| {
            let file = self.files.get(file_id)?;
            crate::typetag::typed_put(
                file.driver.as_ref(),
                file.ncid,
                varid,
                start,
                count,
                &crate::typetag::Stride(Some(stride.to_vec())),
                elem_type,
                buf,
            )
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// Mirrors [`Self::put_vars`] for reads. Reference: spec.md §6 "get_var*".
    pub fn get_vars(
        &self,
        file_id: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        elem_type: ElementType,
        buf: &mut [u8],
    ) -> Result<(), PioError> {
        let result = (|| {
            let file = self.files.get(file_id)?;
            crate::typetag::typed_get(
                file.driver.as_ref(),
                file.ncid,
                varid,
                start,
                count,
                &crate::typetag::Stride(Some(stride.to_vec())),
                elem_type,
                buf,
            )
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `write_darray`: rearrange `local_data` from compute layout to I/O
    /// layout via `decomp_id`'s `IoDesc`, then dispatch it per
    /// `driver.wire_format()`: a chunked-parallel file accumulates in the
    /// write-request buffer until its byte budget trips; every other
    /// format writes immediately through the dispatcher, which funnels
    /// through I/O rank 0 for serial formats.
    ///
    /// Reference: spec.md §6 "write_darray", §4.D, §4.F, §4.G.
    pub fn write_darray<T: Copy + Default>(
        &mut self,
        file_id: i32,
        varid: i32,
        decomp_id: i32,
        local_data: &[T],
    ) -> Result<(), PioError> {
        let result = (|| {
            let elem_size = std::mem::size_of::<T>();
            let iodesc = self.decomps.get(decomp_id)?;
            let io_side: Vec<T> = rearrange::compute_to_io(&self.comm, iodesc, local_data, self.rearr_opts.comp2io)?;

            let io_comm = match &self.io_comm {
                Some(c) => c,
                None => return Ok(()),
            };

            let file = self.files.get_mut(file_id)?;
            let var = file.driver.inq_var(file.ncid, varid)?;
            let record = if var.unlimited_dim.is_some() {
                Some(file.record_axis_for(varid).advance())
            } else {
                None
            };

            let region_bytes: Vec<&[T]> = iodesc
                .regions
                .iter()
                .map(|region| {
                    let n = region.num_elements() as usize;
                    let offset = region.local_offset as usize;
                    &io_side[offset..offset + n]
                })
                .collect();

            match dispatch::path_for(file.driver.wire_format()) {
                DispatchPath::BufferedChunked => {
                    let mut starts = Vec::with_capacity(iodesc.regions.len());
                    let mut counts = Vec::with_capacity(iodesc.regions.len());
                    let mut bytes = Vec::with_capacity(io_side.len() * elem_size);
                    for (region, slice) in iodesc.regions.iter().zip(region_bytes.iter()) {
                        let (start, count) = match record {
                            Some(r) => dispatch::apply_record_axis(&var, r, &region.start, &region.count),
                            None => (region.start.clone(), region.count.clone()),
                        };
                        starts.push(start);
                        counts.push(count);
                        // SAFETY: `T` is a fixed-width element type; bytes never outlive this call.
                        let slice_bytes = unsafe {
                            std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * elem_size)
                        };
                        bytes.extend_from_slice(slice_bytes);
                    }
                    file.write_buffer.add(file.driver.as_ref(), io_comm, varid, starts, counts, bytes, elem_size)
                }
                DispatchPath::DirectParallel | DispatchPath::SerialFunnel => {
                    let payload_bytes: Vec<Vec<u8>> = region_bytes
                        .iter()
                        .map(|slice| {
                            // SAFETY: same as above.
                            let slice_bytes = unsafe {
                                std::slice::from_raw_parts(slice.as_ptr() as *const u8, slice.len() * elem_size)
                            };
                            slice_bytes.to_vec()
                        })
                        .collect();
                    let payloads: Vec<RegionPayload> = iodesc
                        .regions
                        .iter()
                        .zip(payload_bytes.iter())
                        .map(|(region, buf)| RegionPayload { region, buf })
                        .collect();
                    dispatch::dispatch_write(file.driver.as_ref(), io_comm, file.ncid, varid, &var, record, &payloads)
                }
            }
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    /// `write_darray_multi`: write several variables that share one
    /// decomposition in a single buffered batch.
    ///
    /// Reference: spec.md §6 "write_darray_multi", §9 "nreqs" resolution —
    /// each variable advances the write-request count by exactly one entry
    /// per region, consistent with a single `write_darray` call.
    pub fn write_darray_multi<T: Copy + Default>(
        &mut self,
        file_id: i32,
        varids: &[i32],
        decomp_id: i32,
        local_data: &[Vec<T>],
    ) -> Result<(), PioError> {
        for (&varid, data) in varids.iter().zip(local_data.iter()) {
            self.write_darray(file_id, varid, decomp_id, data)?;
        }
        Ok(())
    }

    /// `read_darray`: the inverse of [`Self::write_darray`] — read each of
    /// this decomposition's regions from the driver (via the dispatcher, so
    /// serial formats funnel through I/O rank 0 exactly as writes do), then
    /// rearrange from I/O layout back to compute layout. `record` selects
    /// which record-axis slice to read for record variables; ignored for
    /// fixed (non-record) variables.
    ///
    /// Reference: spec.md §6 "read_darray".
    pub fn read_darray<T: Copy + Default>(
        &mut self,
        file_id: i32,
        varid: i32,
        decomp_id: i32,
        record: Option<i64>,
    ) -> Result<Vec<T>, PioError> {
        let result = (|| {
            let elem_size = std::mem::size_of::<T>();
            let iodesc = self.decomps.get(decomp_id)?;
            let mut io_side = vec![T::default(); iodesc.local_len];

            if let Some(io_comm) = &self.io_comm {
                let file = self.files.get(file_id)?;
                let var = file.driver.inq_var(file.ncid, varid)?;
                let region_bytes = dispatch::dispatch_read(
                    file.driver.as_ref(),
                    io_comm,
                    file.ncid,
                    varid,
                    &var,
                    record,
                    &iodesc.regions,
                    elem_size,
                )?;
                for (region, bytes) in iodesc.regions.iter().zip(region_bytes.iter()) {
                    let n = region.num_elements() as usize;
                    let offset = region.local_offset as usize;
                    // SAFETY: `bytes.len() == n * size_of::<T>()`.
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(io_side[offset..offset + n].as_mut_ptr() as *mut u8, n * elem_size)
                    };
                    dst.copy_from_slice(bytes);
                }
            }

            rearrange::io_to_compute(&self.comm, iodesc, &io_side, self.rearr_opts.io2comp)
        })();
        apply_error_policy(self.error_policy, &self.comm, result)
    }

    pub fn decomp(&self, decomp_id: i32) -> Result<&IoDesc, PioError> {
        self.decomps.get(decomp_id)
    }

    pub fn file(&self, file_id: i32) -> Result<&File, PioError> {
        self.files.get(file_id)
    }
}

/// Thread a locally-computed result through `policy` at a public-entry
/// boundary, per spec.md §4.J. Collective calls are assumed symmetric: a
/// rank only sees the policy resolve to success if every rank's local
/// result was `Ok`, so the success value recovered here is always the
/// one this rank itself produced.
fn apply_error_policy<T>(policy: ErrorPolicy, comm: &SimpleCommunicator, result: Result<T, PioError>) -> Result<T, PioError> {
    let mut value = None;
    let unit_result = match result {
        Ok(v) => {
            value = Some(v);
            Ok(())
        }
        Err(e) => Err(e),
    };
    let outcome = policy.apply(unit_result, |code| {
        let mut agreed = code;
        comm.broadcast_i32(0, &mut agreed);
        agreed
    });
    match outcome {
        Ok(()) => Ok(value.expect("error policy resolved Ok without a local success value")),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_axis_entry_defaults_to_zero() {
        let mut file = File {
            path: "x".into(),
            ncid: 0,
            driver: Arc::new(NullDriver),
            write_buffer: WriteRequestBuffer::new(0, 0),
            record_axes: HashMap::new(),
        };
        let axis = file.record_axis_for(3);
        assert_eq!(axis.next_record, 0);
    }

    struct NullDriver;
    impl ArrayFileDriver for NullDriver {
        fn create(&self, _: &str, _: OpenMode) -> Result<i32, PioError> {
            Ok(0)
        }
        fn open(&self, _: &str, _: OpenMode) -> Result<i32, PioError> {
            Ok(0)
        }
        fn close(&self, _: i32) -> Result<(), PioError> {
            Ok(())
        }
        fn delete(&self, _: &str) -> Result<(), PioError> {
            Ok(())
        }
        fn wire_format(&self) -> crate::driver::WireFormat {
            crate::driver::WireFormat::ChunkedParallel
        }
        fn inq_var(&self, _: i32, _: i32) -> Result<VarMeta, PioError> {
            unimplemented!()
        }
        fn put_vars(&self, _: i32, _: i32, _: &[i64], _: &[i64], _: &[i64], _: &[u8]) -> Result<(), PioError> {
            Ok(())
        }
        fn get_vars(&self, _: i32, _: i32, _: &[i64], _: &[i64], _: &[i64], _: &mut [u8]) -> Result<(), PioError> {
            Ok(())
        }
    }

    #[test]
    fn test_driver_token_sentinel() {
        assert!(DriverToken::SENTINEL.is_sentinel());
        assert!(!DriverToken(0).is_sentinel());
    }

    // `RegionPayload`/`dispatch` are exercised indirectly in `dispatch.rs`;
    // this module's remaining surface requires a live communicator and is
    // covered by the `demos` binary rather than inline unit tests.
    #[allow(dead_code)]
    fn _type_check_region_payload(r: &crate::region::Region, buf: &[u8]) -> RegionPayload<'_> {
        RegionPayload { region: r, buf }
    }
    #[allow(dead_code)]
    fn _type_check_record_axis() -> RecordAxis {
        RecordAxis::default()
    }
    #[allow(dead_code)]
    fn _type_check_dispatch_import() {
        let _ = dispatch::RecordAxis::default;
    }

    #[test]
    fn test_apply_error_policy_return_passes_through_value() {
        // `Return` never touches `comm`, so any valid communicator handle
        // would do; exercised indirectly through `ErrorPolicy`'s own tests
        // in `error.rs` for the broadcast/internal branches, which need a
        // live communicator this module doesn't construct standalone.
        let outcome = ErrorPolicy::Return.apply(Ok(()), |c| c);
        assert_eq!(outcome, Ok(()));
    }
}
