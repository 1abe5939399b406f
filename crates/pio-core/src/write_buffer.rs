//! Write-request buffer (component F).
//!
//! Accumulates `varn`-style write requests per open file until a byte
//! budget is exceeded, then flushes them through the driver's buffered
//! write path. Reference: spec.md §4.F.

use crate::comm::GroupComm;
use crate::driver::{ArrayFileDriver, DriverToken};
use crate::error::PioError;

/// One buffered multi-region write, queued until the next flush.
struct PendingWrite {
    varid: i32,
    starts: Vec<Vec<i64>>,
    counts: Vec<Vec<i64>>,
    buf: Vec<u8>,
    elem_size: usize,
}

/// Per-file table of buffered write requests.
///
/// Reference: spec.md §3 "WriteRequestBuffer", §4.F.
pub struct WriteRequestBuffer {
    ncid: i32,
    pending: Vec<PendingWrite>,
    bytes_buffered: i64,
    max_bytes: i64,
    outstanding: Vec<DriverToken>,
}

impl WriteRequestBuffer {
    pub fn new(ncid: i32, max_bytes: i64) -> Self {
        WriteRequestBuffer {
            ncid,
            pending: Vec::new(),
            bytes_buffered: 0,
            max_bytes,
            outstanding: Vec::new(),
        }
    }

    pub fn bytes_buffered(&self) -> i64 {
        self.bytes_buffered
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue one multi-region write. Triggers an automatic flush first if
    /// adding it would exceed the byte budget (a budget of 0 means
    /// unbounded; negative is never exceeded automatically). The decision
    /// is collective: every rank in `comm` (the I/O group) probes the
    /// driver's own buffer usage and all-reduce-maxes it against the
    /// incoming write, so all ranks flush in the same call.
    ///
    /// Reference: spec.md §4.F bullets 1-3 "flush ... triggered automatically
    /// once buffered bytes exceed the per-system byte budget (via all-reduce
    /// max)".
    pub fn add(
        &mut self,
        driver: &dyn ArrayFileDriver,
        comm: &dyn GroupComm,
        varid: i32,
        starts: Vec<Vec<i64>>,
        counts: Vec<Vec<i64>>,
        buf: Vec<u8>,
        elem_size: usize,
    ) -> Result<(), PioError> {
        let incoming_bytes = buf.len() as i64;
        if self.max_bytes > 0 {
            let local_usage = self.bytes_buffered + incoming_bytes + driver.inq_buffer_usage(self.ncid)?;
            let global_usage = comm.all_reduce_max_i64(local_usage);
            if global_usage > self.max_bytes {
                self.flush(driver, false)?;
            }
        }
        self.bytes_buffered += incoming_bytes;
        self.pending.push(PendingWrite {
            varid,
            starts,
            counts,
            buf,
            elem_size,
        });
        Ok(())
    }

    /// Drain the table through `driver.bput_varn`. With `force`, also waits
    /// on every outstanding token (including ones from prior flushes) before
    /// returning, guaranteeing all buffered data has reached the driver.
    ///
    /// Reference: spec.md §4.F bullet 3, §8 "flush(force=true) empties the
    /// write-request table".
    pub fn flush(&mut self, driver: &dyn ArrayFileDriver, force: bool) -> Result<(), PioError> {
        for req in self.pending.drain(..) {
            let token = driver.bput_varn(self.ncid, req.varid, &req.starts, &req.counts, &req.buf, req.elem_size)?;
            if !token.is_sentinel() {
                self.outstanding.push(token);
            }
        }
        self.bytes_buffered = 0;

        if force {
            driver.wait_all(&self.outstanding)?;
            self.outstanding.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{OpenMode, VarMeta, WireFormat};
    use std::cell::RefCell;

    /// A single-rank `GroupComm` fake: every all-reduce is a no-op pass
    /// through of the local value, matching what a real one-rank I/O group
    /// would produce.
    struct SoloComm;

    impl GroupComm for SoloComm {
        fn rank(&self) -> i32 {
            0
        }
        fn size(&self) -> i32 {
            1
        }
        fn barrier(&self) {}
        fn broadcast_i32(&self, _root: i32, _value: &mut i32) {}
        fn all_reduce_sum_i64(&self, local: i64) -> i64 {
            local
        }
        fn all_reduce_max_i64(&self, local: i64) -> i64 {
            local
        }
        fn all_reduce_min_i64(&self, local: i64) -> i64 {
            local
        }
        fn all_reduce_max_usize(&self, local: usize) -> usize {
            local
        }
        fn all_to_all_i32(&self, send: &[i32]) -> Vec<i32> {
            send.to_vec()
        }
        fn all_to_all_v_i64(&self, send: &[i64], _send_counts: &[i32], _recv_counts: &[i32]) -> Vec<i64> {
            send.to_vec()
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        calls: RefCell<Vec<(i32, usize)>>,
    }

    impl ArrayFileDriver for RecordingDriver {
        fn create(&self, _path: &str, _mode: OpenMode) -> Result<i32, PioError> {
            Ok(0)
        }
        fn open(&self, _path: &str, _mode: OpenMode) -> Result<i32, PioError> {
            Ok(0)
        }
        fn close(&self, _ncid: i32) -> Result<(), PioError> {
            Ok(())
        }
        fn delete(&self, _path: &str) -> Result<(), PioError> {
            Ok(())
        }
        fn wire_format(&self) -> WireFormat {
            WireFormat::ChunkedParallel
        }
        fn inq_var(&self, _ncid: i32, _varid: i32) -> Result<VarMeta, PioError> {
            unimplemented!()
        }
        fn put_vars(&self, _: i32, _: i32, _: &[i64], _: &[i64], _: &[i64], _: &[u8]) -> Result<(), PioError> {
            Ok(())
        }
        fn get_vars(&self, _: i32, _: i32, _: &[i64], _: &[i64], _: &[i64], _: &mut [u8]) -> Result<(), PioError> {
            Ok(())
        }
        fn bput_varn(
            &self,
            _ncid: i32,
            varid: i32,
            _starts: &[Vec<i64>],
            _counts: &[Vec<i64>],
            buf: &[u8],
            _elem_size: usize,
        ) -> Result<DriverToken, PioError> {
            self.calls.borrow_mut().push((varid, buf.len()));
            Ok(DriverToken(self.calls.borrow().len() as u64))
        }
    }

    #[test]
    fn test_flush_force_empties_table() {
        let driver = RecordingDriver::default();
        let comm = SoloComm;
        let mut buffer = WriteRequestBuffer::new(0, 0);
        buffer
            .add(&driver, &comm, 1, vec![vec![0]], vec![vec![4]], vec![0u8; 32], 8)
            .unwrap();
        assert!(!buffer.is_empty());
        buffer.flush(&driver, true).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes_buffered(), 0);
        assert!(buffer.outstanding.is_empty());
    }

    #[test]
    fn test_add_triggers_auto_flush_over_budget() {
        let driver = RecordingDriver::default();
        let comm = SoloComm;
        let mut buffer = WriteRequestBuffer::new(0, 16);
        buffer.add(&driver, &comm, 1, vec![vec![0]], vec![vec![1]], vec![0u8; 8], 8).unwrap();
        assert_eq!(buffer.bytes_buffered(), 8);
        // This push would exceed the 16-byte budget, so it auto-flushes first.
        buffer.add(&driver, &comm, 2, vec![vec![0]], vec![vec![2]], vec![0u8; 16], 8).unwrap();
        assert_eq!(driver.calls.borrow().len(), 1);
        assert_eq!(buffer.bytes_buffered(), 16);
    }

    #[test]
    fn test_zero_budget_never_auto_flushes() {
        let driver = RecordingDriver::default();
        let comm = SoloComm;
        let mut buffer = WriteRequestBuffer::new(0, 0);
        for _ in 0..5 {
            buffer.add(&driver, &comm, 1, vec![vec![0]], vec![vec![1]], vec![0u8; 1024], 8).unwrap();
        }
        assert!(driver.calls.borrow().is_empty());
        assert_eq!(buffer.bytes_buffered(), 5 * 1024);
    }

    #[test]
    fn test_add_uses_driver_reported_usage_too() {
        struct BusyDriver {
            inner: RecordingDriver,
            reported_usage: RefCell<i64>,
        }
        impl ArrayFileDriver for BusyDriver {
            fn create(&self, p: &str, m: OpenMode) -> Result<i32, PioError> {
                self.inner.create(p, m)
            }
            fn open(&self, p: &str, m: OpenMode) -> Result<i32, PioError> {
                self.inner.open(p, m)
            }
            fn close(&self, n: i32) -> Result<(), PioError> {
                self.inner.close(n)
            }
            fn delete(&self, p: &str) -> Result<(), PioError> {
                self.inner.delete(p)
            }
            fn wire_format(&self) -> WireFormat {
                self.inner.wire_format()
            }
            fn inq_var(&self, n: i32, v: i32) -> Result<VarMeta, PioError> {
                self.inner.inq_var(n, v)
            }
            fn put_vars(&self, a: i32, b: i32, c: &[i64], d: &[i64], e: &[i64], f: &[u8]) -> Result<(), PioError> {
                self.inner.put_vars(a, b, c, d, e, f)
            }
            fn get_vars(
                &self,
                a: i32,
                b: i32,
                c: &[i64],
                d: &[i64],
                e: &[i64],
                f: &mut [u8],
            ) -> Result<(), PioError> {
                self.inner.get_vars(a, b, c, d, e, f)
            }
            fn bput_varn(
                &self,
                ncid: i32,
                varid: i32,
                starts: &[Vec<i64>],
                counts: &[Vec<i64>],
                buf: &[u8],
                elem_size: usize,
            ) -> Result<DriverToken, PioError> {
                self.inner.bput_varn(ncid, varid, starts, counts, buf, elem_size)
            }
            fn inq_buffer_usage(&self, _ncid: i32) -> Result<i64, PioError> {
                Ok(*self.reported_usage.borrow())
            }
        }

        let driver = BusyDriver {
            inner: RecordingDriver::default(),
            reported_usage: RefCell::new(0),
        };
        let comm = SoloComm;
        let mut buffer = WriteRequestBuffer::new(0, 16);
        // Nothing held anywhere yet, so this add is accepted without a flush.
        buffer.add(&driver, &comm, 1, vec![vec![0]], vec![vec![1]], vec![0u8; 4], 8).unwrap();
        assert!(driver.inner.calls.borrow().is_empty());

        // The driver's own buffer has since filled up independently of
        // `bytes_buffered`; the next add must see that via
        // `inq_buffer_usage` and flush the pending write even though the
        // local counter alone would not have crossed the budget.
        *driver.reported_usage.borrow_mut() = 100;
        buffer.add(&driver, &comm, 2, vec![vec![0]], vec![vec![1]], vec![0u8; 4], 8).unwrap();
        assert_eq!(driver.inner.calls.borrow().len(), 1);
    }
}
