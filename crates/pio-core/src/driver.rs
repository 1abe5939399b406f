//! The narrow façade onto the external array-file driver (§6).
//!
//! The driver itself — classic and chunked on-disk formats, compression,
//! chunk cache, type inquiry — is out of scope (spec.md §1). This module
//! only defines the trait boundary the rest of the core programs against,
//! plus the handful of value types the boundary needs. One minimal
//! implementation lives in the sibling `pio-driver-posix` crate so the
//! rearranger and dispatcher have something real to exercise in tests.
//!
//! Reference: spec.md §6 "Substrate (required, consumed)".

use bitflags::bitflags;

use crate::error::PioError;

bitflags! {
    /// File open-mode bitmask. Reference: spec.md §6.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ_ONLY       = 0x01;
        const WRITE           = 0x02;
        const CLOBBER         = 0x04;
        const CREATE_IF_MISSING = 0x08;
        const CHUNKED_FORMAT  = 0x10;
        const PARALLEL_IO     = 0x20;
    }
}

/// Which wire format (on-disk layout + driver combination) a file uses.
///
/// Reference: spec.md Glossary "Wire format", §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFormat {
    ClassicSerial,
    ClassicParallel,
    ChunkedSerial,
    ChunkedParallel,
}

impl WireFormat {
    pub fn is_chunked(self) -> bool {
        matches!(self, WireFormat::ChunkedSerial | WireFormat::ChunkedParallel)
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, WireFormat::ClassicParallel | WireFormat::ChunkedParallel)
    }
}

/// Minimal per-variable shape/type metadata the core needs back from the
/// driver to drive a decomposed I/O call.
#[derive(Debug, Clone)]
pub struct VarMeta {
    pub ndims: usize,
    /// Dimension ids, in order; `unlimited_dim` names which of these (if
    /// any) is the record axis.
    pub dim_ids: Vec<i32>,
    pub unlimited_dim: Option<i32>,
    pub elem_size: usize,
}

/// A single outstanding nonblocking write/read token handed back by the
/// driver. Opaque to the core beyond identity and the sentinel check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverToken(pub u64);

impl DriverToken {
    pub const SENTINEL: DriverToken = DriverToken(u64::MAX);

    pub fn is_sentinel(self) -> bool {
        self == Self::SENTINEL
    }
}

/// The façade trait every wire-format driver implements.
///
/// Bulk-transfer methods take already-resolved byte buffers; callers above
/// this boundary (the type-tag multiplexer, the dispatcher) are responsible
/// for element-type-to-byte-size accounting.
pub trait ArrayFileDriver: Send + Sync {
    /// Collective create. `path` is the file path; `mode` the bitmask.
    fn create(&self, path: &str, mode: OpenMode) -> Result<i32, PioError>;
    /// Collective open, with retry-to-classic handled by the caller (§7).
    fn open(&self, path: &str, mode: OpenMode) -> Result<i32, PioError>;
    fn close(&self, ncid: i32) -> Result<(), PioError>;
    fn delete(&self, path: &str) -> Result<(), PioError>;

    /// Which wire format this driver instance provides.
    fn wire_format(&self) -> WireFormat;

    fn inq_var(&self, ncid: i32, varid: i32) -> Result<VarMeta, PioError>;

    /// Blocking, collective strided put over one region.
    fn put_vars(
        &self,
        ncid: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        buf: &[u8],
    ) -> Result<(), PioError>;

    /// Blocking, collective strided get over one region.
    fn get_vars(
        &self,
        ncid: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        buf: &mut [u8],
    ) -> Result<(), PioError>;

    /// Multi-range put in one call (`varn`). The default forwards to
    /// repeated `put_vars` calls; parallel drivers should override with a
    /// true single-call `varn`.
    fn put_varn(
        &self,
        ncid: i32,
        varid: i32,
        starts: &[Vec<i64>],
        counts: &[Vec<i64>],
        buf: &[u8],
        elem_size: usize,
    ) -> Result<(), PioError> {
        let mut offset = 0usize;
        for (start, count) in starts.iter().zip(counts.iter()) {
            let nelem: i64 = count.iter().product();
            let nbytes = nelem as usize * elem_size;
            let stride = vec![1i64; start.len()];
            self.put_vars(ncid, varid, start, count, &stride, &buf[offset..offset + nbytes])?;
            offset += nbytes;
        }
        Ok(())
    }

    /// Multi-range get in one call (`varn`), mirroring [`Self::put_varn`].
    fn get_varn(
        &self,
        ncid: i32,
        varid: i32,
        starts: &[Vec<i64>],
        counts: &[Vec<i64>],
        buf: &mut [u8],
        elem_size: usize,
    ) -> Result<(), PioError> {
        let mut offset = 0usize;
        for (start, count) in starts.iter().zip(counts.iter()) {
            let nelem: i64 = count.iter().product();
            let nbytes = nelem as usize * elem_size;
            let stride = vec![1i64; start.len()];
            self.get_vars(ncid, varid, start, count, &stride, &mut buf[offset..offset + nbytes])?;
            offset += nbytes;
        }
        Ok(())
    }

    /// Nonblocking buffered `varn` write (parallel chunked drivers only).
    /// Default implementation performs the write synchronously and returns
    /// a sentinel-free token immediately — a correct but non-overlapping
    /// fallback for drivers without real async support.
    fn bput_varn(
        &self,
        ncid: i32,
        varid: i32,
        starts: &[Vec<i64>],
        counts: &[Vec<i64>],
        buf: &[u8],
        elem_size: usize,
    ) -> Result<DriverToken, PioError> {
        self.put_varn(ncid, varid, starts, counts, buf, elem_size)?;
        Ok(DriverToken(0))
    }

    /// Wait for a set of previously issued nonblocking tokens to complete.
    /// The default is a no-op since the default `bput_varn` already
    /// completed synchronously.
    fn wait_all(&self, tokens: &[DriverToken]) -> Result<(), PioError> {
        let _ = tokens;
        Ok(())
    }

    /// Bytes currently held in driver-attached write buffers for this file,
    /// used by the write-request buffer's usage probe (§4.F).
    fn inq_buffer_usage(&self, ncid: i32) -> Result<i64, PioError> {
        let _ = ncid;
        Ok(0)
    }
}
