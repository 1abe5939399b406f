//! I/O path dispatcher (component G).
//!
//! Routes a decomposed put/get through the right path for the file's
//! [`WireFormat`]: parallel formats let every I/O rank call the driver
//! directly over its own regions; serial formats funnel through I/O rank 0,
//! which is the only rank allowed to touch the file — every other I/O rank
//! ships its region list (and, for writes, its data) to rank 0 over the
//! wire rather than touching the driver itself. Also owns record-axis
//! bookkeeping (the current length along the unlimited dimension).
//!
//! Reference: spec.md §4.G.

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::driver::{ArrayFileDriver, VarMeta, WireFormat};
use crate::error::PioError;
use crate::region::Region;

/// One region's local byte payload, paired with its global start/count for
/// the eventual driver call.
pub struct RegionPayload<'a> {
    pub region: &'a Region,
    pub buf: &'a [u8],
}

/// How a write should be routed for a given wire format. Only a chunked
/// parallel file can accumulate in [`crate::write_buffer::WriteRequestBuffer`]
/// and go out through `bput_varn`; every other format writes immediately
/// through [`dispatch_write`], which itself picks direct-per-rank vs
/// serial-funnel based on [`WireFormat::is_parallel`].
///
/// Reference: spec.md §4.G table (wire format x dispatch path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    BufferedChunked,
    DirectParallel,
    SerialFunnel,
}

pub fn path_for(format: WireFormat) -> DispatchPath {
    match format {
        WireFormat::ChunkedParallel => DispatchPath::BufferedChunked,
        WireFormat::ClassicParallel => DispatchPath::DirectParallel,
        WireFormat::ChunkedSerial | WireFormat::ClassicSerial => DispatchPath::SerialFunnel,
    }
}

/// Tracks the next record index to write along `var`'s unlimited dimension,
/// per `(ncid, varid)`. Advances monotonically; never rewound.
///
/// Reference: spec.md §4.G "record-axis handling".
#[derive(Debug, Default, Clone, Copy)]
pub struct RecordAxis {
    pub next_record: i64,
}

impl RecordAxis {
    /// The record index this write should target, and the index after it.
    pub fn advance(&mut self) -> i64 {
        let rec = self.next_record;
        self.next_record += 1;
        rec
    }
}

/// Prefix `start`/`count` with the record-axis coordinate when `var` has an
/// unlimited dimension; otherwise pass them through unchanged.
pub(crate) fn apply_record_axis(var: &VarMeta, record: i64, start: &[i64], count: &[i64]) -> (Vec<i64>, Vec<i64>) {
    if var.unlimited_dim.is_none() {
        return (start.to_vec(), count.to_vec());
    }
    let mut s = Vec::with_capacity(start.len() + 1);
    let mut c = Vec::with_capacity(count.len() + 1);
    s.push(record);
    c.push(1);
    s.extend_from_slice(start);
    c.extend_from_slice(count);
    (s, c)
}

/// Wire-encode a list of `(start, count, payload)` triples into one byte
/// buffer, so a whole region list (plus, for writes, the data it carries)
/// can travel over a single point-to-point message to I/O rank 0.
///
/// Layout: `u32 nblocks`, then per block `u32 ndims`, `ndims x i64 start`,
/// `ndims x i64 count`, `u32 buf_len`, `buf_len` bytes.
fn encode_blocks(blocks: &[(&[i64], &[i64], &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(blocks.len() as u32).to_ne_bytes());
    for (start, count, buf) in blocks {
        out.extend_from_slice(&(start.len() as u32).to_ne_bytes());
        for &v in start.iter() {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        for &v in count.iter() {
            out.extend_from_slice(&v.to_ne_bytes());
        }
        out.extend_from_slice(&(buf.len() as u32).to_ne_bytes());
        out.extend_from_slice(buf);
    }
    out
}

/// Inverse of [`encode_blocks`].
fn decode_blocks(bytes: &[u8]) -> Vec<(Vec<i64>, Vec<i64>, Vec<u8>)> {
    let mut cursor = 0usize;
    let read_u32 = |bytes: &[u8], cursor: &mut usize| -> u32 {
        let v = u32::from_ne_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
        *cursor += 4;
        v
    };
    let read_i64 = |bytes: &[u8], cursor: &mut usize| -> i64 {
        let v = i64::from_ne_bytes(bytes[*cursor..*cursor + 8].try_into().unwrap());
        *cursor += 8;
        v
    };

    let nblocks = read_u32(bytes, &mut cursor);
    let mut blocks = Vec::with_capacity(nblocks as usize);
    for _ in 0..nblocks {
        let ndims = read_u32(bytes, &mut cursor) as usize;
        let start: Vec<i64> = (0..ndims).map(|_| read_i64(bytes, &mut cursor)).collect();
        let count: Vec<i64> = (0..ndims).map(|_| read_i64(bytes, &mut cursor)).collect();
        let buf_len = read_u32(bytes, &mut cursor) as usize;
        let buf = bytes[cursor..cursor + buf_len].to_vec();
        cursor += buf_len;
        blocks.push((start, count, buf));
    }
    blocks
}

/// Write `payloads` (this I/O rank's regions) to `ncid`/`varid`, dispatching
/// on `driver.wire_format()`. On a serial format, every non-root I/O rank
/// ships its region list and data to I/O rank 0 of `io_comm`, which is the
/// only rank that calls the driver; on a parallel format every I/O rank
/// writes directly.
///
/// Reference: spec.md §4.G bullets 1-3.
pub fn dispatch_write(
    driver: &dyn ArrayFileDriver,
    io_comm: &SimpleCommunicator,
    ncid: i32,
    varid: i32,
    var: &VarMeta,
    record: Option<i64>,
    payloads: &[RegionPayload],
) -> Result<(), PioError> {
    let put_one = |start: &[i64], count: &[i64], buf: &[u8]| -> Result<(), PioError> {
        let (start, count) = match record {
            Some(r) => apply_record_axis(var, r, start, count),
            None => (start.to_vec(), count.to_vec()),
        };
        let stride = vec![1i64; start.len()];
        driver.put_vars(ncid, varid, &start, &count, &stride, buf)
    };

    if driver.wire_format().is_parallel() {
        for p in payloads {
            put_one(&p.region.start, &p.region.count, p.buf)?;
        }
        return Ok(());
    }

    // Serial format: every non-root I/O rank ships its regions (metadata +
    // data) to rank 0, the only rank that touches the driver.
    let root = 0i32;
    let my_rank = io_comm.rank();
    if my_rank != root {
        let blocks: Vec<(&[i64], &[i64], &[u8])> =
            payloads.iter().map(|p| (p.region.start.as_slice(), p.region.count.as_slice(), p.buf)).collect();
        let encoded = encode_blocks(&blocks);
        io_comm.process_at_rank(root).send(&encoded);
        return Ok(());
    }

    for p in payloads {
        put_one(&p.region.start, &p.region.count, p.buf)?;
    }
    let size = io_comm.size();
    for peer in 1..size {
        let (encoded, _status) = io_comm.process_at_rank(peer).receive_vec::<u8>();
        for (start, count, buf) in decode_blocks(&encoded) {
            put_one(&start, &count, &buf)?;
        }
    }
    Ok(())
}

/// Read `regions` of `ncid`/`varid`, returning one packed buffer per region
/// (same order as `regions`, `region.num_elements() * elem_size` bytes
/// each), dispatching on `driver.wire_format()` exactly as [`dispatch_write`]
/// does for the write direction.
///
/// Reference: spec.md §4.G bullets 1-3 (read direction).
pub fn dispatch_read(
    driver: &dyn ArrayFileDriver,
    io_comm: &SimpleCommunicator,
    ncid: i32,
    varid: i32,
    var: &VarMeta,
    record: Option<i64>,
    regions: &[Region],
    elem_size: usize,
) -> Result<Vec<Vec<u8>>, PioError> {
    let get_one = |start: &[i64], count: &[i64]| -> Result<Vec<u8>, PioError> {
        let (start, count) = match record {
            Some(r) => apply_record_axis(var, r, start, count),
            None => (start.to_vec(), count.to_vec()),
        };
        let stride = vec![1i64; start.len()];
        let n: i64 = count.iter().product();
        let mut buf = vec![0u8; n as usize * elem_size];
        driver.get_vars(ncid, varid, &start, &count, &stride, &mut buf)?;
        Ok(buf)
    };

    if driver.wire_format().is_parallel() {
        return regions.iter().map(|r| get_one(&r.start, &r.count)).collect();
    }

    let root = 0i32;
    let my_rank = io_comm.rank();
    if my_rank != root {
        let empty: Vec<u8> = Vec::new();
        let blocks: Vec<(&[i64], &[i64], &[u8])> =
            regions.iter().map(|r| (r.start.as_slice(), r.count.as_slice(), empty.as_slice())).collect();
        let request = encode_blocks(&blocks);
        io_comm.process_at_rank(root).send(&request);
        let (response, _status) = io_comm.process_at_rank(root).receive_vec::<u8>();
        let mut cursor = 0usize;
        let mut out = Vec::with_capacity(regions.len());
        for r in regions {
            let n = r.num_elements() as usize * elem_size;
            out.push(response[cursor..cursor + n].to_vec());
            cursor += n;
        }
        return Ok(out);
    }

    let mut own = Vec::with_capacity(regions.len());
    for r in regions {
        own.push(get_one(&r.start, &r.count)?);
    }

    let size = io_comm.size();
    for peer in 1..size {
        let (request, _status) = io_comm.process_at_rank(peer).receive_vec::<u8>();
        let mut response = Vec::new();
        for (start, count, _) in decode_blocks(&request) {
            response.extend(get_one(&start, &count)?);
        }
        io_comm.process_at_rank(peer).send(&response);
    }
    Ok(own)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_axis_advances_monotonically() {
        let mut axis = RecordAxis::default();
        assert_eq!(axis.advance(), 0);
        assert_eq!(axis.advance(), 1);
        assert_eq!(axis.advance(), 2);
    }

    #[test]
    fn test_apply_record_axis_prefixes_when_unlimited() {
        let var = VarMeta {
            ndims: 2,
            dim_ids: vec![0, 1],
            unlimited_dim: Some(0),
            elem_size: 8,
        };
        let (start, count) = apply_record_axis(&var, 3, &[1, 2], &[4, 5]);
        assert_eq!(start, vec![3, 1, 2]);
        assert_eq!(count, vec![1, 4, 5]);
    }

    #[test]
    fn test_apply_record_axis_passthrough_when_fixed() {
        let var = VarMeta {
            ndims: 2,
            dim_ids: vec![0, 1],
            unlimited_dim: None,
            elem_size: 8,
        };
        let (start, count) = apply_record_axis(&var, 3, &[1, 2], &[4, 5]);
        assert_eq!(start, vec![1, 2]);
        assert_eq!(count, vec![4, 5]);
    }

    #[test]
    fn test_encode_decode_blocks_round_trip() {
        let start = [0i64, 1];
        let count = [2i64, 3];
        let buf = [9u8, 8, 7, 6];
        let blocks: Vec<(&[i64], &[i64], &[u8])> = vec![(&start, &count, &buf)];
        let encoded = encode_blocks(&blocks);
        let decoded = decode_blocks(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, vec![0, 1]);
        assert_eq!(decoded[0].1, vec![2, 3]);
        assert_eq!(decoded[0].2, vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_path_for_classifies_every_wire_format() {
        assert_eq!(path_for(WireFormat::ChunkedParallel), DispatchPath::BufferedChunked);
        assert_eq!(path_for(WireFormat::ClassicParallel), DispatchPath::DirectParallel);
        assert_eq!(path_for(WireFormat::ChunkedSerial), DispatchPath::SerialFunnel);
        assert_eq!(path_for(WireFormat::ClassicSerial), DispatchPath::SerialFunnel);
    }

    #[test]
    fn test_encode_decode_multiple_blocks() {
        let a_start = [0i64];
        let a_count = [1i64];
        let a_buf = [1u8];
        let b_start = [5i64];
        let b_count = [2i64];
        let b_buf = [2u8, 3];
        let blocks: Vec<(&[i64], &[i64], &[u8])> =
            vec![(&a_start, &a_count, &a_buf), (&b_start, &b_count, &b_buf)];
        let decoded = decode_blocks(&encode_blocks(&blocks));
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].0, vec![5]);
        assert_eq!(decoded[1].2, vec![2, 3]);
    }
}
