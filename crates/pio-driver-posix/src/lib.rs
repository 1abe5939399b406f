//! A minimal `ArrayFileDriver` over flat POSIX files, for exercising the
//! rearranger/dispatcher/write-buffer against something real in tests and
//! the `demos` binary.
//!
//! This is deliberately not a classic or chunked array-format driver (no
//! header, no on-disk type/dimension metadata, no compression or chunk
//! cache) — variables are plain fixed-shape regions at known byte offsets
//! within one flat file, registered in-process via [`PosixDriver::define_var`].
//!
//! Reference: grounded on the POSIX open/close/delete/pread/pwrite pattern
//! in `ior-backend-posix`'s `PosixBackend`.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use pio_core::{ArrayFileDriver, OpenMode, PioError, VarMeta, WireFormat};

#[derive(Clone)]
struct VarEntry {
    dims: Vec<i64>,
    elem_size: usize,
    base_offset: u64,
}

struct OpenFile {
    fd: RawFd,
    vars: Vec<VarEntry>,
}

/// POSIX-backed `ArrayFileDriver`. One flat file per `ncid`; variables are
/// laid out sequentially as they're defined via [`Self::define_var`].
pub struct PosixDriver {
    files: Mutex<HashMap<i32, OpenFile>>,
    next_ncid: Mutex<i32>,
}

impl Default for PosixDriver {
    fn default() -> Self {
        PosixDriver {
            files: Mutex::new(HashMap::new()),
            next_ncid: Mutex::new(0),
        }
    }
}

fn path_to_cstring(path: &str) -> Result<CString, PioError> {
    CString::new(path).map_err(|_| PioError::Invalid)
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

impl PosixDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixed-shape variable within an already-open file,
    /// returning its varid. `dims` is the variable's own shape (row-major,
    /// most-significant dimension first), independent of any decomposition.
    pub fn define_var(&self, ncid: i32, dims: Vec<i64>, elem_size: usize) -> Result<i32, PioError> {
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&ncid).ok_or(PioError::BadId)?;
        let base_offset = file
            .vars
            .iter()
            .map(|v| v.dims.iter().product::<i64>() as u64 * v.elem_size as u64)
            .sum();
        let varid = file.vars.len() as i32;
        file.vars.push(VarEntry {
            dims,
            elem_size,
            base_offset,
        });
        Ok(varid)
    }

    fn linear_offset(var: &VarEntry, start: &[i64], count: &[i64], stride: &[i64]) -> Vec<u64> {
        let ndims = var.dims.len();
        let total: i64 = count.iter().product();
        let mut offsets = Vec::with_capacity(total as usize);
        let mut coord = vec![0i64; ndims];
        for lin in 0..total {
            let mut rem = lin;
            for d in (0..ndims).rev() {
                coord[d] = rem % count[d];
                rem /= count[d];
            }
            let mut global = 0i64;
            for d in 0..ndims {
                let idx = start[d] + coord[d] * stride[d];
                global = global * var.dims[d] + idx;
            }
            offsets.push(var.base_offset + global as u64 * var.elem_size as u64);
        }
        offsets
    }
}

impl ArrayFileDriver for PosixDriver {
    fn create(&self, path: &str, mode: OpenMode) -> Result<i32, PioError> {
        let cpath = path_to_cstring(path)?;
        let mut oflags = libc::O_CREAT | libc::O_RDWR;
        if mode.contains(OpenMode::CLOBBER) {
            oflags |= libc::O_TRUNC;
        }
        let fd = unsafe { libc::open(cpath.as_ptr(), oflags, 0o664 as libc::mode_t) };
        if fd < 0 {
            return Err(PioError::Io(errno()));
        }
        let ncid = {
            let mut next = self.next_ncid.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.files.lock().unwrap().insert(ncid, OpenFile { fd, vars: Vec::new() });
        Ok(ncid)
    }

    fn open(&self, path: &str, mode: OpenMode) -> Result<i32, PioError> {
        let cpath = path_to_cstring(path)?;
        let oflags = if mode.contains(OpenMode::WRITE) {
            libc::O_RDWR
        } else {
            libc::O_RDONLY
        };
        let fd = unsafe { libc::open(cpath.as_ptr(), oflags) };
        if fd < 0 {
            return Err(PioError::Io(errno()));
        }
        let ncid = {
            let mut next = self.next_ncid.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.files.lock().unwrap().insert(ncid, OpenFile { fd, vars: Vec::new() });
        Ok(ncid)
    }

    fn close(&self, ncid: i32) -> Result<(), PioError> {
        let file = self.files.lock().unwrap().remove(&ncid).ok_or(PioError::BadId)?;
        let rc = unsafe { libc::close(file.fd) };
        if rc < 0 {
            return Err(PioError::Io(errno()));
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), PioError> {
        let cpath = path_to_cstring(path)?;
        let rc = unsafe { libc::unlink(cpath.as_ptr()) };
        if rc < 0 && errno() != libc::ENOENT {
            return Err(PioError::Io(errno()));
        }
        Ok(())
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::ClassicSerial
    }

    fn inq_var(&self, ncid: i32, varid: i32) -> Result<VarMeta, PioError> {
        let files = self.files.lock().unwrap();
        let file = files.get(&ncid).ok_or(PioError::BadId)?;
        let var = file.vars.get(varid as usize).ok_or(PioError::BadId)?;
        Ok(VarMeta {
            ndims: var.dims.len(),
            dim_ids: (0..var.dims.len() as i32).collect(),
            unlimited_dim: None,
            elem_size: var.elem_size,
        })
    }

    fn put_vars(
        &self,
        ncid: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        buf: &[u8],
    ) -> Result<(), PioError> {
        let files = self.files.lock().unwrap();
        let file = files.get(&ncid).ok_or(PioError::BadId)?;
        let var = file.vars.get(varid as usize).ok_or(PioError::BadId)?;
        let offsets = Self::linear_offset(var, start, count, stride);
        for (i, off) in offsets.iter().enumerate() {
            let chunk = &buf[i * var.elem_size..(i + 1) * var.elem_size];
            let rc = unsafe {
                libc::pwrite(
                    file.fd,
                    chunk.as_ptr() as *const libc::c_void,
                    var.elem_size,
                    *off as libc::off_t,
                )
            };
            if rc < 0 {
                return Err(PioError::Io(errno()));
            }
        }
        Ok(())
    }

    fn get_vars(
        &self,
        ncid: i32,
        varid: i32,
        start: &[i64],
        count: &[i64],
        stride: &[i64],
        buf: &mut [u8],
    ) -> Result<(), PioError> {
        let files = self.files.lock().unwrap();
        let file = files.get(&ncid).ok_or(PioError::BadId)?;
        let var = file.vars.get(varid as usize).ok_or(PioError::BadId)?;
        let offsets = Self::linear_offset(var, start, count, stride);
        for (i, off) in offsets.iter().enumerate() {
            let chunk = &mut buf[i * var.elem_size..(i + 1) * var.elem_size];
            let rc = unsafe {
                libc::pread(
                    file.fd,
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    var.elem_size,
                    *off as libc::off_t,
                )
            };
            if rc < 0 {
                return Err(PioError::Io(errno()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_define_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let driver = PosixDriver::new();

        let ncid = driver.create(path.to_str().unwrap(), OpenMode::CLOBBER | OpenMode::WRITE).unwrap();
        let varid = driver.define_var(ncid, vec![2, 3], 8).unwrap();

        let data: [f64; 6] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 48) };
        driver
            .put_vars(ncid, varid, &[0, 0], &[2, 3], &[1, 1], bytes)
            .unwrap();
        driver.close(ncid).unwrap();

        let ncid2 = driver.open(path.to_str().unwrap(), OpenMode::READ_ONLY).unwrap();
        let varid2 = driver.define_var(ncid2, vec![2, 3], 8).unwrap();
        assert_eq!(varid2, 0);
        let mut out = [0.0f64; 6];
        let out_bytes = unsafe { std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, 48) };
        driver.get_vars(ncid2, varid2, &[0, 0], &[2, 3], &[1, 1], out_bytes).unwrap();
        driver.close(ncid2).unwrap();

        assert_eq!(out, data);
    }

    #[test]
    fn test_partial_region_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let driver = PosixDriver::new();
        let ncid = driver.create(path.to_str().unwrap(), OpenMode::CLOBBER | OpenMode::WRITE).unwrap();
        let varid = driver.define_var(ncid, vec![4], 4).unwrap();

        let data: [i32; 2] = [42, 43];
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, 8) };
        driver.put_vars(ncid, varid, &[1], &[2], &[1], bytes).unwrap();

        let mut out = [0i32; 2];
        let out_bytes = unsafe { std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, 8) };
        driver.get_vars(ncid, varid, &[1], &[2], &[1], out_bytes).unwrap();
        driver.close(ncid).unwrap();

        assert_eq!(out, data);
    }

    #[test]
    fn test_delete_missing_file_is_not_an_error() {
        let driver = PosixDriver::new();
        assert!(driver.delete("/tmp/pio-driver-posix-does-not-exist").is_ok());
    }
}
