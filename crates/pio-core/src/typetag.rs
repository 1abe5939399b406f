//! Type-tag multiplexer (component K).
//!
//! A single collective put/get is parameterised by an element-type tag the
//! driver understands; every per-type wrapper (`get_var_int`, `put_vars_double`,
//! ...) forwards to these two entry points unchanged. Reference: spec.md §4.K.

use crate::driver::ArrayFileDriver;
use crate::error::PioError;

/// Closed set of element types the multiplexer accepts.
///
/// Reference: spec.md §4.K.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Byte,
    Char,
    SignedByte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    Int64,
    UInt64,
    Float,
    Double,
}

impl ElementType {
    /// Size in bytes of one element of this type, as the driver would report
    /// via its type-inquiry call.
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::Byte
            | ElementType::Char
            | ElementType::SignedByte
            | ElementType::UnsignedByte => 1,
            ElementType::Short | ElementType::UnsignedShort => 2,
            ElementType::Int | ElementType::UnsignedInt | ElementType::Float => 4,
            ElementType::Int64 | ElementType::UInt64 | ElementType::Double => 8,
        }
    }
}

/// An optional stride vector for the strided put/get variants; absent means
/// a stride of 1 in every dimension.
#[derive(Debug, Clone, Default)]
pub struct Stride(pub Option<Vec<i64>>);

impl Stride {
    pub fn none() -> Self {
        Stride(None)
    }

    pub fn resolved(&self, ndims: usize) -> Vec<i64> {
        self.0.clone().unwrap_or_else(|| vec![1; ndims])
    }
}

/// The single collective put, parameterised by `elem_type`. All
/// `put_var*_<type>` wrappers forward here unchanged.
///
/// Reference: spec.md §4.K, §6 (`put_vara`/`put_vars`/`put_var`).
pub fn typed_put(
    driver: &dyn ArrayFileDriver,
    ncid: i32,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &Stride,
    elem_type: ElementType,
    buf: &[u8],
) -> Result<(), PioError> {
    let resolved_stride = stride.resolved(start.len());
    let expected_elems: i64 = count.iter().product();
    let expected_bytes = expected_elems as usize * elem_type.size_bytes();
    if buf.len() < expected_bytes {
        return Err(PioError::Invalid);
    }
    driver.put_vars(ncid, varid, start, count, &resolved_stride, buf)
}

/// The single collective get, mirroring [`typed_put`].
pub fn typed_get(
    driver: &dyn ArrayFileDriver,
    ncid: i32,
    varid: i32,
    start: &[i64],
    count: &[i64],
    stride: &Stride,
    elem_type: ElementType,
    buf: &mut [u8],
) -> Result<(), PioError> {
    let resolved_stride = stride.resolved(start.len());
    let expected_elems: i64 = count.iter().product();
    let expected_bytes = expected_elems as usize * elem_type.size_bytes();
    if buf.len() < expected_bytes {
        return Err(PioError::Invalid);
    }
    driver.get_vars(ncid, varid, start, count, &resolved_stride, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_bytes() {
        assert_eq!(ElementType::Byte.size_bytes(), 1);
        assert_eq!(ElementType::Short.size_bytes(), 2);
        assert_eq!(ElementType::Int.size_bytes(), 4);
        assert_eq!(ElementType::Double.size_bytes(), 8);
    }

    #[test]
    fn test_stride_default_is_ones() {
        let s = Stride::none();
        assert_eq!(s.resolved(3), vec![1, 1, 1]);
    }

    #[test]
    fn test_stride_explicit() {
        let s = Stride(Some(vec![2, 4]));
        assert_eq!(s.resolved(2), vec![2, 4]);
    }
}
