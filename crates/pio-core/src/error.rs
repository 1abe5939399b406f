//! Error taxonomy and per-system/per-file error policy.
//!
//! Reference: spec.md §4.J, §7; `pioc_support.c`'s `check_netcdf`/`check_mpi`
//! pattern of mapping a raw substrate code through the active handler once
//! at the public boundary.

use thiserror::Error;

/// Error kinds returned by the library.
///
/// Each variant carries the legacy integer code spec.md §6 enumerates, so
/// callers that need the historical `NOERR`/`EBADID`/... constant can still
/// get it via [`PioError::to_legacy_code`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PioError {
    /// Unknown id passed for an `IoSystem`, `IoDesc`, or file.
    #[error("unknown id")]
    BadId,
    /// Bad argument: out-of-range dimension, mismatched ndof, etc.
    #[error("invalid argument")]
    Invalid,
    /// Allocation failure while building an `IoDesc`, buffer, or request list.
    #[error("out of memory")]
    NoMemory,
    /// Unrecognized or unsupported wire-format/iotype tag.
    #[error("bad I/O type")]
    BadIoType,
    /// Operation requires the chunked (NetCDF-4-like) driver but the file isn't one.
    #[error("not a chunked-format file")]
    NotChunked,
    /// Element count did not evenly divide a dimension, or a region ran past it.
    #[error("edge condition")]
    Edge,
    /// Element-type tag not understood by the type-tag multiplexer or driver.
    #[error("bad element type")]
    BadType,
    /// Substrate (group-communication) call failed; mapped to a generic I/O error.
    #[error("I/O error (substrate or driver, code={0})")]
    Io(i32),
    /// No error. Rarely constructed directly; `Result::Ok(())` is preferred,
    /// but the legacy code is kept for round-tripping through the policy layer.
    #[error("no error")]
    NoErr,
}

impl PioError {
    /// The historical integer constant from spec.md §6's error-code subset.
    pub fn to_legacy_code(self) -> i32 {
        match self {
            PioError::NoErr => 0,
            PioError::BadId => -33,
            PioError::Invalid => -36,
            PioError::NoMemory => -61,
            PioError::BadIoType => -65,
            PioError::NotChunked => -102,
            PioError::Edge => -40,
            PioError::BadType => -45,
            PioError::Io(_) => -101,
        }
    }
}

/// Per-`IoSystem` (and optionally per-`File`) policy applied to every
/// public-entry return code.
///
/// Reference: spec.md §4.J.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Translate to a message and abort the process.
    Internal,
    /// Broadcast the code within the `IoSystem`'s union group, then return.
    #[default]
    Broadcast,
    /// Return the code to the caller without broadcasting.
    Return,
}

impl ErrorPolicy {
    /// Apply the policy to a locally-computed result at a public-entry
    /// boundary. `broadcast` is invoked only for [`ErrorPolicy::Broadcast`]
    /// and must itself broadcast the I/O-side code across the union group
    /// and return what every rank should see.
    ///
    /// Reference: spec.md §4.J — "Every public call threads its return code
    /// through the policy at exit... All collective calls broadcast the
    /// I/O-rank error code across the union group before returning".
    pub fn apply<F>(self, result: Result<(), PioError>, broadcast: F) -> Result<(), PioError>
    where
        F: FnOnce(i32) -> i32,
    {
        match self {
            ErrorPolicy::Internal => {
                if let Err(e) = result {
                    eprintln!("PIO: fatal error: {e} ({}), aborting", e.to_legacy_code());
                    std::process::abort();
                }
                Ok(())
            }
            ErrorPolicy::Broadcast => {
                let code = result.err().map(|e| e.to_legacy_code()).unwrap_or(0);
                let agreed = broadcast(code);
                code_to_result(agreed)
            }
            ErrorPolicy::Return => result,
        }
    }
}

/// Map a legacy integer code back to a `Result`, used after a broadcast
/// has produced the single code every rank agrees on.
pub fn code_to_result(code: i32) -> Result<(), PioError> {
    if code == 0 {
        return Ok(());
    }
    let err = match code {
        -33 => PioError::BadId,
        -36 => PioError::Invalid,
        -61 => PioError::NoMemory,
        -65 => PioError::BadIoType,
        -102 => PioError::NotChunked,
        -40 => PioError::Edge,
        -45 => PioError::BadType,
        other => PioError::Io(other),
    };
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_code_roundtrip() {
        for err in [
            PioError::BadId,
            PioError::Invalid,
            PioError::NoMemory,
            PioError::BadIoType,
            PioError::NotChunked,
            PioError::Edge,
            PioError::BadType,
        ] {
            let code = err.to_legacy_code();
            assert_eq!(code_to_result(code), Err(err));
        }
        assert_eq!(code_to_result(0), Ok(()));
    }

    #[test]
    fn test_policy_return_passes_through() {
        let result = ErrorPolicy::Return.apply(Err(PioError::Invalid), |c| c);
        assert_eq!(result, Err(PioError::Invalid));
    }

    #[test]
    fn test_policy_broadcast_uses_agreed_code() {
        // Simulate a broadcast that overrides with a different rank's error.
        let result = ErrorPolicy::Broadcast.apply(Ok(()), |_local| PioError::Edge.to_legacy_code());
        assert_eq!(result, Err(PioError::Edge));
    }

    #[test]
    fn test_policy_broadcast_ok_stays_ok() {
        let result = ErrorPolicy::Broadcast.apply(Ok(()), |local| local);
        assert_eq!(result, Ok(()));
    }
}
