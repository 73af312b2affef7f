//! FFI result codes returned by all `atmo_*` functions.

use atmosphere_core::CoreError;

/// Result codes for the C ABI surface.
///
/// Every `atmo_*` function that returns `i32` uses these values. Host
/// consumers should check for `Ok` (0) and handle errors accordingly.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiResult {
    /// Success.
    Ok = 0,
    /// The handle does not exist in the core's handle table.
    InvalidHandle = 1,
    /// A required argument was null, not valid UTF-8, or not valid JSON.
    InvalidArgument = 2,
    /// The mesh has not been started on this handle yet.
    NotStarted = 3,
    /// The local store failed (disk full, corrupt log, ...).
    StoreFailure = 4,
    /// An internal error occurred (logged via tracing).
    Internal = 5,
}

impl From<&CoreError> for FfiResult {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::UnknownHandle => FfiResult::InvalidHandle,
            CoreError::NotStarted => FfiResult::NotStarted,
            CoreError::Local(_) => FfiResult::StoreFailure,
            CoreError::Fatal(_) => FfiResult::Internal,
        }
    }
}
