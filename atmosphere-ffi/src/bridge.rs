//! C ABI surface, split out from `lib.rs` the way the rest of this crate's
//! predecessor kept its exported functions apart from runtime plumbing.

pub mod abi;
