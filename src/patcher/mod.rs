//! # Patcher
//!
//! This module covers the memory patcher: checked reads and writes of arbitrary process memory, and
//! transactions that group writes so they can be committed or rolled back as a unit

pub mod byte;
pub mod mem;
pub mod transaction;

pub use byte::PatchLocation;
pub use mem::{check_access, read_bytes};
pub use transaction::Transaction;
