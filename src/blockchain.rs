// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// block structure, chain management and structural validation.

pub mod core;
pub use core::*;
