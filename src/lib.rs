//! CertChain - a permissioned certificate ledger gated by a credit-token economy
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`hash`] - SHA-256 helpers and block hashing
//! - [`blockchain`] - Blocks, the chain and its validation rules
//! - [`credit`] - Credit tokens, the ledger and the audited bank
//!
//! ## Node
//! - [`node`] - A single node: chain, ledger and bank under one set of locks
//! - [`sync`] - Peer registry, HTTP transport and chain/wallet reconciliation
//! - [`persistence`] - File, SQLite and in-memory stores
//! - [`api`] - HTTP endpoints (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod credit;
pub mod hash;

// ============================================================================
// Node
// ============================================================================
pub mod node;
pub mod persistence;
pub mod sync;

#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
