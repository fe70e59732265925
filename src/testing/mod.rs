//! Testing utilities
//!
//! An in-memory messenger so the client can be exercised without a broker.

pub mod mocks;

pub use mocks::*;
