//! Testing utilities and mock implementations
//!
//! Lets the session engine be exercised end to end without a broker.

pub mod mocks;

pub use mocks::*;
