//! Testing utilities and mock implementations
//!
//! Lets the engine and the device facade run without a radio, a resolver or
//! a broker.

pub mod mocks;

pub use mocks::*;
