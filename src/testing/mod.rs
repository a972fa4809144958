//! Testing utilities and mock implementations
//!
//! Lets the supervision and recovery machinery run against an in-memory
//! broker instead of a live RabbitMQ instance.

pub mod mocks;

pub use mocks::*;
