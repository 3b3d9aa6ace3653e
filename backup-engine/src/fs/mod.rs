//! Local filesystem helpers.

pub mod persist;

pub use persist::write_atomic;
