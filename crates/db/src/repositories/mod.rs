//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept a pool or connection as the first argument.

pub mod access_log_repo;

pub use access_log_repo::AccessLogRepo;
