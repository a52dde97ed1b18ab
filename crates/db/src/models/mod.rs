//! Row structs for the access log tables.
//!
//! Each submodule contains `FromRow` structs matching database rows and the
//! conversions into `logwarden_core` types.

pub mod access_log;
