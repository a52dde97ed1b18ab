//! Domain core for access-log ingestion and security analytics.
//!
//! Everything in this crate is pure: no database, no file system, no async
//! runtime. The [`store::LogStore`] trait is the seam where storage engines
//! plug in.

pub mod catalog;
pub mod error;
pub mod parser;
pub mod record;
pub mod schema;
pub mod store;
pub mod types;
pub mod variant;
