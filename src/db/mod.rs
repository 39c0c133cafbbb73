//! Database module: row mapping and SQL repositories.
//!
//! - `model`: maps SQLite rows into the domain records in `crate::model`.
//! - `repo`: SQL-only functions for pages and their assets.
//!
//! External modules should import from `tilda_mirror::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;
