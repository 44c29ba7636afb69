//! Command-line front end for MPF remote storage.
//!
//! Stores outputs and artifacts through [`mpf_storage::StorageRouter`],
//! copies stored results between buckets and downloads media from S3.
//! Job properties come from the environment and `--prop KEY=VALUE` flags.

pub mod app;
pub mod cli;

pub use app::{run, LayeredProperties, Report, StoreApp};
pub use cli::{Cli, Command};
