// Warnings are errors when building on CI.
#![cfg_attr(not(debug_assertions), deny(warnings))]

mod error;

pub(crate) use error::Result;
pub use error::{Error, ErrorKind};

pub mod query;

/// The version of this query engine, as declared in `Cargo.toml`.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");
