//! Stowage Core
//!
//! Error taxonomy and request value objects shared by the cache pipelines
//! and the command-line interface.

pub mod error;
pub mod request;

pub use error::{Error, Result, combine};
pub use request::{RestoreRequest, SaveRequest};
