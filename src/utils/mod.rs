//! The `utils` module provides the pieces shared by every other module of
//! `svclink`: the crate-wide error type with its severity classification, and
//! logging initialization.

pub mod error;
pub mod logging;

pub use error::{Error, Result, ResultExt, Severity};

#[cfg(test)]
mod tests;
