//! # audiotrack-core
//!
//! Core types and error handling shared by the audiotrack engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
