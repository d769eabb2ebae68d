//! Core types and traits for IL2CPP recovery
//!
//! This crate provides the foundational types shared by the binary decoders,
//! the recovery pipeline and the command line front-end.

pub mod error;
pub mod types;
pub mod config;

pub use error::{Error, Result};
pub use types::*;
pub use config::{Config, OutputConfig};
