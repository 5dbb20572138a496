//! Common utilities for tideway
//!
//! This crate provides the error type shared by the executor and the client.

pub mod error;

pub use error::{Result, TidewayError};
