//! Configuration
//!
//! Config loading, environment overrides, validation and shared types.

pub mod config;
pub mod types;
pub mod validator;
