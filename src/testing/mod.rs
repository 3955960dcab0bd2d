//! Testing infrastructure
//!
//! A scripted in-memory transport and race proof harnesses for the release
//! and cancellation paths.

pub mod mock_transport;
pub mod race_proof;

pub use mock_transport::{MockCounters, MockResponse, MockTransport};
pub use race_proof::*;
