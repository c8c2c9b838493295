//! Common utilities and shared types for vigil-rs.
//!
//! This crate provides foundational components used across all vigil-rs
//! crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Cryptography**: Secret encryption and keyed code digests
//! - **ID Generation**: ULID-based unique identifiers via [`IdGenerator`]
//! - **Security events**: Append-only audit records and sinks

pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod id;

pub use config::Config;
pub use crypto::SecretCipher;
pub use error::{AppError, AppResult};
pub use events::{CapturingEventSink, SecurityEvent, SecurityEventSink, TracingEventSink};
pub use id::IdGenerator;
