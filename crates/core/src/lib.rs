//! Core security services for vigil-rs.
//!
//! The trust and access-control layer: multi-factor authentication,
//! WebAuthn/passkey ceremonies, role-based access control and risk-scored
//! threat detection. Each service is constructed once per process with an
//! injected [`CredentialStore`](vigil_store::CredentialStore) and
//! [`SecurityEventSink`](vigil_common::SecurityEventSink); the services
//! themselves hold no mutable state, so any number of instances can run
//! against the same store.

pub mod services;

pub use services::*;
