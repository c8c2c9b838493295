//! Credential store abstraction for vigil-rs.
//!
//! The security services never talk to Redis directly; they depend on the
//! [`CredentialStore`] trait, which exposes the small set of primitives
//! the trust layer needs: hash fields, sets, lists, counters and
//! TTL-bound strings. Two implementations are provided:
//!
//! - [`RedisCredentialStore`] — the production backend (fred). TTLs are
//!   enforced by Redis expiry, so challenge expiration stays correct
//!   across process restarts, and set removal is atomic across service
//!   instances.
//! - [`MemoryCredentialStore`] — a mutex-guarded in-process backend for
//!   unit tests and single-process deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use vigil_common::AppResult;

pub mod memory;
pub mod redis;
pub mod sink;

pub use memory::MemoryCredentialStore;
pub use redis::RedisCredentialStore;
pub use sink::StoreEventSink;

/// Persistent key-value primitives used by the security services.
///
/// All cross-request coordination happens through these operations; the
/// services hold no mutable state of their own, so multiple instances
/// can run against the same store concurrently.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    // === Strings ===

    /// Get a string value.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Set a string value without expiry.
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// Set a string value that expires after `ttl_secs`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> AppResult<()>;

    /// Atomically get and delete a value.
    ///
    /// This is the single-consumption primitive for ceremony challenges:
    /// of two concurrent callers, at most one observes the value.
    async fn take(&self, key: &str) -> AppResult<Option<String>>;

    /// Delete a key of any type. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> AppResult<()>;

    // === Hashes ===

    /// Get a single hash field.
    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>>;

    /// Set one or more hash fields.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> AppResult<()>;

    /// Get all fields of a hash. Missing key yields an empty map.
    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>>;

    /// Delete a single hash field.
    async fn hash_delete_field(&self, key: &str, field: &str) -> AppResult<()>;

    // === Sets ===

    /// Add members to a set.
    async fn set_add(&self, key: &str, members: &[String]) -> AppResult<()>;

    /// Atomically remove a member, returning whether it was present.
    ///
    /// This is the compare-and-remove primitive for backup-code
    /// redemption: of two concurrent removals of the same member,
    /// exactly one returns `true`.
    async fn set_remove(&self, key: &str, member: &str) -> AppResult<bool>;

    /// Check set membership.
    async fn set_contains(&self, key: &str, member: &str) -> AppResult<bool>;

    /// All members of a set. Missing key yields an empty list.
    async fn set_members(&self, key: &str) -> AppResult<Vec<String>>;

    /// Number of members in a set.
    async fn set_len(&self, key: &str) -> AppResult<u64>;

    // === Lists ===

    /// Prepend a value to a list.
    async fn list_push(&self, key: &str, value: &str) -> AppResult<()>;

    /// Trim a list to the given inclusive range (negative indices count
    /// from the end, as in Redis `LTRIM`).
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> AppResult<()>;

    /// Read the given inclusive range of a list.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>>;

    // === Counters ===

    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> AppResult<i64>;

    /// Set a key's time-to-live.
    async fn expire(&self, key: &str, ttl_secs: i64) -> AppResult<()>;
}
