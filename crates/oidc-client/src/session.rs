//! Session-store contract consumed by hosts.
//!
//! The library never persists sessions itself; hosts hand claims and token
//! sets to whatever store backs their framework. Implementations must be
//! thread-safe.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create or replace the session `sid`.
    async fn set(&self, sid: &str, data: Value) -> Result<()>;

    /// Fetch a session, `None` when absent or expired.
    async fn get(&self, sid: &str) -> Result<Option<Value>>;

    /// Remove a session; absent sessions are not an error.
    async fn destroy(&self, sid: &str) -> Result<()>;

    /// Refresh a session's idle timer, updating its data.
    async fn touch(&self, sid: &str, data: Value) -> Result<()>;
}
