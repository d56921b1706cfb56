//! One-shot ledger binding authorization `state` to its nonce and verifier.

use crate::error::{OidcError, Result};
use std::collections::HashMap;
use std::time::SystemTime;
use unrelated_sync::{AcquireOptions, Mutex};

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub nonce: String,
    pub code_verifier: Option<String>,
    pub created_at: SystemTime,
}

/// Pending-authorization ledger.
///
/// Every operation runs under one mutex, so a concurrent `add_state` /
/// `take_state` pair for the same state is totally ordered and the consume
/// path is an atomic read-delete. Entries do not expire on their own; hosts
/// reap abandoned logins with `remove_state`.
#[derive(Debug)]
pub struct StateLedger {
    lock: Mutex,
    entries: parking_lot::Mutex<HashMap<String, StateEntry>>,
}

impl StateLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: Mutex::with_name("state-ledger"),
            entries: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Record a pending authorization. A state can only be added once.
    pub async fn add_state(
        &self,
        state: &str,
        nonce: &str,
        code_verifier: Option<&str>,
    ) -> Result<()> {
        let _guard = self.lock.acquire(AcquireOptions::default()).await?;
        let mut entries = self.entries.lock();
        if entries.contains_key(state) {
            return Err(OidcError::StateAlreadyExists {
                state: state.to_string(),
            });
        }
        entries.insert(
            state.to_string(),
            StateEntry {
                nonce: nonce.to_string(),
                code_verifier: code_verifier.map(str::to_string),
                created_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Consume a pending authorization: atomic read-and-delete.
    pub async fn take_state(&self, state: &str) -> Result<StateEntry> {
        let _guard = self.lock.acquire(AcquireOptions::default()).await?;
        self.entries
            .lock()
            .remove(state)
            .ok_or(OidcError::StateMismatch)
    }

    /// Idempotent delete.
    pub async fn remove_state(&self, state: &str) -> Result<()> {
        let _guard = self.lock.acquire(AcquireOptions::default()).await?;
        self.entries.lock().remove(state);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for StateLedger {
    fn default() -> Self {
        Self::new()
    }
}
