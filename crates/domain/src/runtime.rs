//! Per-pool rotation state and cross-account session ledgers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;
use crate::pool::PoolId;

/// Carried across account switches so work can resume on another account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPacket {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub pending_tasks: Vec<String>,
    #[serde(default)]
    pub last_code_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLedger {
    pub logical_session_id: String,
    /// Account id to provider session id. Entries are never reassigned.
    #[serde(default)]
    pub account_sessions: BTreeMap<AccountId, String>,
    #[serde(default)]
    pub memory: MemoryPacket,
}

impl SessionLedger {
    pub fn new(logical_session_id: impl Into<String>) -> Self {
        Self {
            logical_session_id: logical_session_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRuntime {
    pub pool_id: PoolId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_account_id: Option<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Keyed by logical session id.
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionLedger>,
}

impl PoolRuntime {
    pub fn new(pool_id: impl Into<PoolId>) -> Self {
        Self {
            pool_id: pool_id.into(),
            ..Self::default()
        }
    }

    /// The ledger for `logical_session_id`, created empty if missing.
    pub fn ledger_mut(&mut self, logical_session_id: &str) -> &mut SessionLedger {
        self.sessions
            .entry(logical_session_id.to_owned())
            .or_insert_with(|| SessionLedger::new(logical_session_id))
    }
}
