//! Session continuity across account switches.
//!
//! A logical session is one workspace and terminal window. Each account
//! that serves it gets its own provider session id, derived from the
//! logical id and the account id, so re-attaching is idempotent without
//! any counter. The memory packet travels with the logical session.

use std::fmt::Write as _;
use std::sync::Arc;

use domain::{AccountId, Clock, MemoryPacket, PoolRuntime, PoolRuntimeRepository, SessionLedger};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;

/// SHA-256 hex of the trimmed workspace root and window fingerprint.
pub fn resolve_logical_session_id(workspace_root: &str, window_fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(workspace_root.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(window_fingerprint.trim().as_bytes());
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}

pub fn provider_session_id(logical_session_id: &str, account_id: &str) -> String {
    format!("{logical_session_id}:{account_id}")
}

fn required(value: &str, what: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(domain::Error::Validation(format!("{what} is required")).into());
    }
    Ok(value.to_owned())
}

/// The only writer of pool runtimes.
pub struct SessionService {
    runtimes: Arc<dyn PoolRuntimeRepository>,
    clock: Arc<dyn Clock>,
    // One read-modify-write of a runtime at a time.
    write: Mutex<()>,
}

impl SessionService {
    pub fn new(runtimes: Arc<dyn PoolRuntimeRepository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            runtimes,
            clock,
            write: Mutex::new(()),
        }
    }

    async fn load_or_init(&self, pool_id: &str) -> Result<PoolRuntime> {
        match self.runtimes.get_by_pool_id(pool_id).await {
            Ok(runtime) => Ok(runtime),
            Err(domain::Error::RuntimeNotFound(_)) => {
                debug!(pool_id, "initializing pool runtime");
                Ok(PoolRuntime::new(pool_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The provider session id for `account_id` in this logical session,
    /// and whether it was minted by this call.
    pub async fn get_or_attach_account_session(
        &self,
        pool_id: &str,
        logical_session_id: &str,
        account_id: &str,
    ) -> Result<(String, bool)> {
        let pool_id = required(pool_id, "pool id")?;
        let logical = required(logical_session_id, "logical session id")?;
        let account_id = required(account_id, "account id")?;

        let _guard = self.write.lock().await;
        let mut runtime = self.load_or_init(&pool_id).await?;

        if let Some(existing) = runtime
            .sessions
            .get(&logical)
            .and_then(|ledger| ledger.account_sessions.get(&account_id))
            .filter(|id| !id.is_empty())
        {
            return Ok((existing.clone(), false));
        }

        let session_id = provider_session_id(&logical, &account_id);
        runtime
            .ledger_mut(&logical)
            .account_sessions
            .insert(account_id.clone(), session_id.clone());
        runtime.active_account_id = Some(account_id.clone());
        runtime.last_synced_at = Some(self.clock.now());
        self.runtimes.save(&runtime).await?;

        info!(
            pool_id = %pool_id,
            account_id = %account_id,
            logical_session_id = %logical,
            "attached account session"
        );
        Ok((session_id, true))
    }

    /// Replace the memory packet of a logical session, stamping it now.
    pub async fn update_memory_packet(
        &self,
        pool_id: &str,
        logical_session_id: &str,
        memory: MemoryPacket,
    ) -> Result<SessionLedger> {
        let pool_id = required(pool_id, "pool id")?;
        let logical = required(logical_session_id, "logical session id")?;

        let _guard = self.write.lock().await;
        let mut runtime = self.load_or_init(&pool_id).await?;
        let now = self.clock.now();
        let ledger = runtime.ledger_mut(&logical);
        ledger.memory = MemoryPacket {
            updated_at: Some(now),
            ..memory
        };
        let ledger = ledger.clone();
        runtime.last_synced_at = Some(now);
        self.runtimes.save(&runtime).await?;
        Ok(ledger)
    }

    pub async fn ledger(
        &self,
        pool_id: &str,
        logical_session_id: &str,
    ) -> Result<Option<SessionLedger>> {
        let runtime = self.load_or_init(pool_id.trim()).await?;
        Ok(runtime.sessions.get(logical_session_id.trim()).cloned())
    }

    /// `None` for a pool that never had a runtime.
    pub async fn active_account_id(&self, pool_id: &str) -> Result<Option<AccountId>> {
        Ok(self.load_or_init(pool_id.trim()).await?.active_account_id)
    }

    pub async fn set_active_account_id(&self, pool_id: &str, account_id: &str) -> Result<()> {
        let pool_id = required(pool_id, "pool id")?;
        let account_id = required(account_id, "account id")?;

        let _guard = self.write.lock().await;
        let mut runtime = self.load_or_init(&pool_id).await?;
        runtime.active_account_id = Some(account_id.clone());
        runtime.last_synced_at = Some(self.clock.now());
        self.runtimes.save(&runtime).await?;
        info!(pool_id = %pool_id, account_id = %account_id, "active account set");
        Ok(())
    }
}
