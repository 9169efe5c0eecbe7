//! In-memory port implementations with failure injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use domain::{
    Account, AccountRepository, BoxFuture, Error, Pool, PoolRepository, PoolRuntime,
    PoolRuntimeRepository, Result, SecretError, SecretResult, SecretStore,
};

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

#[derive(Default)]
pub(crate) struct MemoryAccounts {
    accounts: Mutex<BTreeMap<String, Account>>,
    saves: AtomicUsize,
    failing_saves: Mutex<HashSet<usize>>,
}

impl MemoryAccounts {
    pub(crate) fn with(accounts: impl IntoIterator<Item = Account>) -> Self {
        let store = Self::default();
        for account in accounts {
            store
                .accounts
                .lock()
                .unwrap()
                .insert(account.id.clone(), account);
        }
        store
    }

    /// Fail the `n`th call to `save`, counting from 1.
    pub(crate) fn fail_save(&self, n: usize) {
        self.failing_saves.lock().unwrap().insert(n);
    }

    pub(crate) fn get(&self, id: &str) -> Option<Account> {
        self.accounts.lock().unwrap().get(id).cloned()
    }
}

impl AccountRepository for MemoryAccounts {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Account>> {
        Box::pin(async move {
            self.get(id)
                .ok_or_else(|| Error::AccountNotFound(id.to_owned()))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move { Ok(self.accounts.lock().unwrap().values().cloned().collect()) })
    }

    fn save<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let n = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing_saves.lock().unwrap().contains(&n) {
                return Err(Error::Storage(format!("injected save failure #{n}")));
            }
            self.accounts
                .lock()
                .unwrap()
                .insert(account.id.clone(), account.clone());
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct MemoryPools {
    pools: Mutex<BTreeMap<String, Pool>>,
}

impl PoolRepository for MemoryPools {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Pool>> {
        Box::pin(async move {
            self.pools
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| Error::PoolNotFound(id.to_owned()))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Pool>>> {
        Box::pin(async move { Ok(self.pools.lock().unwrap().values().cloned().collect()) })
    }

    fn save<'a>(&'a self, pool: &'a Pool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            pool.validate()?;
            self.pools
                .lock()
                .unwrap()
                .insert(pool.id.clone(), pool.clone());
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct MemoryRuntimes {
    runtimes: Mutex<BTreeMap<String, PoolRuntime>>,
    pub(crate) saves: AtomicUsize,
}

impl PoolRuntimeRepository for MemoryRuntimes {
    fn get_by_pool_id<'a>(&'a self, pool_id: &'a str) -> BoxFuture<'a, Result<PoolRuntime>> {
        Box::pin(async move {
            self.runtimes
                .lock()
                .unwrap()
                .get(pool_id)
                .cloned()
                .ok_or_else(|| Error::RuntimeNotFound(pool_id.to_owned()))
        })
    }

    fn save<'a>(&'a self, runtime: &'a PoolRuntime) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.runtimes
                .lock()
                .unwrap()
                .insert(runtime.pool_id.clone(), runtime.clone());
            Ok(())
        })
    }
}

#[derive(Default)]
pub(crate) struct MemorySecrets {
    values: Mutex<HashMap<String, String>>,
    failing_puts: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl MemorySecrets {
    pub(crate) fn with(values: &[(&str, &str)]) -> Self {
        let store = Self::default();
        for (k, v) in values {
            store
                .values
                .lock()
                .unwrap()
                .insert((*k).to_owned(), (*v).to_owned());
        }
        store
    }

    pub(crate) fn fail_put(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_owned());
    }

    pub(crate) fn fail_delete(&self, key: &str) {
        self.failing_deletes.lock().unwrap().insert(key.to_owned());
    }

    pub(crate) fn value(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.value(key).is_some()
    }
}

impl SecretStore for MemorySecrets {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<String>> {
        Box::pin(async move {
            self.value(key)
                .ok_or_else(|| SecretError::NotFound(key.to_owned()))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            if self.failing_puts.lock().unwrap().contains(key) {
                return Err(SecretError::Backend(format!("injected put failure for {key}")));
            }
            self.values
                .lock()
                .unwrap()
                .insert(key.to_owned(), value.to_owned());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            if self.failing_deletes.lock().unwrap().contains(key) {
                return Err(SecretError::Backend(format!(
                    "injected delete failure for {key}"
                )));
            }
            self.values.lock().unwrap().remove(key);
            Ok(())
        })
    }
}
