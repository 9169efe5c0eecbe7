//! Collaborator contracts the services depend on.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility, so the
//! services hold `Arc<dyn AccountRepository>` and swap in fakes under test.

use std::future::Future;
use std::pin::Pin;

use crate::account::Account;
use crate::error::{Result, SecretResult};
use crate::pool::Pool;
use crate::runtime::PoolRuntime;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait AccountRepository: Send + Sync {
    /// Fails with [`Error::AccountNotFound`](crate::Error::AccountNotFound) when absent.
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Account>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<Account>>>;

    /// Upsert keyed by account id.
    fn save<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>>;
}

pub trait PoolRepository: Send + Sync {
    /// Fails with [`Error::PoolNotFound`](crate::Error::PoolNotFound) when absent.
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Pool>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<Pool>>>;

    fn save<'a>(&'a self, pool: &'a Pool) -> BoxFuture<'a, Result<()>>;
}

pub trait PoolRuntimeRepository: Send + Sync {
    /// Fails with [`Error::RuntimeNotFound`](crate::Error::RuntimeNotFound) when absent.
    fn get_by_pool_id<'a>(&'a self, pool_id: &'a str) -> BoxFuture<'a, Result<PoolRuntime>>;

    fn save<'a>(&'a self, runtime: &'a PoolRuntime) -> BoxFuture<'a, Result<()>>;
}

pub trait SecretStore: Send + Sync {
    /// Fails with [`SecretError::NotFound`](crate::SecretError::NotFound) for a
    /// missing key, distinct from an unavailable backend.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<String>>;

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, SecretResult<()>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<()>>;
}
