//! Primary/fallback routing for secret operations
//!
//! Every operation goes to the primary first. Any primary failure other than
//! cancellation or deadline retries the same operation on the fallback; the
//! fallback is never touched when the primary succeeds. When both fail the
//! returned [`SecretError::Chain`] carries both causes.

use std::sync::Arc;

use domain::{BoxFuture, SecretError, SecretResult, SecretStore};
use tracing::warn;

pub struct ChainSecretStore {
    primary: Arc<dyn SecretStore>,
    fallback: Arc<dyn SecretStore>,
}

impl ChainSecretStore {
    pub fn new(primary: Arc<dyn SecretStore>, fallback: Arc<dyn SecretStore>) -> Self {
        Self { primary, fallback }
    }
}

fn note_fallback(op: &'static str, key: &str, primary: &SecretError) {
    warn!(op, key, error = %primary, "primary secret backend failed, using fallback");
    metrics::counter!("oa_secret_fallback_total", "op" => op).increment(1);
}

fn chained(op: &'static str, primary: SecretError, fallback: SecretError) -> SecretError {
    SecretError::Chain {
        op,
        primary: Box::new(primary),
        fallback: Box::new(fallback),
    }
}

impl SecretStore for ChainSecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<String>> {
        Box::pin(async move {
            match self.primary.get(key).await {
                Ok(value) => Ok(value),
                Err(primary) if primary.is_cancellation() => Err(primary),
                Err(primary) => {
                    note_fallback("get", key, &primary);
                    self.fallback
                        .get(key)
                        .await
                        .map_err(|fallback| chained("get", primary, fallback))
                }
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            match self.primary.put(key, value).await {
                Ok(()) => Ok(()),
                Err(primary) if primary.is_cancellation() => Err(primary),
                Err(primary) => {
                    note_fallback("put", key, &primary);
                    self.fallback
                        .put(key, value)
                        .await
                        .map_err(|fallback| chained("put", primary, fallback))
                }
            }
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            match self.primary.delete(key).await {
                Ok(()) => Ok(()),
                Err(primary) if primary.is_cancellation() => Err(primary),
                Err(primary) => {
                    note_fallback("delete", key, &primary);
                    self.fallback
                        .delete(key)
                        .await
                        .map_err(|fallback| chained("delete", primary, fallback))
                }
            }
        })
    }
}
