//! One file per secret under a private root directory.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use domain::{BoxFuture, SecretError, SecretResult, SecretStore};
use tokio::sync::RwLock;
use tracing::debug;

pub struct FileSecretStore {
    root: PathBuf,
    lock: RwLock<()>,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to a path under the root. Keys are relative paths; anything
    /// that could escape the root is rejected.
    fn path_for(&self, key: &str) -> SecretResult<PathBuf> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(invalid(key, "key is empty"));
        }

        let mut relative = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(invalid(key, "key escapes the secrets directory"));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid(key, "key must be relative"));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(invalid(key, "key names no file"));
        }
        Ok(self.root.join(relative))
    }
}

fn invalid(key: &str, reason: &str) -> SecretError {
    SecretError::InvalidKey {
        key: key.to_owned(),
        reason: reason.to_owned(),
    }
}

impl SecretStore for FileSecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<String>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let _guard = self.lock.read().await;
            match tokio::fs::read_to_string(&path).await {
                Ok(value) => Ok(value),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(SecretError::NotFound(key.to_owned()))
                }
                Err(e) => Err(SecretError::Backend(format!(
                    "read file secret {key:?}: {e}"
                ))),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let _guard = self.lock.write().await;
            common::fs::write_atomic(&path, value.as_bytes())
                .await
                .map_err(|e| SecretError::Backend(format!("write file secret {key:?}: {e}")))?;
            debug!(key, "stored file secret");
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let _guard = self.lock.write().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(key, "deleted file secret");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(SecretError::Backend(format!(
                    "delete file secret {key:?}: {e}"
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets"));

        store
            .put("openai://acc-1/oauth_tokens", "{\"access_token\":\"a\"}")
            .await
            .unwrap();
        assert_eq!(
            store.get("openai://acc-1/oauth_tokens").await.unwrap(),
            "{\"access_token\":\"a\"}"
        );

        store.delete("openai://acc-1/oauth_tokens").await.unwrap();
        let err = store.get("openai://acc-1/oauth_tokens").await.unwrap_err();
        assert!(err.is_not_found(), "got: {err}");
    }

    #[tokio::test]
    async fn put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());
        store.put("k", "one").await.unwrap();
        store.put("k", "two").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), "two");
    }

    #[tokio::test]
    async fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path());
        store.delete("never/written").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("root"));
        for key in ["", "  ", ".", "../outside", "a/../../b", "/etc/passwd"] {
            let err = store.put(key, "x").await.unwrap_err();
            assert!(
                matches!(err, SecretError::InvalidKey { .. }),
                "key {key:?} should be rejected, got: {err}"
            );
        }
        assert!(!dir.path().join("outside").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets"));
        store.put("acc/api_key", "sk-test").await.unwrap();

        let path = dir.path().join("secrets/acc/api_key");
        let mode = std::fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
