//! Versioned TOML documents and the locked load/modify/replace cycle.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use domain::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::debug;

use crate::locks::{lock_for, lock_key};

pub const CURRENT_VERSION: u32 = 1;

/// A top-level TOML document with a schema version.
pub(crate) trait Document: Serialize + DeserializeOwned + Default {
    const KIND: &'static str;

    fn version(&self) -> u32;

    fn set_version(&mut self, version: u32);
}

pub(crate) struct TomlFile {
    path: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl TomlFile {
    pub(crate) fn open(path: PathBuf) -> Self {
        let path = lock_key(&path);
        let lock = lock_for(&path);
        Self { path, lock }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn read<D: Document>(&self) -> Result<D> {
        let _guard = self.lock.read().await;
        load(&self.path).await
    }

    /// Load, apply `f`, and atomically replace the file if `f` succeeds.
    pub(crate) async fn update<D, T, F>(&self, f: F) -> Result<T>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<T>,
    {
        let _guard = self.lock.write().await;
        let mut doc: D = load(&self.path).await?;
        let out = f(&mut doc)?;
        doc.set_version(CURRENT_VERSION);
        store(&self.path, &doc).await?;
        Ok(out)
    }
}

async fn load<D: Document>(path: &Path) -> Result<D> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(D::default()),
        Err(e) => {
            return Err(Error::Storage(format!(
                "read {} file {}: {e}",
                D::KIND,
                path.display()
            )));
        }
    };

    let doc: D = toml::from_str(&contents).map_err(|e| {
        Error::Storage(format!("parse {} file {}: {e}", D::KIND, path.display()))
    })?;
    if doc.version() > CURRENT_VERSION {
        return Err(Error::Storage(format!(
            "{} file {} has unsupported schema version {} (newest supported is {CURRENT_VERSION})",
            D::KIND,
            path.display(),
            doc.version()
        )));
    }
    Ok(doc)
}

async fn store<D: Document>(path: &Path, doc: &D) -> Result<()> {
    let contents = toml::to_string_pretty(doc)
        .map_err(|e| Error::Storage(format!("serialize {} file: {e}", D::KIND)))?;
    common::fs::write_atomic(path, contents.as_bytes())
        .await
        .map_err(|e| Error::Storage(format!("write {} file {}: {e}", D::KIND, path.display())))?;
    debug!(kind = D::KIND, path = %path.display(), "saved document");
    Ok(())
}
