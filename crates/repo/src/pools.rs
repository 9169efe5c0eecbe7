use std::path::{Path, PathBuf};

use domain::{BoxFuture, Error, Pool, PoolRepository, Result};
use serde::{Deserialize, Serialize};

use crate::document::{Document, TomlFile};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolsDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pools: Vec<Pool>,
}

impl Document for PoolsDocument {
    const KIND: &'static str = "pools";

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

pub struct TomlPoolRepository {
    file: TomlFile,
}

impl TomlPoolRepository {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            file: TomlFile::open(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl PoolRepository for TomlPoolRepository {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Pool>> {
        Box::pin(async move {
            let doc: PoolsDocument = self.file.read().await?;
            doc.pools
                .into_iter()
                .find(|p| p.id == id)
                .ok_or_else(|| Error::PoolNotFound(id.to_owned()))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Pool>>> {
        Box::pin(async move {
            let doc: PoolsDocument = self.file.read().await?;
            Ok(doc.pools)
        })
    }

    fn save<'a>(&'a self, pool: &'a Pool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            pool.validate()?;
            self.file
                .update(|doc: &mut PoolsDocument| {
                    match doc.pools.iter_mut().find(|p| p.id == pool.id) {
                        Some(existing) => *existing = pool.clone(),
                        None => doc.pools.push(pool.clone()),
                    }
                    Ok(())
                })
                .await
        })
    }
}
