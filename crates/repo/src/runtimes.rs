use std::path::{Path, PathBuf};

use domain::{BoxFuture, Error, PoolRuntime, PoolRuntimeRepository, Result};
use serde::{Deserialize, Serialize};

use crate::document::{Document, TomlFile};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RuntimesDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    runtimes: Vec<PoolRuntime>,
}

impl Document for RuntimesDocument {
    const KIND: &'static str = "pool runtime";

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

pub struct TomlPoolRuntimeRepository {
    file: TomlFile,
}

impl TomlPoolRuntimeRepository {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            file: TomlFile::open(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl PoolRuntimeRepository for TomlPoolRuntimeRepository {
    fn get_by_pool_id<'a>(&'a self, pool_id: &'a str) -> BoxFuture<'a, Result<PoolRuntime>> {
        Box::pin(async move {
            let doc: RuntimesDocument = self.file.read().await?;
            doc.runtimes
                .into_iter()
                .find(|r| r.pool_id == pool_id)
                .ok_or_else(|| Error::RuntimeNotFound(pool_id.to_owned()))
        })
    }

    fn save<'a>(&'a self, runtime: &'a PoolRuntime) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if runtime.pool_id.trim().is_empty() {
                return Err(Error::Validation("pool runtime pool id is required".into()));
            }
            self.file
                .update(|doc: &mut RuntimesDocument| {
                    match doc.runtimes.iter_mut().find(|r| r.pool_id == runtime.pool_id) {
                        Some(existing) => *existing = runtime.clone(),
                        None => doc.runtimes.push(runtime.clone()),
                    }
                    Ok(())
                })
                .await
        })
    }
}
