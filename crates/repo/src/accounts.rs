use std::path::{Path, PathBuf};

use domain::{Account, AccountRepository, BoxFuture, Error, Result};
use serde::{Deserialize, Serialize};

use crate::document::{Document, TomlFile};

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    accounts: Vec<Account>,
}

impl Document for AccountsDocument {
    const KIND: &'static str = "accounts";

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}

/// Accounts stored as `[[accounts]]` entries in one TOML file.
pub struct TomlAccountRepository {
    file: TomlFile,
}

impl TomlAccountRepository {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            file: TomlFile::open(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl AccountRepository for TomlAccountRepository {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Account>> {
        Box::pin(async move {
            let doc: AccountsDocument = self.file.read().await?;
            doc.accounts
                .into_iter()
                .find(|a| a.id == id)
                .ok_or_else(|| Error::AccountNotFound(id.to_owned()))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let doc: AccountsDocument = self.file.read().await?;
            Ok(doc.accounts)
        })
    }

    fn save<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if account.id.trim().is_empty() {
                return Err(Error::Validation("account id is required".into()));
            }
            self.file
                .update(|doc: &mut AccountsDocument| {
                    match doc.accounts.iter_mut().find(|a| a.id == account.id) {
                        Some(existing) => *existing = account.clone(),
                        None => doc.accounts.push(account.clone()),
                    }
                    Ok(())
                })
                .await
        })
    }
}
