//! Owner-only filesystem helpers for credential-bearing files.
//!
//! Writes go to a temporary file in the destination directory and are then
//! renamed over the target, so a crash mid-write never leaves a truncated
//! file and readers only ever see the old or the new contents.

use std::io;
use std::path::Path;

use tracing::debug;

pub const PRIVATE_DIR_MODE: u32 = 0o700;
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Create `dir` and any missing parents, owner-only on unix.
pub async fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(PRIVATE_DIR_MODE);
    builder.create(dir).await
}

/// Atomically replace `path` with `contents`, file mode 0600 on unix.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other(format!("{} has no parent directory", path.display())))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other(format!("{} has no file name", path.display())))?;
    create_private_dir(dir).await?;

    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        file_name.to_string_lossy(),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(PRIVATE_FILE_MODE);
        if let Err(e) = tokio::fs::set_permissions(&tmp_path, perms).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), bytes = contents.len(), "replaced file atomically");
    Ok(())
}
