//! Secrets held by the `pass` password manager, driven as a subprocess.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use domain::{BoxFuture, SecretError, SecretResult, SecretStore};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_PROGRAM: &str = "pass";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const NOT_IN_STORE: &str = "is not in the password store";

pub struct PassSecretStore {
    program: PathBuf,
    timeout: Duration,
}

impl Default for PassSecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PassSecretStore {
    pub fn new() -> Self {
        Self::with_program(DEFAULT_PROGRAM)
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound on each subprocess invocation. The child is killed when exceeded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(
        &self,
        op: &'static str,
        key: &str,
        input: Option<&str>,
        args: &[&str],
    ) -> SecretResult<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SecretError::Unavailable(format!("{} not found", self.program.display()))
            } else {
                SecretError::Backend(format!("spawn {}: {e}", self.program.display()))
            }
        })?;

        let interaction = async move {
            if let Some(input) = input {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(input.as_bytes()).await?;
                    stdin.shutdown().await?;
                }
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, interaction).await {
            Ok(result) => result
                .map_err(|e| SecretError::Backend(format!("pass {op} {key:?}: {e}")))?,
            // A hung `pass` (say, gpg waiting on pinentry) is a backend failure,
            // not a caller deadline, so the chain may still use its fallback.
            Err(_) => {
                return Err(SecretError::Backend(format!(
                    "pass {op} {key:?}: timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if stderr.contains(NOT_IN_STORE) {
                return Err(SecretError::NotFound(key.to_owned()));
            }
            return Err(SecretError::Backend(if stderr.is_empty() {
                format!("pass {op} {key:?}: {}", output.status)
            } else {
                format!("pass {op} {key:?}: {}: {stderr}", output.status)
            }));
        }

        debug!(op, key, "pass command succeeded");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SecretStore for PassSecretStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<String>> {
        Box::pin(async move {
            let stdout = self.run("get", key, None, &["show", key]).await?;
            let value = stdout.strip_suffix('\n').unwrap_or(&stdout);
            let value = value.strip_suffix('\r').unwrap_or(value);
            Ok(value.to_owned())
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            let input = format!("{value}\n");
            self.run("put", key, Some(&input), &["insert", "-m", "-f", key])
                .await
                .map(|_| ())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, SecretResult<()>> {
        Box::pin(async move {
            self.run("delete", key, None, &["rm", "-f", key])
                .await
                .map(|_| ())
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A stand-in for `pass` that keeps entries as plain files next to itself.
    const FAKE_PASS: &str = r#"#!/bin/sh
store="$(dirname "$0")/store"
case "$1" in
  insert)
    shift 3
    mkdir -p "$store/$(dirname "$1")"
    cat > "$store/$1"
    ;;
  show)
    if [ -f "$store/$2" ]; then
      cat "$store/$2"
    else
      echo "Error: $2 is not in the password store." >&2
      exit 1
    fi
    ;;
  rm)
    shift 2
    rm -f "$store/$1"
    ;;
  *)
    echo "unknown command $1" >&2
    exit 2
    ;;
esac
"#;

    fn install_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("pass");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn round_trips_through_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let store = PassSecretStore::with_program(install_script(dir.path(), FAKE_PASS));

        store.put("acc-1/api_key", "sk-test").await.unwrap();
        assert_eq!(store.get("acc-1/api_key").await.unwrap(), "sk-test");

        store.delete("acc-1/api_key").await.unwrap();
        let err = store.get("acc-1/api_key").await.unwrap_err();
        assert!(err.is_not_found(), "got: {err}");
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let store = PassSecretStore::with_program("/nonexistent/bin/pass");
        let err = store.get("anything").await.unwrap_err();
        assert!(matches!(err, SecretError::Unavailable(_)), "got: {err}");
        assert!(!err.is_cancellation());
    }

    #[tokio::test]
    async fn other_failures_carry_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = install_script(dir.path(), "#!/bin/sh\necho 'gpg: decryption failed' >&2\nexit 2\n");
        let store = PassSecretStore::with_program(script);
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, SecretError::Backend(_)));
        assert!(err.to_string().contains("gpg: decryption failed"), "got: {err}");
    }

    #[tokio::test]
    async fn slow_command_times_out_as_backend_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = install_script(dir.path(), "#!/bin/sh\nsleep 5\n");
        let store =
            PassSecretStore::with_program(script).with_timeout(Duration::from_millis(100));
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, SecretError::Backend(_)), "got: {err}");
        assert!(err.to_string().contains("timed out"), "got: {err}");
        assert!(!err.is_cancellation());
    }
}
