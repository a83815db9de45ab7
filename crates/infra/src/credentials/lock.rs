use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use mirrorline_core::Principal;

use super::CredentialError;

const MIN_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(400);

/// Cross-process refresh lock: an advisory exclusive lock on
/// `<dir>/<principal>.lock`.
///
/// The blocking `flock` calls run on the blocking thread pool; waiting
/// between attempts is an async sleep.
#[derive(Debug, Clone)]
pub struct RefreshLock {
    dir: PathBuf,
    timeout: Duration,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct RefreshGuard {
    file: File,
    path: PathBuf,
}

impl RefreshGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %err, "failed to unlock refresh lock");
        }
    }
}

impl RefreshLock {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn path_for(&self, principal: &Principal) -> PathBuf {
        let name: String = principal
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.lock"))
    }

    /// Acquire the lock for `principal`, polling with backoff until
    /// `timeout` elapses.
    pub async fn acquire(&self, principal: &Principal) -> Result<RefreshGuard, CredentialError> {
        let path = self.path_for(principal);
        let started = Instant::now();
        let mut backoff = MIN_BACKOFF;

        loop {
            let attempt_path = path.clone();
            let file = tokio::task::spawn_blocking(move || try_lock(&attempt_path))
                .await
                .map_err(|e| CredentialError::Lock(e.to_string()))??;

            if let Some(file) = file {
                return Ok(RefreshGuard { file, path });
            }
            if started.elapsed() >= self.timeout {
                return Err(CredentialError::LockTimeout {
                    path: path.display().to_string(),
                });
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

fn try_lock(path: &Path) -> Result<Option<File>, CredentialError> {
    let io_err = |e: std::io::Error| CredentialError::Lock(format!("{}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(io_err)?;

    match fs2::FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(file)),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(e) => Err(io_err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RefreshLock::new(dir.path(), Duration::from_millis(100));
        let principal = Principal::new("mirror-bot");

        let guard = lock.acquire(&principal).await.unwrap();
        assert!(guard.path().ends_with("mirror-bot.lock"));

        let err = lock.acquire(&principal).await.unwrap_err();
        assert!(matches!(err, CredentialError::LockTimeout { .. }));

        drop(guard);
        lock.acquire(&principal).await.unwrap();
    }

    #[test]
    fn lock_file_names_are_sanitized() {
        let lock = RefreshLock::new("/tmp/locks", Duration::from_secs(1));
        assert_eq!(
            lock.path_for(&Principal::new("bot@lemmy.world/x")),
            PathBuf::from("/tmp/locks/bot_lemmy.world_x.lock")
        );
    }
}
