//! Blocking work and cancellation plumbing shared by both pipelines.

use crate::error::{BackupError, Result};
use std::io::{self, Read};
use tokio_util::sync::CancellationToken;

/// Fail with `Cancelled` once the token has fired
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(BackupError::Cancelled)
    } else {
        Ok(())
    }
}

/// Report a failure caused by cancellation as `Cancelled`
pub(crate) fn cancelled_or(cancel: &CancellationToken, err: BackupError) -> BackupError {
    if cancel.is_cancelled() {
        BackupError::Cancelled
    } else {
        err
    }
}

/// Run file or CPU bound work on the blocking pool and wait for it.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Io(io::Error::other(e)))?
}

/// Like [`run_blocking`], but stop waiting as soon as `cancel` fires.
///
/// Only for work without side effects, such as key derivation; the
/// abandoned task runs to completion in the background.
pub(crate) async fn run_blocking_abandonable<T, F>(cancel: &CancellationToken, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        result = run_blocking(f) => result,
    }
}

/// Reader that fails once the token fires, stopping long copies between reads
pub(crate) struct CancelAwareReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R> CancelAwareReader<R> {
    pub(crate) fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelAwareReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_reader_stops_after_cancel() {
        let cancel = CancellationToken::new();
        let mut reader = CancelAwareReader::new(&b"abcdef"[..], cancel.clone());

        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        cancel.cancel();
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_cancelled_or_prefers_cancellation() {
        let cancel = CancellationToken::new();
        let err = cancelled_or(&cancel, BackupError::archive_corrupt("x"));
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupt);

        cancel.cancel();
        let err = cancelled_or(&cancel, BackupError::archive_corrupt("x"));
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(ensure_not_cancelled(&cancel).is_err());
    }

    #[tokio::test]
    async fn test_abandonable_returns_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_blocking_abandonable(&cancel, || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_blocking_passes_result_through() {
        let value = run_blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }
}
