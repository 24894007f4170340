use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use metrics::counter;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{EndpointError, EndpointResult};

const ARTIFACT_PREFIX: &str = "bundle-";
const ARTIFACT_SUFFIX: &str = ".tmp";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SpoolState {
    artifacts: BTreeSet<PathBuf>,
    sealed: bool,
}

/// Copies streamed payloads into temporary files owned by one session.
///
/// Every path returned by a spool call is tracked until [`purge`](Self::purge)
/// deletes it, so the tracked set is exactly what the owner must clean up.
#[derive(Debug)]
pub struct PayloadSpooler {
    dir: PathBuf,
    state: Mutex<SpoolState>,
}

impl PayloadSpooler {
    /// Creates the private directory `dir` if needed.
    pub async fn create(dir: PathBuf) -> EndpointResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            state: Mutex::new(SpoolState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copies `reader` to end of stream into a fresh artifact.
    ///
    /// The reader is dropped before returning. On failure the partial file is
    /// removed and nothing is tracked.
    pub async fn spool_reader<R>(&self, mut reader: R) -> EndpointResult<PathBuf>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.state.lock().sealed {
            return Err(EndpointError::EndpointNotOpen);
        }

        let (file, temp_path) = tempfile::Builder::new()
            .prefix(ARTIFACT_PREFIX)
            .suffix(ARTIFACT_SUFFIX)
            .tempfile_in(&self.dir)?
            .into_parts();
        let mut writer = tokio::fs::File::from_std(file);
        let copied = tokio::io::copy(&mut reader, &mut writer).await;
        drop(reader);
        let copied = copied?;
        writer.flush().await?;
        drop(writer);

        let path = temp_path.keep().map_err(|err| err.error)?;
        {
            let mut state = self.state.lock();
            if !state.sealed {
                state.artifacts.insert(path.clone());
                debug!(
                    target: "bundle.spool",
                    path = %path.display(),
                    bytes = copied,
                    "spooled payload"
                );
                return Ok(path);
            }
        }

        // Sealed while copying: the owner has already purged.
        if let Err(err) = tokio::fs::remove_file(&path).await {
            counter!("bundle_service_artifact_delete_failures_total", 1);
            warn!(
                target: "bundle.spool",
                path = %path.display(),
                error = %err,
                "failed to delete artifact spooled after purge"
            );
        }
        self.remove_dir().await;
        Err(EndpointError::EndpointNotOpen)
    }

    pub async fn spool_file(&self, source: &Path) -> EndpointResult<PathBuf> {
        let file = tokio::fs::File::open(source).await.map_err(|err| {
            warn!(
                target: "bundle.spool",
                path = %source.display(),
                error = %err,
                "cannot open payload source"
            );
            err
        })?;
        self.spool_reader(file).await
    }

    pub async fn spool_bytes(&self, bytes: &[u8]) -> EndpointResult<PathBuf> {
        self.spool_reader(bytes).await
    }

    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.state.lock().artifacts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// Seals the spooler and deletes every tracked artifact, then the
    /// directory itself. A failed deletion is logged and does not stop the
    /// rest; the tracked set is empty afterwards either way.
    pub async fn purge(&self) -> PurgeReport {
        let artifacts = {
            let mut state = self.state.lock();
            state.sealed = true;
            std::mem::take(&mut state.artifacts)
        };

        let mut report = PurgeReport::default();
        for path in artifacts {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        target: "bundle.spool",
                        path = %path.display(),
                        "artifact already gone"
                    );
                    report.removed += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    counter!("bundle_service_artifact_delete_failures_total", 1);
                    warn!(
                        target: "bundle.spool",
                        path = %path.display(),
                        error = %err,
                        "failed to delete temporary artifact"
                    );
                }
            }
        }

        self.remove_dir().await;
        report
    }

    async fn remove_dir(&self) {
        if let Err(err) = tokio::fs::remove_dir(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    target: "bundle.spool",
                    dir = %self.dir.display(),
                    error = %err,
                    "failed to remove spool directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spooler() -> (tempfile::TempDir, PayloadSpooler) {
        let root = tempfile::tempdir().expect("tempdir");
        let spooler = PayloadSpooler::create(root.path().join("session"))
            .await
            .expect("spooler");
        (root, spooler)
    }

    #[tokio::test]
    async fn spooled_copy_is_tracked() {
        let (root, spooler) = spooler().await;
        let source = root.path().join("source.bin");
        tokio::fs::write(&source, b"large payload").await.unwrap();

        let path = spooler.spool_file(&source).await.expect("spooled");
        assert!(path.starts_with(spooler.dir()));
        assert_ne!(path, source);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"large payload");
        assert_eq!(spooler.artifacts(), vec![path]);
    }

    #[tokio::test]
    async fn each_spool_gets_a_fresh_artifact() {
        let (_root, spooler) = spooler().await;
        let first = spooler.spool_bytes(b"one").await.unwrap();
        let second = spooler.spool_bytes(b"one").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(spooler.len(), 2);
    }

    #[tokio::test]
    async fn missing_source_tracks_nothing() {
        let (root, spooler) = spooler().await;
        let err = spooler
            .spool_file(&root.path().join("absent.bin"))
            .await
            .expect_err("missing source");
        assert!(matches!(err, EndpointError::Io(_)));
        assert!(spooler.is_empty());
        let mut entries = tokio::fs::read_dir(spooler.dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn purge_deletes_everything_and_seals() {
        let (_root, spooler) = spooler().await;
        let kept = spooler.spool_bytes(b"a").await.unwrap();
        let vanished = spooler.spool_bytes(b"b").await.unwrap();
        tokio::fs::remove_file(&vanished).await.unwrap();

        let report = spooler.purge().await;
        assert_eq!(report, PurgeReport { removed: 2, failed: 0 });
        assert!(!kept.exists());
        assert!(spooler.is_empty());
        assert!(!spooler.dir().exists());

        let err = spooler.spool_bytes(b"late").await.expect_err("sealed");
        assert!(matches!(err, EndpointError::EndpointNotOpen));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_deletion_does_not_stop_the_rest() {
        let (_root, spooler) = spooler().await;
        let first = spooler.spool_bytes(b"a").await.unwrap();
        let second = spooler.spool_bytes(b"b").await.unwrap();

        // A directory in place of an artifact makes remove_file fail.
        tokio::fs::remove_file(&first).await.unwrap();
        tokio::fs::create_dir(&first).await.unwrap();

        let report = spooler.purge().await;
        assert_eq!(report, PurgeReport { removed: 1, failed: 1 });
        assert!(!second.exists());
        assert!(spooler.is_empty());
    }

    #[tokio::test]
    async fn spool_sealed_mid_copy_removes_its_file_and_the_directory() {
        let (_root, spooler) = spooler().await;
        let spooler = std::sync::Arc::new(spooler);
        let (mut writer, reader) = tokio::io::duplex(64);

        let copying = {
            let spooler = std::sync::Arc::clone(&spooler);
            tokio::spawn(async move { spooler.spool_reader(reader).await })
        };
        writer.write_all(b"partial").await.unwrap();
        while std::fs::read_dir(spooler.dir()).unwrap().next().is_none() {
            tokio::task::yield_now().await;
        }

        let report = spooler.purge().await;
        assert_eq!(report, PurgeReport::default());
        assert!(spooler.dir().exists());

        drop(writer);
        let err = copying.await.unwrap().expect_err("sealed mid-copy");
        assert!(matches!(err, EndpointError::EndpointNotOpen));
        assert!(spooler.is_empty());
        assert!(!spooler.dir().exists());
    }
}
