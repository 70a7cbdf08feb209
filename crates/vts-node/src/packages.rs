use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub(crate) enum PackageError {
    #[error("{0}")]
    Invalid(String),
    #[error("package {0} not found")]
    Missing(String),
    #[error("package store i/o: {0}")]
    Io(String),
}

/// Installable packages uploaded by the hub, kept until it discards them.
pub(crate) struct PackageStore {
    root: PathBuf,
}

impl PackageStore {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) async fn create(&self, file_name: &str) -> Result<PackageWriter, PackageError> {
        let is_apk = Path::new(file_name)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("apk"))
            .unwrap_or(false);
        if !is_apk {
            return Err(PackageError::Invalid(format!(
                "only .apk packages can be installed, got {file_name:?}"
            )));
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PackageError::Io(format!("create {}: {e}", self.root.display())))?;
        let package_ref = format!("{}.apk", Uuid::new_v4());
        let path = self.root.join(&package_ref);
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| PackageError::Io(format!("create {}: {e}", path.display())))?;
        debug!(package_ref = %package_ref, source = %file_name, "receiving package");
        Ok(PackageWriter {
            file,
            path,
            package_ref,
            size: 0,
        })
    }

    /// Maps a reference handed out by [`PackageStore::create`] back to its file.
    pub(crate) fn resolve(&self, package_ref: &str) -> Result<PathBuf, PackageError> {
        let stem = package_ref
            .strip_suffix(".apk")
            .ok_or_else(|| PackageError::Invalid(format!("malformed package ref {package_ref:?}")))?;
        Uuid::parse_str(stem)
            .map_err(|_| PackageError::Invalid(format!("malformed package ref {package_ref:?}")))?;
        let path = self.root.join(package_ref);
        if path.is_file() {
            Ok(path)
        } else {
            Err(PackageError::Missing(package_ref.to_string()))
        }
    }

    pub(crate) async fn discard(&self, package_ref: &str) -> Result<(), PackageError> {
        let path = self.resolve(package_ref)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| PackageError::Io(format!("remove {}: {e}", path.display())))?;
        info!(package_ref = %package_ref, "package discarded");
        Ok(())
    }
}

pub(crate) struct PackageWriter {
    file: tokio::fs::File,
    path: PathBuf,
    package_ref: String,
    size: u64,
}

impl PackageWriter {
    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), PackageError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| PackageError::Io(format!("write {}: {e}", self.path.display())))?;
        self.size += data.len() as u64;
        Ok(())
    }

    /// Returns the package reference and its size in bytes.
    pub(crate) async fn finish(mut self) -> Result<(String, u64), PackageError> {
        if self.size == 0 {
            self.abandon().await;
            return Err(PackageError::Invalid("uploaded package is empty".into()));
        }
        self.file
            .flush()
            .await
            .map_err(|e| PackageError::Io(format!("flush {}: {e}", self.path.display())))?;
        info!(package_ref = %self.package_ref, size = self.size, "package stored");
        Ok((self.package_ref, self.size))
    }

    pub(crate) async fn abandon(self) {
        drop(self.file);
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            debug!(file = %self.path.display(), "failed to remove partial package: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stored_package_resolves_until_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::new(dir.path().join("packages"));

        let mut writer = store.create("app-release.APK").await.unwrap();
        writer.write(b"PK\x03\x04").await.unwrap();
        writer.write(b"rest").await.unwrap();
        let (package_ref, size) = writer.finish().await.unwrap();
        assert_eq!(size, 8);

        let path = store.resolve(&package_ref).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK\x03\x04rest");

        store.discard(&package_ref).await.unwrap();
        assert!(matches!(
            store.resolve(&package_ref),
            Err(PackageError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_apk_and_empty_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackageStore::new(dir.path().to_path_buf());

        assert!(matches!(
            store.create("bundle.aab").await,
            Err(PackageError::Invalid(_))
        ));

        let writer = store.create("empty.apk").await.unwrap();
        assert!(matches!(
            writer.finish().await,
            Err(PackageError::Invalid(_))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn refs_cannot_escape_the_store() {
        let store = PackageStore::new(PathBuf::from("/var/lib/vts/packages"));
        for bad in ["../../etc/passwd", "../x.apk", "abc.apk", "", "/etc/hosts.apk"] {
            assert!(
                matches!(store.resolve(bad), Err(PackageError::Invalid(_))),
                "{bad}"
            );
        }
    }
}
