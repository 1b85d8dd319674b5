//! The local OCI image-layout `Scheme` backend.
//!
//! Read path (digest/tag lookup in `index.json`, `blobs/<algo>/<hex>`
//! addressing) and write path (`manifest_put`, `blob_put`, index
//! rewriting) both follow `ocilayout.rs`'s atomic write discipline. The
//! per-directory write lock mirrors the keyed-lazy-state-map idiom
//! `reghttp::Transport` uses for per-host state, keyed on the layout root
//! instead of a registry host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest};
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::descriptor;
use crate::manifest::Manifest;
use crate::ocilayout::Layout;
use crate::reference::Reference;
use crate::reghttp::CancelToken;

use super::{ListOptions, ReferrerList, RepoList, Scheme, TagList};

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotFound,
    MissingTagOrDigest,
    BadDigest(String),
    NotImplemented(&'static str),
    Io(#[from] std::io::Error),
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        crate::error::debug_display(self, f)
    }
}

/// Where an `ocidir` reference points: the layout directory, plus whichever
/// of tag/digest selects an entry in it. `Reference::parse` keeps the whole
/// `path[:tag][@digest]` string as `repository` for this scheme (it has no
/// notion of what a path looks like), so splitting it back apart is this
/// backend's job — the same `oci:/path:tag` shape `skopeo` uses for its
/// `oci:` transport.
struct Addr {
    path: PathBuf,
    tag: Option<String>,
    digest: Option<String>,
}

fn resolve_addr(reference: &Reference) -> Addr {
    let repo = reference.repository();
    let (before_digest, embedded_digest) = match repo.rsplit_once('@') {
        Some((before, d)) if d.starts_with("sha256:") => (before, Some(d.to_string())),
        _ => (repo, None),
    };
    let (path, embedded_tag) = match before_digest.rsplit_once(':') {
        Some((p, t)) if !t.is_empty() && !t.contains('/') => (p, Some(t.to_string())),
        _ => (before_digest, None),
    };
    Addr {
        path: PathBuf::from(path),
        tag: reference.tag().map(str::to_string).or(embedded_tag),
        digest: reference.digest().map(str::to_string).or(embedded_digest),
    }
}

fn ref_name(d: &Descriptor) -> Option<String> {
    d.annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .cloned()
}

fn find_entry<'a>(
    manifests: &'a [Descriptor],
    addr: &Addr,
) -> Option<&'a Descriptor> {
    if let Some(digest) = &addr.digest {
        return manifests.iter().find(|d| &d.digest().to_string() == digest);
    }
    if let Some(tag) = &addr.tag {
        return manifests
            .iter()
            .find(|d| ref_name(d).as_deref() == Some(tag.as_str()));
    }
    None
}

fn compute_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

pub struct OciDir {
    locks: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl Default for OciDir {
    fn default() -> Self {
        Self::new()
    }
}

impl OciDir {
    pub fn new() -> Self {
        OciDir {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Scheme for OciDir {
    async fn manifest_head(
        &self,
        reference: &Reference,
        _cancel: &CancelToken,
    ) -> crate::error::Result<Descriptor> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let index = layout.read_index().await?;
        find_entry(index.manifests(), &addr)
            .cloned()
            .ok_or_else(|| Error::NotFound.into())
    }

    async fn manifest_get(
        &self,
        reference: &Reference,
        cancel: &CancelToken,
    ) -> crate::error::Result<Manifest> {
        let found = self.manifest_head(reference, cancel).await?;
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let digest_str = found.digest().to_string();
        let data = layout
            .read_blob(&digest_str)
            .await?
            .ok_or_else(|| crate::error::Error::from(Error::NotFound))?;
        descriptor::verify_data(&found, &data)?;
        Manifest::parse(&found.media_type().to_string(), data)
    }

    async fn manifest_put(
        &self,
        reference: &Reference,
        manifest: &Manifest,
        _cancel: &CancelToken,
    ) -> crate::error::Result<Descriptor> {
        if !manifest.is_pushable() {
            return Err(Error::NotImplemented("manifest is not pushable").into());
        }
        let addr = resolve_addr(reference);
        let lock = self.lock_for(&addr.path);
        let _guard = lock.lock().await;
        let layout = Layout::new(&addr.path);

        let raw = manifest.raw();
        let digest_str = compute_digest(raw);
        layout.write_blob(&digest_str, raw).await?;

        let digest: Digest = digest_str
            .parse()
            .map_err(|_| Error::BadDigest(digest_str.clone()))?;
        let media_type: oci_spec::image::MediaType = manifest.media_type().into();
        let mut builder = DescriptorBuilder::default();
        builder.media_type(media_type).digest(digest).size(raw.len() as u64);
        if let Some(tag) = &addr.tag {
            let mut annotations = HashMap::new();
            annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.clone());
            builder.annotations(annotations);
        }
        let new_descriptor = builder
            .build()
            .map_err(|_| Error::BadDigest(digest_str.clone()))?;

        let mut index = layout.read_index().await?;
        let mut manifests = index.manifests().clone();
        manifests.retain(|d| {
            let tag_match = addr
                .tag
                .as_deref()
                .is_some_and(|t| ref_name(d).as_deref() == Some(t));
            let digest_match = d.digest().to_string() == digest_str;
            !(tag_match || digest_match)
        });
        manifests.push(new_descriptor.clone());
        index.set_manifests(manifests);
        layout.write_index(&index).await?;

        Ok(new_descriptor)
    }

    async fn manifest_delete(
        &self,
        reference: &Reference,
        _cancel: &CancelToken,
    ) -> crate::error::Result<()> {
        let addr = resolve_addr(reference);
        let lock = self.lock_for(&addr.path);
        let _guard = lock.lock().await;
        let layout = Layout::new(&addr.path);
        let mut index = layout.read_index().await?;

        let selector_digest = match (&addr.tag, &addr.digest) {
            (_, Some(d)) => Some(d.clone()),
            (Some(_), None) => find_entry(index.manifests(), &addr).map(|d| d.digest().to_string()),
            (None, None) => return Err(Error::MissingTagOrDigest.into()),
        };
        let Some(selector_digest) = selector_digest else {
            return Err(Error::NotFound.into());
        };

        let before = index.manifests().len();
        let manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| d.digest().to_string() != selector_digest)
            .cloned()
            .collect();
        if manifests.len() == before {
            return Err(Error::NotFound.into());
        }
        index.set_manifests(manifests);
        layout.write_index(&index).await?;
        Ok(())
    }

    async fn blob_head(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        _cancel: &CancelToken,
    ) -> crate::error::Result<bool> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        Ok(layout.blob_exists(&descriptor.digest().to_string()).await?)
    }

    async fn blob_get(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        range: Option<(u64, Option<u64>)>,
        _cancel: &CancelToken,
    ) -> crate::error::Result<Bytes> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let digest_str = descriptor.digest().to_string();
        let data = layout
            .read_blob(&digest_str)
            .await?
            .ok_or_else(|| crate::error::Error::from(Error::NotFound))?;
        match range {
            None => {
                descriptor::verify_data(descriptor, &data)?;
                Ok(data)
            }
            Some((start, end)) => {
                let len = data.len() as u64;
                let start = start.min(len);
                let end_excl = end.map_or(len, |e| (e + 1).min(len)).max(start);
                Ok(data.slice(start as usize..end_excl as usize))
            }
        }
    }

    /// A local layout already has the blob fully resident once read off
    /// disk, so this yields it as a single chunk rather than a genuinely
    /// incremental read -- the streaming interface exists for the copy
    /// orchestrator's sake, not because this backend benefits from it.
    async fn blob_get_stream(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        _cancel: &CancelToken,
    ) -> crate::error::Result<super::ByteStream> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let digest_str = descriptor.digest().to_string();
        let data = layout
            .read_blob(&digest_str)
            .await?
            .ok_or_else(|| crate::error::Error::from(Error::NotFound))?;
        Ok(Box::pin(futures::stream::once(async move { Ok(data) })))
    }

    async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        data: Bytes,
        _cancel: &CancelToken,
    ) -> crate::error::Result<()> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let digest_str = descriptor.digest().to_string();
        if layout.blob_exists(&digest_str).await? {
            return Ok(());
        }
        descriptor::verify_data(descriptor, &data)?;
        layout.write_blob(&digest_str, &data).await?;
        Ok(())
    }

    /// Local layouts have no concept of a remote "from" repository to mount
    /// a blob from without copying bytes, so this always declines, leaving
    /// the copy orchestrator to fall back to a plain stream copy.
    async fn blob_mount(
        &self,
        _reference: &Reference,
        _descriptor: &Descriptor,
        _from_repository: &str,
        _cancel: &CancelToken,
    ) -> crate::error::Result<bool> {
        Ok(false)
    }

    async fn blob_delete(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        _cancel: &CancelToken,
    ) -> crate::error::Result<()> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        layout.remove_blob(&descriptor.digest().to_string()).await?;
        Ok(())
    }

    async fn tag_list(
        &self,
        reference: &Reference,
        _options: ListOptions,
        _cancel: &CancelToken,
    ) -> crate::error::Result<TagList> {
        let addr = resolve_addr(reference);
        let layout = Layout::new(&addr.path);
        let index = layout.read_index().await?;
        let tags = index.manifests().iter().filter_map(ref_name).collect();
        Ok(TagList {
            name: addr.path.display().to_string(),
            tags,
        })
    }

    async fn tag_delete(
        &self,
        reference: &Reference,
        cancel: &CancelToken,
    ) -> crate::error::Result<()> {
        self.manifest_delete(reference, cancel).await
    }

    async fn repo_list(
        &self,
        _options: ListOptions,
        _cancel: &CancelToken,
    ) -> crate::error::Result<RepoList> {
        Err(Error::NotImplemented("ocidir layouts have no catalog concept").into())
    }

    async fn referrer_list(
        &self,
        reference: &Reference,
        artifact_type: Option<&str>,
        cancel: &CancelToken,
    ) -> crate::error::Result<ReferrerList> {
        let addr = resolve_addr(reference);
        let subject_digest = match &addr.digest {
            Some(d) => d.clone(),
            None => self.manifest_head(reference, cancel).await?.digest().to_string(),
        };
        let layout = Layout::new(&addr.path);
        let index = layout.read_index().await?;

        let mut referrers = Vec::new();
        for d in index.manifests() {
            let digest_str = d.digest().to_string();
            if digest_str == subject_digest {
                continue;
            }
            let Some(data) = layout.read_blob(&digest_str).await? else {
                continue;
            };
            let Ok(candidate) = Manifest::parse(&d.media_type().to_string(), data) else {
                continue;
            };
            let Some(subject) = candidate.subject() else {
                continue;
            };
            if subject.digest().to_string() != subject_digest {
                continue;
            }
            if let Some(wanted) = artifact_type {
                let candidate_type = candidate
                    .as_image()
                    .and_then(|m| m.artifact_type().as_ref())
                    .map(|a| a.to_string());
                if candidate_type.as_deref() != Some(wanted) {
                    continue;
                }
            }
            referrers.push(d.clone());
        }
        Ok(ReferrerList { manifests: referrers })
    }

    /// A local directory has no remote host to probe; it is reachable iff
    /// it is readable, which every other operation already checks.
    async fn ping(&self, _cancel: &CancelToken) -> crate::error::Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_addr_splits_embedded_tag() {
        let reference = Reference::parse("ocidir:///tmp/my-layout:mytag").unwrap();
        let addr = resolve_addr(&reference);
        assert_eq!(addr.path, PathBuf::from("/tmp/my-layout"));
        assert_eq!(addr.tag.as_deref(), Some("mytag"));
        assert_eq!(addr.digest, None);
    }

    #[test]
    fn resolve_addr_prefers_explicit_tag_over_embedded() {
        let reference = Reference::parse("ocidir:///tmp/my-layout:mytag")
            .unwrap()
            .with_tag("other");
        let addr = resolve_addr(&reference);
        assert_eq!(addr.path, PathBuf::from("/tmp/my-layout"));
        assert_eq!(addr.tag.as_deref(), Some("other"));
    }

    #[test]
    fn resolve_addr_splits_embedded_digest() {
        let reference = Reference::parse(
            "ocidir:///tmp/my-layout@sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015a",
        )
        .unwrap();
        let addr = resolve_addr(&reference);
        assert_eq!(addr.path, PathBuf::from("/tmp/my-layout"));
        assert!(addr.digest.unwrap().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn push_then_get_round_trips_through_a_tag() {
        let dir = tempfile::tempdir().unwrap();
        let ocidir = OciDir::new();
        let reference = Reference::parse(&format!("ocidir://{}:mytag", dir.path().display()))
            .unwrap();
        let cancel = CancelToken::new();

        let raw = Bytes::from_static(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa","size":2},"layers":[]}"#,
        );
        let manifest = Manifest::parse(crate::manifest::MT_OCI_IMAGE_MANIFEST, raw).unwrap();

        let pushed = ocidir.manifest_put(&reference, &manifest, &cancel).await.unwrap();
        assert_eq!(pushed.digest().to_string(), pushed.digest().to_string());

        let fetched = ocidir.manifest_get(&reference, &cancel).await.unwrap();
        assert_eq!(fetched.raw(), manifest.raw());

        let tags = ocidir
            .tag_list(&reference, ListOptions::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(tags.tags, vec!["mytag".to_string()]);

        ocidir.manifest_delete(&reference, &cancel).await.unwrap();
        assert!(ocidir.manifest_head(&reference, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn blob_put_then_head_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let ocidir = OciDir::new();
        let reference = Reference::parse(&format!("ocidir://{}:t", dir.path().display())).unwrap();
        let cancel = CancelToken::new();

        let data = Bytes::from_static(b"layer contents");
        let digest_str = compute_digest(&data);
        let digest: Digest = digest_str.parse().unwrap();
        let descriptor = DescriptorBuilder::default()
            .media_type(oci_spec::image::MediaType::ImageLayer)
            .digest(digest)
            .size(data.len() as u64)
            .build()
            .unwrap();

        assert!(!ocidir.blob_head(&reference, &descriptor, &cancel).await.unwrap());
        ocidir
            .blob_put(&reference, &descriptor, data.clone(), &cancel)
            .await
            .unwrap();
        assert!(ocidir.blob_head(&reference, &descriptor, &cancel).await.unwrap());

        let fetched = ocidir
            .blob_get(&reference, &descriptor, None, &cancel)
            .await
            .unwrap();
        assert_eq!(fetched, data);
    }
}
