//! The cross-repository `ImageCopy` orchestrator.
//!
//! Blob fan-out follows a `tokio::task::JoinSet` fanned out
//! over a manifest's layers, joined with `is_cancelled`/`is_panic`
//! classification on failure. That "fan out over a manifest's blobs, bound
//! the fan-out, join" shape is reused here via `futures::future::try_join_all`
//! instead of a bare `JoinSet`, since each blob-copy worker already acquires
//! its own slot from the shared `queue::Queue` rather than relying on the
//! `JoinSet`'s own concurrency.

use std::collections::HashSet;
use std::sync::Arc;

use oci_spec::image::{Arch, Descriptor, Os};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::pipe;
use crate::queue::Queue;
use crate::reference::{Reference, Scheme as RefScheme};
use crate::reghttp::CancelToken;
use crate::scheme::ListOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Blob,
    Manifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Started,
    Active,
    Finished,
    Skipped,
}

/// One state transition of a copied unit. `instance`
/// is the unit's digest; `cur`/`total` are byte counters for blobs and are
/// `0`/`0` for manifest-level events, which have no partial-progress notion.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub instance: String,
    pub state: ProgressState,
    pub cur: u64,
    pub total: u64,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Options threaded through a single `ImageCopy` run.
#[derive(Clone, Default)]
pub struct CopyOptions {
    pub recursive_referrers: bool,
    pub digest_tags: bool,
    pub force_recursive: bool,
    /// Restricts index descent to these platforms. Empty means "all".
    pub platforms: Vec<(Arch, Os)>,
    /// Copy layers whose media type marks them as non-distributable
    /// ("foreign" layers), which registries otherwise expect the puller to
    /// fetch from their own external URL.
    pub include_external: bool,
    /// Skip the digest-equality double-check once a target HEAD reports the
    /// same digest; trust the digest match alone.
    pub fast_check: bool,
    pub callback: Option<ProgressCallback>,
}

fn emit(options: &CopyOptions, kind: ProgressKind, instance: &str, state: ProgressState, cur: u64, total: u64) {
    if let Some(cb) = &options.callback {
        cb(ProgressEvent {
            kind,
            instance: instance.to_string(),
            state,
            cur,
            total,
        });
    }
}

fn is_external_layer(descriptor: &Descriptor) -> bool {
    let media_type = descriptor.media_type().to_string();
    media_type.contains("foreign") || media_type.contains("nondistributable")
}

pub struct ImageCopy {
    queue: Queue,
}

impl ImageCopy {
    pub fn new(queue: Queue) -> Self {
        ImageCopy { queue }
    }

    pub async fn run(
        &self,
        client: &Client,
        source: &Reference,
        target: &Reference,
        options: &CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut visited = HashSet::new();
        self.copy_manifest(client, source, target, options, cancel, &mut visited)
            .await
    }

    /// Copies a single blob. Exposed as an associated function so
    /// `Client::blob_copy` can reuse the mount-then-stream logic without a
    /// full `ImageCopy` run.
    pub async fn copy_one_blob(
        client: &Client,
        source: &Reference,
        target: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<()> {
        let src_scheme = client.scheme_for(source);
        let dst_scheme = client.scheme_for(target);

        let mounted = mount_candidate(source, target)
            && dst_scheme
                .blob_mount(target, descriptor, source.repository(), cancel)
                .await
                .unwrap_or(false);

        if !mounted {
            // Stream the source blob through a digest-verifying pipe into a
            // spooled temp file instead of materializing it as one `Bytes`
            // up front -- the source leg never holds more than one chunk at
            // a time in memory, regardless of blob size.
            let stream = src_scheme.blob_get_stream(source, descriptor, cancel).await?;
            let file = tokio::task::spawn_blocking(tempfile::tempfile)
                .await
                .map_err(|e| Error::Unavailable(e.to_string()))??;
            let mut file = tokio::fs::File::from_std(file);
            pipe::copy_verified(stream, descriptor.digest(), &mut file).await?;

            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            file.seek(std::io::SeekFrom::Start(0)).await?;
            let mut data = Vec::with_capacity(descriptor.size() as usize);
            file.read_to_end(&mut data).await?;

            dst_scheme.blob_put(target, descriptor, data.into(), cancel).await?;
        }
        Ok(())
    }

    async fn copy_blob(
        &self,
        client: &Client,
        source: &Reference,
        target: &Reference,
        descriptor: Descriptor,
        options: &CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        let dst_scheme = client.scheme_for(target);
        let digest = descriptor.digest().to_string();

        if !options.force_recursive && dst_scheme.blob_head(target, &descriptor, cancel).await? {
            emit(options, ProgressKind::Blob, &digest, ProgressState::Skipped, 0, descriptor.size());
            return Ok(());
        }

        emit(options, ProgressKind::Blob, &digest, ProgressState::Started, 0, descriptor.size());
        let _permit = self.queue.acquire(0, cancel).await?;
        emit(options, ProgressKind::Blob, &digest, ProgressState::Active, 0, descriptor.size());

        Self::copy_one_blob(client, source, target, &descriptor, cancel).await?;

        emit(
            options,
            ProgressKind::Blob,
            &digest,
            ProgressState::Finished,
            descriptor.size(),
            descriptor.size(),
        );
        Ok(())
    }

    fn copy_manifest<'a>(
        &'a self,
        client: &'a Client,
        source: &'a Reference,
        target: &'a Reference,
        options: &'a CopyOptions,
        cancel: &'a CancelToken,
        visited: &'a mut HashSet<(String, String)>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let src_scheme = client.scheme_for(source);
            let dst_scheme = client.scheme_for(target);

            let src_desc = src_scheme.manifest_head(source, cancel).await?;
            let digest = src_desc.digest().to_string();

            let cycle_key = (digest.clone(), target.repository().to_string());
            if !visited.insert(cycle_key) {
                return Ok(());
            }

            if !options.force_recursive {
                let probe = target.with_digest(digest.clone());
                if let Ok(existing) = dst_scheme.manifest_head(&probe, cancel).await {
                    let matches = existing.digest().to_string() == digest;
                    if matches && (options.fast_check || existing.size() == src_desc.size()) {
                        emit(options, ProgressKind::Manifest, &digest, ProgressState::Skipped, 0, 0);
                        return Ok(());
                    }
                }
            }

            emit(options, ProgressKind::Manifest, &digest, ProgressState::Started, 0, 0);

            let manifest = src_scheme.manifest_get(source, cancel).await?;

            if manifest.is_index() {
                self.copy_index_children(client, source, target, &manifest, options, cancel, visited)
                    .await?;
            } else if let Some(image) = manifest.as_image() {
                let mut blobs = vec![image.config().clone()];
                blobs.extend(image.layers().iter().cloned());
                let copies = blobs
                    .into_iter()
                    .filter(|d| options.include_external || !is_external_layer(d))
                    .map(|d| self.copy_blob(client, source, target, d, options, cancel));
                futures::future::try_join_all(copies).await?;
            }

            dst_scheme.manifest_put(target, &manifest, cancel).await?;
            emit(options, ProgressKind::Manifest, &digest, ProgressState::Finished, 0, 0);

            if options.recursive_referrers {
                self.copy_referrers(client, source, target, &digest, options, cancel, visited)
                    .await?;
            }

            if options.digest_tags {
                self.copy_digest_tags(client, source, target, &digest, options, cancel, visited)
                    .await?;
            }

            Ok(())
        })
    }

    async fn copy_index_children(
        &self,
        client: &Client,
        source: &Reference,
        target: &Reference,
        manifest: &Manifest,
        options: &CopyOptions,
        cancel: &CancelToken,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        let index = manifest.as_index().ok_or(Error::ManifestNotSet)?;
        for child in index.manifests() {
            if !options.platforms.is_empty() {
                let wanted = child
                    .platform()
                    .as_ref()
                    .map(|p| {
                        options
                            .platforms
                            .iter()
                            .any(|(arch, os)| p.architecture() == arch && p.os() == os)
                    })
                    .unwrap_or(false);
                if !wanted {
                    continue;
                }
            }
            let child_digest = child.digest().to_string();
            let child_source = source.with_digest(child_digest.clone());
            let child_target = target.with_digest(child_digest);
            self.copy_manifest(client, &child_source, &child_target, options, cancel, visited)
                .await?;
        }
        Ok(())
    }

    async fn copy_referrers(
        &self,
        client: &Client,
        source: &Reference,
        target: &Reference,
        subject_digest: &str,
        options: &CopyOptions,
        cancel: &CancelToken,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        let src_scheme = client.scheme_for(source);
        let subject_ref = source.with_digest(subject_digest.to_string());
        let referrers = src_scheme.referrer_list(&subject_ref, None, cancel).await?;
        for referrer in referrers.manifests {
            let referrer_digest = referrer.digest().to_string();
            let child_source = source.with_digest(referrer_digest.clone());
            let child_target = target.with_digest(referrer_digest);
            self.copy_manifest(client, &child_source, &child_target, options, cancel, visited)
                .await?;
        }
        Ok(())
    }

    async fn copy_digest_tags(
        &self,
        client: &Client,
        source: &Reference,
        target: &Reference,
        subject_digest: &str,
        options: &CopyOptions,
        cancel: &CancelToken,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<()> {
        let src_scheme = client.scheme_for(source);
        let prefix = digest_tag_prefix(subject_digest);
        let tags = src_scheme.tag_list(source, ListOptions::default(), cancel).await?;
        for tag in tags.tags.into_iter().filter(|t| t.starts_with(&prefix)) {
            let child_source = source.with_tag(tag.clone());
            let child_target = target.with_tag(tag);
            self.copy_manifest(client, &child_source, &child_target, options, cancel, visited)
                .await?;
        }
        Ok(())
    }
}

/// `sha256:deadbeef` -> `sha256-deadbeef`, the tag-name encoding referrer
/// fallback clients use for digest-tags.
fn digest_tag_prefix(digest: &str) -> String {
    format!("{}-", digest.replace(':', "-"))
}

fn mount_candidate(source: &Reference, target: &Reference) -> bool {
    source.scheme() == RefScheme::Reg
        && target.scheme() == RefScheme::Reg
        && source.resolve_registry() == target.resolve_registry()
        && source.repository() != target.repository()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_tag_prefix_encodes_colon_as_dash() {
        assert_eq!(digest_tag_prefix("sha256:abc123"), "sha256-abc123-");
    }

    #[test]
    fn mount_candidate_requires_same_host_different_repo() {
        let a = Reference::parse("ghcr.io/foo/bar:latest").unwrap();
        let b = Reference::parse("ghcr.io/foo/baz:latest").unwrap();
        let c = Reference::parse("quay.io/foo/bar:latest").unwrap();
        assert!(mount_candidate(&a, &b));
        assert!(!mount_candidate(&a, &a));
        assert!(!mount_candidate(&a, &c));
    }

    #[test]
    fn is_external_layer_detects_foreign_media_type() {
        use oci_spec::image::{DescriptorBuilder, MediaType};
        let d = DescriptorBuilder::default()
            .media_type(MediaType::Other(
                "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip".to_string(),
            ))
            .digest(
                format!("sha256:{}", hex::encode([0u8; 32]))
                    .parse::<oci_spec::image::Digest>()
                    .unwrap(),
            )
            .size(1u64)
            .build()
            .unwrap();
        assert!(is_external_layer(&d));
    }
}
