//! Top-level facade dispatching on `Reference::scheme`.
//!
//! `ocidist_cache.rs`'s `ClientBuilder`/`Client` split (`dir()`, `auth()`,
//! `load_from_disk()`, `build()`) is the model for the builder shape here;
//! where that client wraps one `ocidist::Client` in three caches, this one
//! wraps two `Scheme` backends (`reg`, `ocidir`) behind a dispatch table
//! keyed by `Reference::scheme()`, so every trait method is a one-line
//! delegation to whichever backend owns the reference.

use std::path::PathBuf;
use std::sync::Arc;

use oci_spec::image::Descriptor;

use crate::copy::{CopyOptions, ImageCopy};
use crate::error::Result;
use crate::hostconfig::{HostConfig, HostConfigTable};
use crate::manifest::Manifest;
use crate::queue::Queue;
use crate::reference::{Reference, Scheme as RefScheme};
use crate::reghttp::{CancelToken, Transport};
use crate::scheme::ocidir::OciDir;
use crate::scheme::reg::Reg;
use crate::scheme::{ListOptions, ReferrerList, RepoList, Scheme, TagList};

pub struct ClientBuilder {
    hosts: HostConfigTable,
    http: reqwest::Client,
    copy_concurrency: usize,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            hosts: HostConfigTable::new(),
            http: reqwest::Client::new(),
            copy_concurrency: 10,
        }
    }
}

impl ClientBuilder {
    /// Sets (or replaces) the configuration for one registry alias, e.g.
    /// `"ghcr.io"` or the `"docker.io"` alias.
    pub fn host(self, alias: impl Into<String>, config: HostConfig) -> Self {
        self.hosts.set(alias, config);
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Bounds concurrent blob-copy workers across every `ImageCopy` run
    /// from the built client.
    pub fn copy_concurrency(mut self, n: usize) -> Self {
        self.copy_concurrency = n;
        self
    }

    pub fn build(self) -> Client {
        let transport = Arc::new(Transport::new(self.http));
        Client {
            reg: Arc::new(Reg::new(transport, self.hosts.clone())),
            ocidir: Arc::new(OciDir::new()),
            hosts: self.hosts,
            copy_queue: Queue::new(self.copy_concurrency),
        }
    }
}

/// The library's single entry point: construct via [`Client::builder`],
/// then call the manifest/blob/tag/referrer operations or [`Client::image_copy`].
#[derive(Clone)]
pub struct Client {
    reg: Arc<Reg>,
    ocidir: Arc<OciDir>,
    hosts: HostConfigTable,
    copy_queue: Queue,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Per-registry configuration (TLS, credentials, mirrors, chunking,
    /// retry/backoff). Mutations are visible to in-flight requests
    /// immediately, per `HostConfigTable`'s copy-on-write discipline.
    pub fn set_host_config(&self, alias: impl Into<String>, config: HostConfig) {
        self.hosts.set(alias, config);
    }

    pub fn host_config(&self, alias: &str) -> HostConfig {
        self.hosts.get(alias)
    }

    pub(crate) fn scheme_for(&self, reference: &Reference) -> Arc<dyn Scheme> {
        match reference.scheme() {
            RefScheme::Reg => self.reg.clone(),
            RefScheme::OciDir => self.ocidir.clone(),
        }
    }

    pub async fn manifest_head(
        &self,
        reference: &Reference,
        cancel: &CancelToken,
    ) -> Result<Descriptor> {
        self.scheme_for(reference).manifest_head(reference, cancel).await
    }

    pub async fn manifest_get(&self, reference: &Reference, cancel: &CancelToken) -> Result<Manifest> {
        self.scheme_for(reference).manifest_get(reference, cancel).await
    }

    pub async fn manifest_put(
        &self,
        reference: &Reference,
        manifest: &Manifest,
        cancel: &CancelToken,
    ) -> Result<Descriptor> {
        self.scheme_for(reference)
            .manifest_put(reference, manifest, cancel)
            .await
    }

    pub async fn manifest_delete(&self, reference: &Reference, cancel: &CancelToken) -> Result<()> {
        self.scheme_for(reference).manifest_delete(reference, cancel).await
    }

    pub async fn blob_head(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<bool> {
        self.scheme_for(reference)
            .blob_head(reference, descriptor, cancel)
            .await
    }

    pub async fn blob_get(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        range: Option<(u64, Option<u64>)>,
        cancel: &CancelToken,
    ) -> Result<bytes::Bytes> {
        self.scheme_for(reference)
            .blob_get(reference, descriptor, range, cancel)
            .await
    }

    pub async fn blob_put(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        data: bytes::Bytes,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.scheme_for(reference)
            .blob_put(reference, descriptor, data, cancel)
            .await
    }

    /// Copies a blob from `source` to `target`, attempting a cross-repository
    /// mount first before falling back to stream copy.
    pub async fn blob_copy(
        &self,
        source: &Reference,
        target: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<()> {
        ImageCopy::copy_one_blob(self, source, target, descriptor, cancel).await
    }

    pub async fn blob_delete(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.scheme_for(reference)
            .blob_delete(reference, descriptor, cancel)
            .await
    }

    pub async fn tag_list(
        &self,
        reference: &Reference,
        options: ListOptions,
        cancel: &CancelToken,
    ) -> Result<TagList> {
        self.scheme_for(reference).tag_list(reference, options, cancel).await
    }

    pub async fn tag_delete(&self, reference: &Reference, cancel: &CancelToken) -> Result<()> {
        self.scheme_for(reference).tag_delete(reference, cancel).await
    }

    pub async fn repo_list(
        &self,
        reference: &Reference,
        options: ListOptions,
        cancel: &CancelToken,
    ) -> Result<RepoList> {
        self.scheme_for(reference).repo_list(options, cancel).await
    }

    /// Lists repositories on a bare registry host, bypassing the
    /// repository-scoped `Reference` shape `repo_list` otherwise requires.
    pub async fn repo_list_on(
        &self,
        registry: &str,
        options: ListOptions,
        cancel: &CancelToken,
    ) -> Result<RepoList> {
        Ok(self.reg.repo_list_on(registry, options, cancel).await?)
    }

    pub async fn referrer_list(
        &self,
        reference: &Reference,
        artifact_type: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ReferrerList> {
        self.scheme_for(reference)
            .referrer_list(reference, artifact_type, cancel)
            .await
    }

    pub async fn ping(&self, reference: &Reference, cancel: &CancelToken) -> Result<bool> {
        self.scheme_for(reference).ping(cancel).await
    }

    /// Pings a bare registry host, bypassing the repository-scoped
    /// `Reference` shape `/v2/` doesn't need.
    pub async fn ping_host(&self, registry: &str, cancel: &CancelToken) -> Result<bool> {
        Ok(self.reg.ping_host(registry, cancel).await?)
    }

    /// Copies `source` to `target`, descending into indexes, referrers, and
    /// digest-tags per `options`.
    pub async fn image_copy(
        &self,
        source: &Reference,
        target: &Reference,
        options: CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        ImageCopy::new(self.copy_queue.clone())
            .run(self, source, target, &options, cancel)
            .await
    }

    /// Copies `source` into a local OCI-layout directory at `dir`, tagging
    /// the result `tag` if one is given.
    pub async fn export(
        &self,
        source: &Reference,
        dir: impl Into<PathBuf>,
        tag: Option<&str>,
        options: CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        let target = ocidir_reference(dir.into(), tag)?;
        self.image_copy(source, &target, options, cancel).await
    }

    /// Copies an image out of a local OCI-layout directory at `dir` into
    /// `target`.
    pub async fn import(
        &self,
        dir: impl Into<PathBuf>,
        tag: Option<&str>,
        target: &Reference,
        options: CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        let source = ocidir_reference(dir.into(), tag)?;
        self.image_copy(&source, target, options, cancel).await
    }
}

fn ocidir_reference(dir: PathBuf, tag: Option<&str>) -> Result<Reference> {
    let path = dir.to_string_lossy();
    let s = match tag {
        Some(tag) => format!("ocidir://{path}:{tag}"),
        None => format!("ocidir://{path}"),
    };
    Reference::parse(&s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_to_anonymous_docker_hub() {
        let client = Client::builder().build();
        let cfg = client.host_config("docker.io");
        assert!(matches!(cfg.credentials, crate::hostconfig::Credentials::Anonymous));
    }

    #[test]
    fn set_host_config_is_visible_through_client() {
        let client = Client::builder().build();
        client.set_host_config(
            "ghcr.io",
            HostConfig::default().with_credentials(crate::hostconfig::Credentials::UserPass(
                "u".into(),
                "p".into(),
            )),
        );
        let cfg = client.host_config("ghcr.io");
        assert!(matches!(cfg.credentials, crate::hostconfig::Credentials::UserPass(u, p) if u == "u" && p == "p"));
    }

    #[test]
    fn ocidir_reference_with_tag_round_trips() {
        let r = ocidir_reference(PathBuf::from("/tmp/layout"), Some("mytag")).unwrap();
        assert_eq!(r.repository(), "/tmp/layout:mytag");
    }
}
